//! Database helpers for access and refresh token state.
//!
//! Every lifecycle transition is a single conditional statement so concurrent
//! server processes observe the same outcome: claiming a refresh token races
//! on `used_at IS NULL`, family revocation is one bulk UPDATE keyed by
//! `token_family_id`, and expiry is a stored timestamp compared at query time.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::net::IpAddr;
use tracing::Instrument;
use uuid::Uuid;

use super::models::{AccessTokenRecord, RefreshTokenRecord};

pub struct TokenRepo;

impl TokenRepo {
    /// Insert the revocation/audit row for a freshly signed access token.
    pub async fn insert_access_token(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        jti: Uuid,
        user_id: Uuid,
        ttl_seconds: i64,
    ) -> Result<()> {
        let query = r"
            INSERT INTO access_tokens (jti, user_id, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(jti)
            .bind(user_id)
            .bind(ttl_seconds)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to insert access token record")?;
        Ok(())
    }

    /// Insert a refresh token row, generating the raw token here so only its
    /// hash ever reaches the database. Returns the raw token for the cookie.
    pub async fn insert_refresh_token(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
        token_family_id: Uuid,
        parent_id: Option<Uuid>,
        ttl_seconds: i64,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<String> {
        let query = r"
            INSERT INTO refresh_tokens
                (token_hash, user_id, token_family_id, parent_id, expires_at, ip, user_agent)
            VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 second'), $6, $7)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );

        for _ in 0..3 {
            let token = generate_refresh_token()?;
            let token_hash = hash_refresh_token(&token);
            let result = sqlx::query(query)
                .bind(token_hash)
                .bind(user_id)
                .bind(token_family_id)
                .bind(parent_id)
                .bind(ttl_seconds)
                .bind(ip)
                .bind(user_agent)
                .execute(&mut **tx)
                .instrument(span.clone())
                .await;

            match result {
                Ok(_) => return Ok(token),
                Err(err) if is_unique_violation(&err) => {}
                Err(err) => return Err(err).context("failed to insert refresh token"),
            }
        }

        Err(anyhow!("failed to generate unique refresh token"))
    }

    /// Atomically consume an unused, unexpired, unrevoked refresh token.
    /// Exactly one of any set of racing calls gets the row back; the losers
    /// see `None` and must inspect the row to classify the replay.
    pub async fn claim_refresh_token(
        pool: &PgPool,
        token_hash: &[u8],
    ) -> Result<Option<RefreshTokenRecord>> {
        let query = r"
            UPDATE refresh_tokens
            SET used_at = NOW()
            WHERE token_hash = $1
              AND used_at IS NULL
              AND revoked_at IS NULL
              AND expires_at > NOW()
            RETURNING id, user_id, token_family_id, parent_id, issued_at, expires_at,
                      revoked_at, used_at, ip, user_agent
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query_as::<_, RefreshTokenRecord>(query)
            .bind(token_hash)
            .fetch_optional(pool)
            .instrument(span)
            .await
            .context("failed to claim refresh token")
    }

    /// Fetch a refresh token row without touching it.
    pub async fn find_refresh_token(
        pool: &PgPool,
        token_hash: &[u8],
    ) -> Result<Option<RefreshTokenRecord>> {
        let query = r"
            SELECT id, user_id, token_family_id, parent_id, issued_at, expires_at,
                   revoked_at, used_at, ip, user_agent
            FROM refresh_tokens
            WHERE token_hash = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, RefreshTokenRecord>(query)
            .bind(token_hash)
            .fetch_optional(pool)
            .instrument(span)
            .await
            .context("failed to fetch refresh token")
    }

    /// Revoke every refresh token descended from one login. One bulk
    /// conditional UPDATE; already-revoked rows stay untouched.
    pub async fn revoke_family(pool: &PgPool, token_family_id: Uuid) -> Result<u64> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = NOW()
            WHERE token_family_id = $1
              AND revoked_at IS NULL
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(token_family_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to revoke token family")?;
        Ok(result.rows_affected())
    }

    /// Revoke a single access token record by `jti`.
    pub async fn revoke_access_token(pool: &PgPool, jti: Uuid) -> Result<bool> {
        let query = r"
            UPDATE access_tokens
            SET revoked_at = NOW()
            WHERE jti = $1
              AND revoked_at IS NULL
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(jti)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to revoke access token")?;
        Ok(result.rows_affected() > 0)
    }

    /// Check whether an access token record is still live. The signature was
    /// already verified; this catches selective revocation.
    pub async fn find_access_token(pool: &PgPool, jti: Uuid) -> Result<Option<AccessTokenRecord>> {
        let query = r"
            SELECT jti, user_id, issued_at, expires_at, revoked_at
            FROM access_tokens
            WHERE jti = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, AccessTokenRecord>(query)
            .bind(jti)
            .fetch_optional(pool)
            .instrument(span)
            .await
            .context("failed to fetch access token record")
    }
}

/// Generate an opaque refresh token: 32 random bytes, base64url without
/// padding.
///
/// # Errors
///
/// Returns an error if the OS random source fails.
pub(crate) fn generate_refresh_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a refresh token so raw values never touch the database.
/// The hash is used for lookups when the cookie is presented.
pub(crate) fn hash_refresh_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Decode a presented refresh token, rejecting anything that is not exactly
/// 32 base64url bytes before the database is consulted.
pub(crate) fn is_well_formed_refresh_token(token: &str) -> bool {
    match URL_SAFE_NO_PAD.decode(token.as_bytes()) {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}

/// True when the error is a Postgres unique constraint violation (23505).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_and_url_safe() -> Result<()> {
        let first = generate_refresh_token()?;
        let second = generate_refresh_token()?;
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert!(
            first
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        Ok(())
    }

    #[test]
    fn hash_is_stable_and_token_free() -> Result<()> {
        let token = generate_refresh_token()?;
        let first = hash_refresh_token(&token);
        let second = hash_refresh_token(&token);
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(!String::from_utf8_lossy(&first).contains(&token));
        Ok(())
    }

    #[test]
    fn well_formed_accepts_generated_tokens() -> Result<()> {
        let token = generate_refresh_token()?;
        assert!(is_well_formed_refresh_token(&token));
        Ok(())
    }

    #[test]
    fn well_formed_rejects_garbage() {
        assert!(!is_well_formed_refresh_token(""));
        assert!(!is_well_formed_refresh_token("short"));
        assert!(!is_well_formed_refresh_token("!!!!not-base64url!!!!"));
        let truncated = URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(!is_well_formed_refresh_token(&truncated));
    }
}
