//! Database helpers for email code challenges.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::net::IpAddr;
use tracing::Instrument;
use uuid::Uuid;

use super::models::AuthChallenge;

pub struct OtpRepo;

impl OtpRepo {
    /// Insert a challenge row, generating the opaque challenge token here so
    /// only its hash is stored. Runs inside the caller's transaction so the
    /// row and the outbox email commit together.
    pub async fn insert_challenge(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        email: &str,
        code_hash: &[u8],
        max_attempts: i32,
        ttl_seconds: i64,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<String> {
        let query = r"
            INSERT INTO auth_challenges
                (challenge_token_hash, email, code_hash, max_attempts, expires_at, ip, user_agent)
            VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 second'), $6, $7)
            ON CONFLICT (challenge_token_hash) DO NOTHING
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );

        // ON CONFLICT keeps the transaction healthy on a token-hash collision
        // so we can just generate a fresh token and try again.
        for _ in 0..3 {
            let token = generate_challenge_token()?;
            let token_hash = hash_challenge_token(&token);
            let result = sqlx::query(query)
                .bind(token_hash)
                .bind(email)
                .bind(code_hash)
                .bind(max_attempts)
                .bind(ttl_seconds)
                .bind(ip)
                .bind(user_agent)
                .execute(&mut **tx)
                .instrument(span.clone())
                .await
                .context("failed to insert auth challenge")?;
            if result.rows_affected() > 0 {
                return Ok(token);
            }
        }

        Err(anyhow!("failed to generate unique challenge token"))
    }

    /// Look up a challenge by token hash and email, without filtering on
    /// expiry or use. Callers need the dead row to report `expired` instead
    /// of pretending the challenge never existed.
    pub async fn find_challenge(
        pool: &PgPool,
        challenge_token_hash: &[u8],
        email: &str,
    ) -> Result<Option<AuthChallenge>> {
        let query = r"
            SELECT id, email, code_hash, attempts, max_attempts, expires_at, used_at, created_at
            FROM auth_challenges
            WHERE challenge_token_hash = $1
              AND email = $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, AuthChallenge>(query)
            .bind(challenge_token_hash)
            .bind(email)
            .fetch_optional(pool)
            .instrument(span)
            .await
            .context("failed to fetch auth challenge")
    }

    /// Atomically spend one verification attempt and return the new count
    /// alongside the cap. The increment happens before the code comparison so
    /// racing attempts cannot share a slot of the budget.
    pub async fn increment_attempts(
        pool: &PgPool,
        challenge_id: Uuid,
    ) -> Result<Option<(i32, i32)>> {
        let query = r"
            UPDATE auth_challenges
            SET attempts = attempts + 1
            WHERE id = $1
            RETURNING attempts, max_attempts
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query_as::<_, (i32, i32)>(query)
            .bind(challenge_id)
            .fetch_optional(pool)
            .instrument(span)
            .await
            .context("failed to count verification attempt")
    }

    /// Enqueue the code email in the outbox, inside the same transaction as
    /// the challenge insert so the emailed code always matches the stored
    /// hash.
    pub async fn enqueue_code_email(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        to_email: &str,
        template: &str,
        payload_json: &str,
    ) -> Result<()> {
        let query = r"
            INSERT INTO email_outbox (to_email, template, payload_json)
            VALUES ($1, $2, $3::jsonb)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(to_email)
            .bind(template)
            .bind(payload_json)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to enqueue code email")?;
        Ok(())
    }

    /// Consume a challenge. Only one of any set of racing callers sees
    /// `true`; the rest find `used_at` already set.
    pub async fn mark_used(pool: &PgPool, challenge_id: Uuid) -> Result<bool> {
        let query = r"
            UPDATE auth_challenges
            SET used_at = NOW()
            WHERE id = $1
              AND used_at IS NULL
              AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(challenge_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to mark auth challenge used")?;
        Ok(result.rows_affected() > 0)
    }

    /// Find the user for an email, creating the account on first login.
    pub async fn resolve_user(pool: &PgPool, email: &str) -> Result<Uuid> {
        let query = r"
            WITH created AS (
                INSERT INTO users (email)
                VALUES ($1)
                ON CONFLICT (email) DO NOTHING
                RETURNING id
            )
            SELECT id FROM created
            UNION ALL
            SELECT id FROM users WHERE email = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query_scalar::<_, Uuid>(query)
            .bind(email)
            .fetch_one(pool)
            .instrument(span)
            .await
            .context("failed to resolve user for email")
    }

    /// Drop challenge rows that expired over a day ago. Recently expired rows
    /// are kept so a late verify still reports `expired` rather than
    /// `invalid`.
    pub async fn delete_stale(pool: &PgPool) -> Result<u64> {
        let query = r"
            DELETE FROM auth_challenges
            WHERE expires_at < NOW() - INTERVAL '1 day'
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to delete stale auth challenges")?;
        Ok(result.rows_affected())
    }
}

/// Create the opaque challenge token handed to the client.
/// The database stores only its hash.
pub(crate) fn generate_challenge_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate challenge token")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a challenge token for storage or lookup.
pub(crate) fn hash_challenge_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Check the shape of a presented challenge token before hitting the
/// database: exactly 32 base64url bytes.
pub(crate) fn is_well_formed_challenge_token(token: &str) -> bool {
    match URL_SAFE_NO_PAD.decode(token.as_bytes()) {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_tokens_are_unique_and_url_safe() -> Result<()> {
        let first = generate_challenge_token()?;
        let second = generate_challenge_token()?;
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
    fn challenge_token_hash_is_stable() -> Result<()> {
        let token = generate_challenge_token()?;
        assert_eq!(hash_challenge_token(&token), hash_challenge_token(&token));
        assert_eq!(hash_challenge_token(&token).len(), 32);
        Ok(())
    }
}
