use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{ChallengeKind, PasskeyChallengeRecord, PasskeyRecord, PasskeySummary};

pub struct PasskeyRepo;

impl PasskeyRepo {
    /// Persist a freshly verified credential. Returns `None` when the
    /// credential id is already registered.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn create_passkey(
        pool: &PgPool,
        user_id: Uuid,
        credential_id: &[u8],
        public_key: &[u8],
        transports: Option<&str>,
        name: Option<&str>,
        device_type: &str,
        backed_up: bool,
    ) -> Result<Option<PasskeySummary>> {
        sqlx::query_as::<_, PasskeySummary>(
            r"
            INSERT INTO passkeys
                (user_id, credential_id, public_key, transports, name, device_type, backed_up)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (credential_id) DO NOTHING
            RETURNING id, name, created_at, last_used_at
            ",
        )
        .bind(user_id)
        .bind(credential_id)
        .bind(public_key)
        .bind(transports)
        .bind(name)
        .bind(device_type)
        .bind(backed_up)
        .fetch_optional(pool)
        .await
        .context("Failed to insert passkey")
    }

    /// Gets a stored credential by its WebAuthn credential ID.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn find_by_credential_id(
        pool: &PgPool,
        credential_id: &[u8],
    ) -> Result<Option<PasskeyRecord>> {
        sqlx::query_as::<_, PasskeyRecord>("SELECT * FROM passkeys WHERE credential_id = $1")
            .bind(credential_id)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch passkey")
    }

    /// Lists a user's passkeys, newest first.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn list_user_passkeys(pool: &PgPool, user_id: Uuid) -> Result<Vec<PasskeySummary>> {
        sqlx::query_as::<_, PasskeySummary>(
            r"
            SELECT id, name, created_at, last_used_at
            FROM passkeys
            WHERE user_id = $1
            ORDER BY created_at DESC
            ",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .context("Failed to list passkeys")
    }

    /// Records a successful authentication: bumps the counter, refreshes the
    /// serialized credential and device attributes, and touches
    /// `last_used_at`.
    ///
    /// The counter guard makes the write conditional; a stale or duplicated
    /// assertion loses the race and gets `false` back. Zero stays an accepted
    /// counter because many platform authenticators never increment it.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn record_authentication(
        pool: &PgPool,
        passkey_id: Uuid,
        counter: i64,
        public_key: &[u8],
        device_type: &str,
        backed_up: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE passkeys
            SET counter = $2,
                public_key = $3,
                device_type = $4,
                backed_up = $5,
                last_used_at = NOW()
            WHERE id = $1
              AND (counter < $2 OR (counter = 0 AND $2 = 0))
            ",
        )
        .bind(passkey_id)
        .bind(counter)
        .bind(public_key)
        .bind(device_type)
        .bind(backed_up)
        .execute(pool)
        .await
        .context("Failed to record passkey authentication")?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes a passkey owned by the user.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn delete_passkey(pool: &PgPool, user_id: Uuid, passkey_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM passkeys WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(passkey_id)
            .execute(pool)
            .await
            .context("Failed to delete passkey")?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch a user's email for the registration ceremony's user entity.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn find_user_email(pool: &PgPool, user_id: Uuid) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch user email")
    }

    /// Store an in-progress ceremony, generating the opaque challenge token
    /// handed to the client. Only the token hash is persisted.
    ///
    /// # Errors
    /// Returns error if the database query fails or token generation keeps
    /// colliding.
    pub async fn insert_challenge(
        pool: &PgPool,
        user_id: Option<Uuid>,
        kind: ChallengeKind,
        state_json: &str,
        ttl_seconds: i64,
    ) -> Result<String> {
        let query = r"
            INSERT INTO passkey_challenges (user_id, challenge_token_hash, state, kind, expires_at)
            VALUES ($1, $2, $3::jsonb, $4, NOW() + ($5 * INTERVAL '1 second'))
            ON CONFLICT (challenge_token_hash) DO NOTHING
        ";

        for _ in 0..3 {
            let token = generate_challenge_token()?;
            let token_hash = hash_challenge_token(&token);
            let result = sqlx::query(query)
                .bind(user_id)
                .bind(token_hash)
                .bind(state_json)
                .bind(kind.as_str())
                .bind(ttl_seconds)
                .execute(pool)
                .await
                .context("Failed to insert passkey challenge")?;
            if result.rows_affected() > 0 {
                return Ok(token);
            }
        }

        Err(anyhow!("failed to generate unique passkey challenge token"))
    }

    /// Atomically consume a live challenge of the given kind. Racing callers
    /// get `None` once the first one wins.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn consume_challenge(
        pool: &PgPool,
        challenge_token_hash: &[u8],
        kind: ChallengeKind,
    ) -> Result<Option<PasskeyChallengeRecord>> {
        sqlx::query_as::<_, PasskeyChallengeRecord>(
            r"
            UPDATE passkey_challenges
            SET used_at = NOW()
            WHERE challenge_token_hash = $1
              AND kind = $2
              AND used_at IS NULL
              AND expires_at > NOW()
            RETURNING id, user_id, state::text AS state, kind, expires_at, used_at, created_at
            ",
        )
        .bind(challenge_token_hash)
        .bind(kind.as_str())
        .fetch_optional(pool)
        .await
        .context("Failed to consume passkey challenge")
    }

    /// Check whether a challenge row exists at all, dead or alive. Used to
    /// tell an expired challenge apart from one that never existed.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn challenge_exists(
        pool: &PgPool,
        challenge_token_hash: &[u8],
        kind: ChallengeKind,
    ) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM passkey_challenges WHERE challenge_token_hash = $1 AND kind = $2",
        )
        .bind(challenge_token_hash)
        .bind(kind.as_str())
        .fetch_optional(pool)
        .await
        .context("Failed to check passkey challenge")?;
        Ok(found.is_some())
    }

    /// Drop challenge rows that expired over a day ago.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn delete_stale_challenges(pool: &PgPool) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM passkey_challenges WHERE expires_at < NOW() - INTERVAL '1 day'")
                .execute(pool)
                .await
                .context("Failed to delete stale passkey challenges")?;
        Ok(result.rows_affected())
    }
}

/// Create the opaque token correlating a client with its stored ceremony.
pub(super) fn generate_challenge_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate passkey challenge token")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a challenge token for storage or lookup.
pub(super) fn hash_challenge_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Shape check before the database is consulted: exactly 32 base64url bytes.
pub(super) fn is_well_formed_challenge_token(token: &str) -> bool {
    match URL_SAFE_NO_PAD.decode(token.as_bytes()) {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}
