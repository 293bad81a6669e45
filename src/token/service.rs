//! Token issuance and rotation on top of [`TokenRepo`].
//!
//! Issuance mints a signed access token plus an opaque refresh token in one
//! transaction. Rotation consumes the presented refresh token atomically and
//! mints a child in the same family; a replay of an already-used token is
//! tolerated inside a short grace window (concurrent tabs, flaky retries) and
//! treated as theft beyond it, revoking the whole family.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use super::models::{AccessTokenIdentity, IssuedTokens, RefreshOutcome, RevokedFamily};
use super::paseto::{AccessTokenClaims, AccessTokenKey, TokenError, VerificationOptions};
use super::repo::{TokenRepo, hash_refresh_token, is_well_formed_refresh_token};

pub const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 900;
pub const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_REUSE_GRACE_SECONDS: i64 = 5;

const MIN_ACCESS_TOKEN_TTL_SECONDS: i64 = 60;
const MAX_ACCESS_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const MIN_REFRESH_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Clone, Copy, Debug)]
pub struct TokenConfig {
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    reuse_grace_seconds: i64,
}

impl TokenConfig {
    /// Default config: 15 minute access tokens, 30 day refresh tokens, and a
    /// 5 second reuse grace window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            access_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            reuse_grace_seconds: DEFAULT_REUSE_GRACE_SECONDS,
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reuse_grace_seconds(mut self, seconds: i64) -> Self {
        self.reuse_grace_seconds = seconds;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            access_ttl_seconds: self
                .access_ttl_seconds
                .clamp(MIN_ACCESS_TOKEN_TTL_SECONDS, MAX_ACCESS_TOKEN_TTL_SECONDS),
            refresh_ttl_seconds: self.refresh_ttl_seconds.max(MIN_REFRESH_TOKEN_TTL_SECONDS),
            reuse_grace_seconds: self.reuse_grace_seconds.max(0),
        }
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    #[must_use]
    pub fn reuse_grace_seconds(&self) -> i64 {
        self.reuse_grace_seconds
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How to treat a refresh token that was already used once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayDisposition {
    BenignRetry,
    Theft,
}

/// An already-used token presented again is a benign concurrent retry while
/// the first use is at most `grace_seconds` old, and theft after that.
/// Negative elapsed time (clock skew against the database) counts as benign.
fn classify_replay(
    used_at: DateTime<Utc>,
    now: DateTime<Utc>,
    grace_seconds: i64,
) -> ReplayDisposition {
    let elapsed = now.signed_duration_since(used_at);
    if elapsed <= Duration::seconds(grace_seconds) {
        ReplayDisposition::BenignRetry
    } else {
        ReplayDisposition::Theft
    }
}

#[derive(Clone)]
pub struct TokenService {
    pool: PgPool,
    key: Arc<AccessTokenKey>,
    config: TokenConfig,
}

impl TokenService {
    #[must_use]
    pub fn new(pool: PgPool, key: Arc<AccessTokenKey>, config: TokenConfig) -> Self {
        Self {
            pool,
            key,
            config: config.normalize(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    #[must_use]
    pub fn key(&self) -> &AccessTokenKey {
        &self.key
    }

    /// Mint an access/refresh pair for a fresh login. Starts a new token
    /// family.
    pub async fn issue(
        &self,
        user_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<IssuedTokens> {
        self.issue_in_family(user_id, Uuid::new_v4(), None, ip, user_agent)
            .await
    }

    /// Rotate a presented refresh token.
    ///
    /// The caller maps every non-`Rotated` outcome to the same unauthorized
    /// response; `ReuseRevoked` only exists so the incident can be logged.
    pub async fn refresh(
        &self,
        presented: &str,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<RefreshOutcome> {
        if !is_well_formed_refresh_token(presented) {
            return Ok(RefreshOutcome::Unauthorized);
        }
        let token_hash = hash_refresh_token(presented);

        // Fast path: we win the race for an unused token.
        if let Some(claimed) = TokenRepo::claim_refresh_token(&self.pool, &token_hash).await? {
            let tokens = self
                .issue_in_family(
                    claimed.user_id,
                    claimed.token_family_id,
                    Some(claimed.id),
                    ip,
                    user_agent,
                )
                .await?;
            return Ok(RefreshOutcome::Rotated(tokens));
        }

        let Some(record) = TokenRepo::find_refresh_token(&self.pool, &token_hash).await? else {
            return Ok(RefreshOutcome::Unauthorized);
        };

        let now = Utc::now();
        if record.revoked_at.is_some() || record.expires_at <= now {
            return Ok(RefreshOutcome::Unauthorized);
        }
        let Some(used_at) = record.used_at else {
            // The claim lost to a concurrent revocation rather than a use.
            return Ok(RefreshOutcome::Unauthorized);
        };

        match classify_replay(used_at, now, self.config.reuse_grace_seconds) {
            ReplayDisposition::BenignRetry => {
                let tokens = self
                    .issue_in_family(
                        record.user_id,
                        record.token_family_id,
                        Some(record.id),
                        ip,
                        user_agent,
                    )
                    .await?;
                Ok(RefreshOutcome::Rotated(tokens))
            }
            ReplayDisposition::Theft => {
                let revoked = TokenRepo::revoke_family(&self.pool, record.token_family_id).await?;
                tracing::warn!(
                    user_id = %record.user_id,
                    token_family_id = %record.token_family_id,
                    revoked,
                    "refresh token replayed outside grace window; revoked token family"
                );
                Ok(RefreshOutcome::ReuseRevoked {
                    user_id: record.user_id,
                    token_family_id: record.token_family_id,
                    revoked,
                })
            }
        }
    }

    /// Revoke the family behind a presented refresh token, e.g. on logout.
    /// Unknown or malformed tokens return `None`; logout stays idempotent.
    pub async fn revoke_presented(&self, presented: &str) -> Result<Option<RevokedFamily>> {
        if !is_well_formed_refresh_token(presented) {
            return Ok(None);
        }
        let token_hash = hash_refresh_token(presented);
        let Some(record) = TokenRepo::find_refresh_token(&self.pool, &token_hash).await? else {
            return Ok(None);
        };
        let revoked = TokenRepo::revoke_family(&self.pool, record.token_family_id).await?;
        Ok(Some(RevokedFamily {
            user_id: record.user_id,
            token_family_id: record.token_family_id,
            revoked,
        }))
    }

    /// Revoke a single access token record by `jti`.
    pub async fn revoke_access(&self, jti: Uuid) -> Result<bool> {
        TokenRepo::revoke_access_token(&self.pool, jti).await
    }

    /// Verify an access token signature and claims without touching the
    /// database.
    ///
    /// # Errors
    ///
    /// Returns the precise [`TokenError`] so callers can log why a bearer was
    /// rejected.
    pub fn verify_access_claims(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let options = VerificationOptions {
            expected_issuer: self.key.issuer(),
            expected_audience: self.key.audience(),
            now_unix_seconds: Utc::now().timestamp(),
            max_ttl_seconds: MAX_ACCESS_TOKEN_TTL_SECONDS,
        };
        self.key.verify(token, &options)
    }

    /// Full bearer check: signature and claims first, then the revocation row.
    /// Any token-shaped problem is `None`; only database failures are errors.
    pub async fn authenticate_access(&self, token: &str) -> Result<Option<AccessTokenIdentity>> {
        let claims = match self.verify_access_claims(token) {
            Ok(claims) => claims,
            Err(err) => {
                tracing::debug!(error = %err, "access token rejected");
                return Ok(None);
            }
        };
        let Ok(jti) = Uuid::parse_str(&claims.jti) else {
            return Ok(None);
        };
        let Ok(user_id) = Uuid::parse_str(&claims.sub) else {
            return Ok(None);
        };
        let Some(record) = TokenRepo::find_access_token(&self.pool, jti).await? else {
            return Ok(None);
        };
        if record.revoked_at.is_some() || record.user_id != user_id || record.expires_at <= Utc::now()
        {
            return Ok(None);
        }
        Ok(Some(AccessTokenIdentity { user_id, jti }))
    }

    async fn issue_in_family(
        &self,
        user_id: Uuid,
        token_family_id: Uuid,
        parent_id: Option<Uuid>,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<IssuedTokens> {
        let jti = Uuid::new_v4();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin token transaction")?;
        TokenRepo::insert_access_token(&mut tx, jti, user_id, self.config.access_ttl_seconds)
            .await?;
        let refresh_token = TokenRepo::insert_refresh_token(
            &mut tx,
            user_id,
            token_family_id,
            parent_id,
            self.config.refresh_ttl_seconds,
            ip,
            user_agent,
        )
        .await?;
        tx.commit()
            .await
            .context("failed to commit token transaction")?;

        let claims = self.key.make_claims(
            Utc::now().timestamp(),
            self.config.access_ttl_seconds,
            &user_id.to_string(),
            &jti.to_string(),
        )?;
        let access_token = self.key.sign(&claims)?;

        Ok(IssuedTokens {
            user_id,
            access_token,
            expires_in: self.config.access_ttl_seconds,
            refresh_token,
            refresh_expires_in: self.config.refresh_ttl_seconds,
            token_family_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

    const NOW: i64 = 1_700_000_000;

    fn unreachable_pool() -> PgPool {
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("atesti")
            .password("atesti")
            .database("atesti");
        PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy_with(options)
    }

    fn test_service(config: TokenConfig) -> Result<TokenService> {
        let key = AccessTokenKey::from_seed("https://issuer.test", "atesti", &[7u8; 32])?;
        Ok(TokenService::new(
            unreachable_pool(),
            Arc::new(key),
            config,
        ))
    }

    fn ts(unix: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(unix, 0).unwrap()
    }

    #[test]
    fn replay_within_grace_is_benign() {
        let used_at = ts(NOW);
        assert_eq!(
            classify_replay(used_at, ts(NOW + 1), 5),
            ReplayDisposition::BenignRetry
        );
        assert_eq!(
            classify_replay(used_at, ts(NOW + 5), 5),
            ReplayDisposition::BenignRetry
        );
    }

    #[test]
    fn replay_past_grace_is_theft() {
        let used_at = ts(NOW);
        assert_eq!(
            classify_replay(used_at, ts(NOW + 6), 5),
            ReplayDisposition::Theft
        );
        assert_eq!(
            classify_replay(used_at, ts(NOW + 3600), 5),
            ReplayDisposition::Theft
        );
    }

    #[test]
    fn replay_with_zero_grace_only_tolerates_same_instant() {
        let used_at = ts(NOW);
        assert_eq!(
            classify_replay(used_at, ts(NOW), 0),
            ReplayDisposition::BenignRetry
        );
        assert_eq!(
            classify_replay(used_at, ts(NOW + 1), 0),
            ReplayDisposition::Theft
        );
    }

    #[test]
    fn replay_with_skewed_clock_is_benign() {
        let used_at = ts(NOW + 10);
        assert_eq!(
            classify_replay(used_at, ts(NOW), 5),
            ReplayDisposition::BenignRetry
        );
    }

    #[test]
    fn config_defaults() {
        let config = TokenConfig::new();
        assert_eq!(config.access_ttl_seconds(), 900);
        assert_eq!(config.refresh_ttl_seconds(), 2_592_000);
        assert_eq!(config.reuse_grace_seconds(), 5);
    }

    #[test]
    fn config_normalize_clamps_out_of_range_values() {
        let config = TokenConfig::new()
            .with_access_ttl_seconds(0)
            .with_refresh_ttl_seconds(-1)
            .with_reuse_grace_seconds(-30)
            .normalize();
        assert_eq!(config.access_ttl_seconds(), 60);
        assert_eq!(config.refresh_ttl_seconds(), 3600);
        assert_eq!(config.reuse_grace_seconds(), 0);

        let config = TokenConfig::new()
            .with_access_ttl_seconds(7 * 24 * 60 * 60)
            .normalize();
        assert_eq!(config.access_ttl_seconds(), 24 * 60 * 60);
    }

    #[tokio::test]
    async fn refresh_rejects_malformed_token_without_database() -> Result<()> {
        let service = test_service(TokenConfig::new())?;
        let outcome = service.refresh("not-a-token", None, None).await?;
        assert!(matches!(outcome, RefreshOutcome::Unauthorized));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_consults_database_for_well_formed_tokens() -> Result<()> {
        let service = test_service(TokenConfig::new())?;
        let token = super::super::repo::generate_refresh_token()?;
        let result = service.refresh(&token, None, None).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn issue_surfaces_database_errors() -> Result<()> {
        let service = test_service(TokenConfig::new())?;
        let result = service.issue(Uuid::new_v4(), None, None).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn revoke_presented_ignores_malformed_tokens() -> Result<()> {
        let service = test_service(TokenConfig::new())?;
        let revoked = service.revoke_presented("").await?;
        assert!(revoked.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_access_rejects_garbage_without_database() -> Result<()> {
        let service = test_service(TokenConfig::new())?;
        let identity = service.authenticate_access("v4.public.garbage").await?;
        assert!(identity.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn verify_access_claims_accepts_own_tokens() -> Result<()> {
        let service = test_service(TokenConfig::new())?;
        let claims = service.key().make_claims(
            Utc::now().timestamp(),
            900,
            "2c6e17d8-6617-4f66-b3b2-46b8bb19f701",
            "6b4ee1ff-33ec-4c29-ae6b-4a1a22d52de0",
        )?;
        let token = service.key().sign(&claims)?;
        let verified = service.verify_access_claims(&token)?;
        assert_eq!(verified.sub, claims.sub);
        assert_eq!(verified.jti, claims.jti);
        Ok(())
    }
}
