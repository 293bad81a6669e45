//! Email code issuance and verification on top of [`OtpRepo`].
//!
//! Issuing a code writes the challenge row and the outbox email in one
//! transaction. Verification spends one unit of a fixed attempt budget per
//! call, compares the code hash in constant time, and leaves consumption to
//! a separate `mark_used` step so a verified challenge can gate whatever the
//! caller is protecting without this module knowing about it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::net::IpAddr;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::models::{AuthChallenge, IssuedChallenge, VerifyOutcome};
use super::repo::{OtpRepo, hash_challenge_token, is_well_formed_challenge_token};

pub const DEFAULT_OTP_TTL_SECONDS: i64 = 600;
pub const DEFAULT_OTP_MAX_ATTEMPTS: i32 = 5;

const MIN_OTP_TTL_SECONDS: i64 = 60;
const MAX_OTP_TTL_SECONDS: i64 = 3600;
const OTP_EMAIL_TEMPLATE: &str = "otp_code";

// Roughly one issuance in fifty also sweeps long-dead challenge rows.
const CLEANUP_SAMPLE_RATE: u32 = 50;

#[derive(Clone, Copy, Debug)]
pub struct OtpConfig {
    ttl_seconds: i64,
    max_attempts: i32,
}

impl OtpConfig {
    /// Default config: 10 minute codes with a budget of 5 verification
    /// attempts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ttl_seconds: DEFAULT_OTP_TTL_SECONDS,
            max_attempts: DEFAULT_OTP_MAX_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, seconds: i64) -> Self {
        self.ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            ttl_seconds: self
                .ttl_seconds
                .clamp(MIN_OTP_TTL_SECONDS, MAX_OTP_TTL_SECONDS),
            max_attempts: self.max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    #[must_use]
    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct OtpService {
    pool: PgPool,
    config: OtpConfig,
}

impl OtpService {
    #[must_use]
    pub fn new(pool: PgPool, config: OtpConfig) -> Self {
        Self {
            pool,
            config: config.normalize(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    /// Create a challenge for an already-normalized email and enqueue the
    /// code for delivery. Returns the opaque challenge token for the client.
    pub async fn request_code(
        &self,
        email: &str,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<IssuedChallenge> {
        let code = generate_otp_code();
        let code_hash = hash_otp_code(&code);
        let payload = json!({
            "code": code,
            "expires_minutes": self.config.ttl_seconds / 60,
        });
        let payload_text =
            serde_json::to_string(&payload).context("failed to serialize code email payload")?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin challenge transaction")?;
        let challenge_token = OtpRepo::insert_challenge(
            &mut tx,
            email,
            &code_hash,
            self.config.max_attempts,
            self.config.ttl_seconds,
            ip,
            user_agent,
        )
        .await?;
        OtpRepo::enqueue_code_email(&mut tx, email, OTP_EMAIL_TEMPLATE, &payload_text).await?;
        tx.commit()
            .await
            .context("failed to commit challenge transaction")?;

        self.maybe_cleanup().await;

        Ok(IssuedChallenge {
            challenge_token,
            expires_in: self.config.ttl_seconds,
        })
    }

    /// Verify a submitted code against the challenge identified by
    /// `(challenge_token, email)`.
    ///
    /// Every call against a live challenge spends one attempt, whatever the
    /// outcome. Once the budget is gone the challenge answers `MaxAttempts`
    /// forever, including for the correct code.
    pub async fn verify(
        &self,
        challenge_token: &str,
        email: &str,
        code: &str,
    ) -> Result<VerifyOutcome> {
        if !is_well_formed_challenge_token(challenge_token) {
            return Ok(VerifyOutcome::Invalid);
        }
        let token_hash = hash_challenge_token(challenge_token);
        let Some(challenge) = OtpRepo::find_challenge(&self.pool, &token_hash, email).await? else {
            return Ok(VerifyOutcome::Invalid);
        };

        if challenge_spent(&challenge, Utc::now()) {
            return Ok(VerifyOutcome::Expired);
        }

        let Some((attempts, max_attempts)) =
            OtpRepo::increment_attempts(&self.pool, challenge.id).await?
        else {
            // The row was swept between lookup and increment.
            return Ok(VerifyOutcome::Expired);
        };
        if attempts > max_attempts {
            return Ok(VerifyOutcome::MaxAttempts);
        }

        if code_matches(code, &challenge.code_hash) {
            Ok(VerifyOutcome::Verified {
                challenge_id: challenge.id,
                email: challenge.email,
            })
        } else {
            Ok(VerifyOutcome::Invalid)
        }
    }

    /// Consume a verified challenge. Returns `false` when another caller got
    /// there first or the challenge expired in the meantime.
    pub async fn mark_used(&self, challenge_id: Uuid) -> Result<bool> {
        OtpRepo::mark_used(&self.pool, challenge_id).await
    }

    /// Find the user for an email, creating the account on first login.
    pub async fn resolve_user(&self, email: &str) -> Result<Uuid> {
        OtpRepo::resolve_user(&self.pool, email).await
    }

    async fn maybe_cleanup(&self) {
        if rand::thread_rng().gen_range(0..CLEANUP_SAMPLE_RATE) != 0 {
            return;
        }
        match OtpRepo::delete_stale(&self.pool).await {
            Ok(deleted) if deleted > 0 => {
                tracing::debug!(deleted, "swept stale auth challenges");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = ?err, "failed to sweep stale auth challenges");
            }
        }
    }
}

/// A spent challenge (consumed or aged out) answers `Expired`, never
/// `Invalid`: clients re-request a code on `Expired` and re-type it on
/// `Invalid`.
fn challenge_spent(challenge: &AuthChallenge, now: DateTime<Utc>) -> bool {
    challenge.used_at.is_some() || challenge.expires_at <= now
}

/// Generate a 6 digit zero-padded code.
fn generate_otp_code() -> String {
    let value: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{value:06}")
}

/// Hash a code so the raw value only exists in the outbound email.
fn hash_otp_code(code: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.finalize().to_vec()
}

/// Constant-time comparison of a submitted code against the stored hash.
/// Hashing first fixes the compared length so the timing of the comparison
/// reveals nothing about how many characters matched.
fn code_matches(submitted: &str, stored_hash: &[u8]) -> bool {
    let submitted_hash = hash_otp_code(submitted);
    bool::from(submitted_hash.as_slice().ct_eq(stored_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

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

    fn test_service() -> OtpService {
        OtpService::new(unreachable_pool(), OtpConfig::new())
    }

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_otp_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn code_comparison_accepts_only_the_exact_code() {
        let stored = hash_otp_code("482913");
        assert!(code_matches("482913", &stored));
        assert!(!code_matches("482914", &stored));
        assert!(!code_matches("", &stored));
        assert!(!code_matches("4829130", &stored));
    }

    #[test]
    fn code_comparison_handles_foreign_hash_lengths() {
        assert!(!code_matches("482913", b"short"));
        assert!(!code_matches("482913", &[]));
    }

    fn live_challenge(now: DateTime<Utc>) -> AuthChallenge {
        AuthChallenge {
            id: Uuid::new_v4(),
            email: "user@test.com".to_string(),
            code_hash: hash_otp_code("482913"),
            attempts: 0,
            max_attempts: 5,
            expires_at: now + chrono::Duration::minutes(10),
            used_at: None,
            created_at: now,
        }
    }

    #[test]
    fn consumed_and_aged_challenges_are_spent_not_invalid() {
        let now = Utc::now();

        let live = live_challenge(now);
        assert!(!challenge_spent(&live, now));

        let mut used = live_challenge(now);
        used.used_at = Some(now - chrono::Duration::seconds(1));
        assert!(challenge_spent(&used, now));

        let mut aged = live_challenge(now);
        aged.expires_at = now - chrono::Duration::seconds(1);
        assert!(challenge_spent(&aged, now));

        // The boundary instant counts as expired.
        let mut boundary = live_challenge(now);
        boundary.expires_at = now;
        assert!(challenge_spent(&boundary, now));
    }

    #[test]
    fn config_defaults() {
        let config = OtpConfig::new();
        assert_eq!(config.ttl_seconds(), 600);
        assert_eq!(config.max_attempts(), 5);
    }

    #[test]
    fn config_normalize_clamps_out_of_range_values() {
        let config = OtpConfig::new()
            .with_ttl_seconds(5)
            .with_max_attempts(0)
            .normalize();
        assert_eq!(config.ttl_seconds(), 60);
        assert_eq!(config.max_attempts(), 1);

        let config = OtpConfig::new().with_ttl_seconds(86_400).normalize();
        assert_eq!(config.ttl_seconds(), 3600);
    }

    #[tokio::test]
    async fn verify_rejects_malformed_challenge_token_without_database() -> Result<()> {
        let service = test_service();
        let outcome = service
            .verify("definitely-not-a-token", "user@test.com", "482913")
            .await?;
        assert!(matches!(outcome, VerifyOutcome::Invalid));
        Ok(())
    }

    #[tokio::test]
    async fn verify_consults_database_for_well_formed_tokens() -> Result<()> {
        let service = test_service();
        let token = super::super::repo::generate_challenge_token()?;
        let result = service.verify(&token, "user@test.com", "482913").await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn request_code_surfaces_database_errors() -> Result<()> {
        let service = test_service();
        let result = service.request_code("user@test.com", None, None).await;
        assert!(result.is_err());
        Ok(())
    }
}
