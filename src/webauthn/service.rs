//! Passkey (`WebAuthn`) ceremonies backed by the `passkey_challenges` table.
//!
//! Flow overview:
//! 1) Registration options are bound to the authenticated user; the
//!    in-progress ceremony state is stored server-side under an opaque
//!    challenge token with a short TTL.
//! 2) Authentication uses the discoverable-credential flow: the challenge is
//!    issued without a user, and the authenticator's response identifies the
//!    credential.
//! 3) Finishing either ceremony consumes the stored challenge atomically, so
//!    concurrent server processes agree on single use without any in-memory
//!    state.
//!
//! Security boundaries:
//! - Origin and RP ID validation are enforced by `webauthn-rs` and by
//!   explicit Origin checks against the stored ceremony state.
//! - A signature counter that fails to increase past the persisted value is
//!   rejected as a clone signal even when the assertion itself verifies.
//! - Passkey responses are never logged or stored in plaintext.

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use super::models::{AuthenticatedPasskey, ChallengeKind, PasskeySummary};
use super::repo::{PasskeyRepo, hash_challenge_token, is_well_formed_challenge_token};

pub const DEFAULT_CHALLENGE_TTL_SECONDS: i64 = 300;

const MIN_CHALLENGE_TTL_SECONDS: i64 = 30;
const MAX_CHALLENGE_TTL_SECONDS: i64 = 3600;

const DEVICE_TYPE_SINGLE: &str = "single_device";
const DEVICE_TYPE_MULTI: &str = "multi_device";

// Roughly one ceremony start in fifty sweeps long-dead challenge rows.
const CLEANUP_SAMPLE_RATE: u32 = 50;

#[derive(Clone, Debug)]
pub struct PasskeyConfig {
    rp_id: String,
    rp_name: String,
    allowed_origins: Vec<String>,
    challenge_ttl_seconds: i64,
}

impl PasskeyConfig {
    /// Create a new passkey configuration.
    ///
    /// # Errors
    /// Returns error if origins are invalid or empty.
    pub fn new(rp_id: &str, rp_name: &str, allowed_origins: Vec<String>) -> Result<Self> {
        if rp_id.trim().is_empty() {
            return Err(anyhow!("Passkey RP ID must not be empty"));
        }

        let allowed_origins = normalize_origins(allowed_origins)?;
        if allowed_origins.is_empty() {
            return Err(anyhow!("Passkey allowed origins must not be empty"));
        }

        Ok(Self {
            rp_id: rp_id.to_string(),
            rp_name: rp_name.to_string(),
            allowed_origins,
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
        })
    }

    #[must_use]
    pub fn with_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.challenge_ttl_seconds =
            seconds.clamp(MIN_CHALLENGE_TTL_SECONDS, MAX_CHALLENGE_TTL_SECONDS);
        self
    }

    #[must_use]
    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    #[must_use]
    pub fn rp_name(&self) -> &str {
        &self.rp_name
    }

    #[must_use]
    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    #[must_use]
    pub fn challenge_ttl_seconds(&self) -> i64 {
        self.challenge_ttl_seconds
    }
}

#[derive(Debug, Error)]
pub enum PasskeyRegistrationError {
    #[error("challenge not found")]
    NotFound,
    #[error("challenge expired or already used")]
    Expired,
    #[error("challenge bound to a different user")]
    UserMismatch,
    #[error("origin not allowed for this ceremony")]
    OriginMismatch,
    #[error("credential already registered")]
    CredentialExists,
    #[error("attestation verification failed: {0}")]
    Webauthn(#[from] WebauthnError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PasskeyAuthenticationError {
    #[error("challenge not found")]
    NotFound,
    #[error("challenge expired or already used")]
    Expired,
    #[error("credential is not registered")]
    UnknownCredential,
    #[error("credential belongs to a different user")]
    UserMismatch,
    #[error("signature counter did not increase")]
    CounterRegression,
    #[error("origin not allowed for this ceremony")]
    OriginMismatch,
    #[error("assertion verification failed: {0}")]
    Webauthn(#[from] WebauthnError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Ceremony state persisted in `passkey_challenges.state`, pinned to the
/// origin that started it.
#[derive(Serialize, Deserialize)]
struct StoredRegistrationState {
    origin: String,
    registration: PasskeyRegistration,
}

#[derive(Serialize, Deserialize)]
struct StoredAuthenticationState {
    origin: String,
    authentication: DiscoverableAuthentication,
}

/// A signature counter must move strictly forward once it has ever moved at
/// all. Authenticators that never count report zero forever, so `0 -> 0` is
/// the one non-increasing transition that stays acceptable.
fn counter_regressed(stored: i64, reported: i64) -> bool {
    if stored == 0 && reported == 0 {
        return false;
    }
    reported <= stored
}

pub struct PasskeyService {
    pool: PgPool,
    config: PasskeyConfig,
    webauthn_by_origin: HashMap<String, Webauthn>,
}

impl PasskeyService {
    /// Create a new passkey service.
    ///
    /// # Errors
    /// Returns error if the `WebAuthn` builder fails for any configured
    /// origin.
    pub fn new(pool: PgPool, config: PasskeyConfig) -> Result<Self> {
        let mut webauthn_by_origin = HashMap::new();

        for origin in &config.allowed_origins {
            let rp_origin_url =
                Url::parse(origin).with_context(|| format!("Invalid passkey origin: {origin}"))?;
            let webauthn = WebauthnBuilder::new(config.rp_id(), &rp_origin_url)?
                .rp_name(config.rp_name())
                .build()?;
            webauthn_by_origin.insert(origin.clone(), webauthn);
        }

        Ok(Self {
            pool,
            config,
            webauthn_by_origin,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PasskeyConfig {
        &self.config
    }

    #[must_use]
    pub fn match_origin(&self, origin: &str) -> Option<String> {
        let normalized = normalize_origin(origin).ok()?;
        if self.webauthn_by_origin.contains_key(&normalized) {
            Some(normalized)
        } else {
            None
        }
    }

    fn webauthn_for_origin(&self, origin: &str) -> Result<&Webauthn> {
        self.webauthn_by_origin
            .get(origin)
            .ok_or_else(|| anyhow!("Passkey origin not allowed"))
    }

    /// Begin passkey registration for the authenticated user. Returns the
    /// opaque challenge token and the browser-facing creation options.
    ///
    /// # Errors
    /// Returns error if the origin is not allowed, the user does not exist,
    /// or the ceremony state cannot be stored.
    pub async fn register_begin(
        &self,
        user_id: Uuid,
        origin: &str,
    ) -> Result<(String, CreationChallengeResponse)> {
        let webauthn = self.webauthn_for_origin(origin)?;
        let email = PasskeyRepo::find_user_email(&self.pool, user_id)
            .await?
            .ok_or_else(|| anyhow!("user not found for passkey registration"))?;

        let (challenge, registration) =
            webauthn.start_passkey_registration(user_id, &email, &email, None)?;

        let state = StoredRegistrationState {
            origin: origin.to_string(),
            registration,
        };
        let state_json =
            serde_json::to_string(&state).context("Failed to serialize registration state")?;
        let challenge_token = PasskeyRepo::insert_challenge(
            &self.pool,
            Some(user_id),
            ChallengeKind::Registration,
            &state_json,
            self.config.challenge_ttl_seconds,
        )
        .await?;

        self.maybe_cleanup().await;

        Ok((challenge_token, challenge))
    }

    /// Finish passkey registration: consume the stored challenge, verify the
    /// attestation, and persist the credential.
    ///
    /// # Errors
    /// Returns the precise rejection so handlers can map it to a status code;
    /// only `Storage` is an internal fault.
    pub async fn register_finish(
        &self,
        challenge_token: &str,
        user_id: Uuid,
        origin: &str,
        response: &RegisterPublicKeyCredential,
        name: Option<&str>,
    ) -> Result<PasskeySummary, PasskeyRegistrationError> {
        let webauthn = self
            .webauthn_for_origin(origin)
            .map_err(|_| PasskeyRegistrationError::OriginMismatch)?;
        if !is_well_formed_challenge_token(challenge_token) {
            return Err(PasskeyRegistrationError::NotFound);
        }

        let token_hash = hash_challenge_token(challenge_token);
        let Some(row) =
            PasskeyRepo::consume_challenge(&self.pool, &token_hash, ChallengeKind::Registration)
                .await?
        else {
            if PasskeyRepo::challenge_exists(&self.pool, &token_hash, ChallengeKind::Registration)
                .await?
            {
                return Err(PasskeyRegistrationError::Expired);
            }
            return Err(PasskeyRegistrationError::NotFound);
        };

        if row.user_id != Some(user_id) {
            return Err(PasskeyRegistrationError::UserMismatch);
        }

        let state: StoredRegistrationState = serde_json::from_str(&row.state)
            .context("Failed to deserialize registration state")
            .map_err(PasskeyRegistrationError::Storage)?;
        if state.origin != origin {
            return Err(PasskeyRegistrationError::OriginMismatch);
        }

        let passkey = webauthn.finish_passkey_registration(response, &state.registration)?;

        let public_key = serialize_passkey(&passkey)?;
        let transports = response
            .response
            .transports
            .as_ref()
            .map(|transports| {
                serde_json::to_string(transports).context("Failed to serialize transports")
            })
            .transpose()?;

        let summary = PasskeyRepo::create_passkey(
            &self.pool,
            user_id,
            passkey.cred_id().as_ref(),
            &public_key,
            transports.as_deref(),
            name,
            DEVICE_TYPE_SINGLE,
            false,
        )
        .await?
        .ok_or(PasskeyRegistrationError::CredentialExists)?;

        Ok(summary)
    }

    /// Begin a discoverable authentication ceremony. No user is bound; the
    /// authenticator's answer will identify the credential.
    ///
    /// # Errors
    /// Returns error if the origin is not allowed or the ceremony state
    /// cannot be stored.
    pub async fn authenticate_begin(
        &self,
        origin: &str,
    ) -> Result<(String, RequestChallengeResponse)> {
        let webauthn = self.webauthn_for_origin(origin)?;
        let (challenge, authentication) = webauthn.start_discoverable_authentication()?;

        let state = StoredAuthenticationState {
            origin: origin.to_string(),
            authentication,
        };
        let state_json =
            serde_json::to_string(&state).context("Failed to serialize authentication state")?;
        let challenge_token = PasskeyRepo::insert_challenge(
            &self.pool,
            None,
            ChallengeKind::Authentication,
            &state_json,
            self.config.challenge_ttl_seconds,
        )
        .await?;

        self.maybe_cleanup().await;

        Ok((challenge_token, challenge))
    }

    /// Finish a discoverable authentication: consume the stored challenge,
    /// verify the assertion against the stored credential, and enforce the
    /// counter clone check before recording the use.
    ///
    /// # Errors
    /// Returns the precise rejection so handlers can map it to a status code;
    /// only `Storage` is an internal fault.
    pub async fn authenticate_finish(
        &self,
        challenge_token: &str,
        origin: &str,
        response: &PublicKeyCredential,
    ) -> Result<AuthenticatedPasskey, PasskeyAuthenticationError> {
        let webauthn = self
            .webauthn_for_origin(origin)
            .map_err(|_| PasskeyAuthenticationError::OriginMismatch)?;
        if !is_well_formed_challenge_token(challenge_token) {
            return Err(PasskeyAuthenticationError::NotFound);
        }

        let token_hash = hash_challenge_token(challenge_token);
        let Some(row) =
            PasskeyRepo::consume_challenge(&self.pool, &token_hash, ChallengeKind::Authentication)
                .await?
        else {
            if PasskeyRepo::challenge_exists(&self.pool, &token_hash, ChallengeKind::Authentication)
                .await?
            {
                return Err(PasskeyAuthenticationError::Expired);
            }
            return Err(PasskeyAuthenticationError::NotFound);
        };

        let state: StoredAuthenticationState = serde_json::from_str(&row.state)
            .context("Failed to deserialize authentication state")
            .map_err(PasskeyAuthenticationError::Storage)?;
        if state.origin != origin {
            return Err(PasskeyAuthenticationError::OriginMismatch);
        }

        let (user_handle, cred_id) = webauthn.identify_discoverable_authentication(response)?;
        let Some(record) = PasskeyRepo::find_by_credential_id(&self.pool, cred_id).await? else {
            return Err(PasskeyAuthenticationError::UnknownCredential);
        };
        if record.user_id != user_handle {
            return Err(PasskeyAuthenticationError::UserMismatch);
        }

        let mut passkey = deserialize_passkey(&record.public_key)?;
        let result = webauthn.finish_discoverable_authentication(
            response,
            state.authentication,
            &[DiscoverableKey::from(&passkey)],
        )?;

        let reported = i64::from(result.counter());
        if counter_regressed(record.counter, reported) {
            tracing::warn!(
                user_id = %record.user_id,
                passkey_id = %record.id,
                stored = record.counter,
                reported,
                "passkey signature counter did not increase; possible cloned authenticator"
            );
            return Err(PasskeyAuthenticationError::CounterRegression);
        }

        let _ = passkey.update_credential(&result);
        let public_key = serialize_passkey(&passkey)?;
        let device_type = if result.backup_eligible() {
            DEVICE_TYPE_MULTI
        } else {
            DEVICE_TYPE_SINGLE
        };

        let recorded = PasskeyRepo::record_authentication(
            &self.pool,
            record.id,
            reported,
            &public_key,
            device_type,
            result.backup_state(),
        )
        .await?;
        if !recorded {
            // A concurrent assertion moved the counter first.
            return Err(PasskeyAuthenticationError::CounterRegression);
        }

        Ok(AuthenticatedPasskey {
            user_id: record.user_id,
            passkey_id: record.id,
        })
    }

    /// Lists the user's passkeys for the self-service surface.
    pub async fn list_passkeys(&self, user_id: Uuid) -> Result<Vec<PasskeySummary>> {
        PasskeyRepo::list_user_passkeys(&self.pool, user_id).await
    }

    /// Deletes one of the user's passkeys. Returns `false` when the id does
    /// not belong to them.
    pub async fn delete_passkey(&self, user_id: Uuid, passkey_id: Uuid) -> Result<bool> {
        PasskeyRepo::delete_passkey(&self.pool, user_id, passkey_id).await
    }

    async fn maybe_cleanup(&self) {
        if rand::thread_rng().gen_range(0..CLEANUP_SAMPLE_RATE) != 0 {
            return;
        }
        match PasskeyRepo::delete_stale_challenges(&self.pool).await {
            Ok(deleted) if deleted > 0 => {
                tracing::debug!(deleted, "swept stale passkey challenges");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = ?err, "failed to sweep stale passkey challenges");
            }
        }
    }
}

fn normalize_origins(origins: Vec<String>) -> Result<Vec<String>> {
    let mut normalized = Vec::new();
    for origin in origins {
        let origin = normalize_origin(&origin)?;
        if !normalized.contains(&origin) {
            normalized.push(origin);
        }
    }
    Ok(normalized)
}

fn normalize_origin(origin: &str) -> Result<String> {
    let parsed = Url::parse(origin).with_context(|| format!("Invalid origin URL: {origin}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Origin must include a host: {origin}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    Ok(format!("{}://{}{}", parsed.scheme(), host, port))
}

/// Serialize a passkey for storage.
///
/// # Errors
/// Returns error if serialization fails.
pub fn serialize_passkey(passkey: &Passkey) -> Result<Vec<u8>> {
    serde_json::to_vec(passkey).context("Failed to serialize passkey")
}

/// Deserialize a stored passkey.
///
/// # Errors
/// Returns error if deserialization fails.
pub fn deserialize_passkey(data: &[u8]) -> Result<Passkey> {
    serde_json::from_slice(data).context("Failed to deserialize passkey")
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

    fn test_config() -> Result<PasskeyConfig> {
        PasskeyConfig::new(
            "example.com",
            "Example",
            vec!["https://example.com".to_string()],
        )
    }

    fn test_service() -> Result<PasskeyService> {
        PasskeyService::new(unreachable_pool(), test_config()?)
    }

    fn dummy_register_credential() -> Result<RegisterPublicKeyCredential> {
        let credential = serde_json::from_value(serde_json::json!({
            "id": "dummy",
            "rawId": "AA",
            "type": "public-key",
            "response": {
                "attestationObject": "AA",
                "clientDataJSON": "AA"
            }
        }))?;
        Ok(credential)
    }

    fn dummy_public_key_credential() -> Result<PublicKeyCredential> {
        let credential = serde_json::from_value(serde_json::json!({
            "id": "dummy",
            "rawId": "AA",
            "type": "public-key",
            "response": {
                "authenticatorData": "AA",
                "clientDataJSON": "AA",
                "signature": "AA"
            }
        }))?;
        Ok(credential)
    }

    #[tokio::test]
    async fn origin_matching_is_exact() -> Result<()> {
        let service = test_service()?;
        assert_eq!(
            service.match_origin("https://example.com"),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            service.match_origin("https://example.com/"),
            Some("https://example.com".to_string())
        );
        assert_eq!(service.match_origin("https://other.com"), None);
        Ok(())
    }

    #[tokio::test]
    async fn origin_matching_requires_port_match() -> Result<()> {
        let config = PasskeyConfig::new(
            "example.com",
            "Example",
            vec!["https://example.com:8443".to_string()],
        )?;
        let service = PasskeyService::new(unreachable_pool(), config)?;
        assert_eq!(service.match_origin("https://example.com"), None);
        assert_eq!(
            service.match_origin("https://example.com:8443"),
            Some("https://example.com:8443".to_string())
        );
        Ok(())
    }

    #[test]
    fn config_rejects_blank_rp_id_and_empty_origins() {
        assert!(PasskeyConfig::new("  ", "Example", vec!["https://example.com".to_string()]).is_err());
        assert!(PasskeyConfig::new("example.com", "Example", vec![]).is_err());
    }

    #[test]
    fn config_deduplicates_origins() -> Result<()> {
        let config = PasskeyConfig::new(
            "example.com",
            "Example",
            vec![
                "https://example.com".to_string(),
                "https://example.com/".to_string(),
            ],
        )?;
        assert_eq!(config.allowed_origins(), ["https://example.com"]);
        Ok(())
    }

    #[test]
    fn challenge_ttl_is_clamped() -> Result<()> {
        let config = test_config()?.with_challenge_ttl_seconds(5);
        assert_eq!(config.challenge_ttl_seconds(), 30);
        let config = test_config()?.with_challenge_ttl_seconds(86_400);
        assert_eq!(config.challenge_ttl_seconds(), 3600);
        Ok(())
    }

    #[test]
    fn counter_must_strictly_increase_once_counting() {
        assert!(!counter_regressed(0, 0));
        assert!(!counter_regressed(0, 1));
        assert!(!counter_regressed(5, 6));
        assert!(counter_regressed(5, 5));
        assert!(counter_regressed(5, 4));
        assert!(counter_regressed(5, 0));
        assert!(counter_regressed(1, 0));
    }

    #[tokio::test]
    async fn registration_state_round_trips_through_json() -> Result<()> {
        let service = test_service()?;
        let webauthn = service.webauthn_for_origin("https://example.com")?;
        let (_challenge, registration) = webauthn.start_passkey_registration(
            Uuid::new_v4(),
            "user@example.com",
            "user@example.com",
            None,
        )?;
        let state = StoredRegistrationState {
            origin: "https://example.com".to_string(),
            registration,
        };
        let json = serde_json::to_string(&state)?;
        let parsed: StoredRegistrationState = serde_json::from_str(&json)?;
        assert_eq!(parsed.origin, state.origin);
        Ok(())
    }

    #[tokio::test]
    async fn authentication_state_round_trips_through_json() -> Result<()> {
        let service = test_service()?;
        let webauthn = service.webauthn_for_origin("https://example.com")?;
        let (_challenge, authentication) = webauthn.start_discoverable_authentication()?;
        let state = StoredAuthenticationState {
            origin: "https://example.com".to_string(),
            authentication,
        };
        let json = serde_json::to_string(&state)?;
        let parsed: StoredAuthenticationState = serde_json::from_str(&json)?;
        assert_eq!(parsed.origin, state.origin);
        Ok(())
    }

    #[tokio::test]
    async fn register_finish_rejects_unknown_origin_before_anything_else() -> Result<()> {
        let service = test_service()?;
        let credential = dummy_register_credential()?;
        let err = service
            .register_finish(
                "irrelevant",
                Uuid::new_v4(),
                "https://other.example.com",
                &credential,
                None,
            )
            .await
            .err()
            .ok_or_else(|| anyhow!("expected origin mismatch"))?;
        assert!(matches!(err, PasskeyRegistrationError::OriginMismatch));
        Ok(())
    }

    #[tokio::test]
    async fn register_finish_rejects_malformed_challenge_without_database() -> Result<()> {
        let service = test_service()?;
        let credential = dummy_register_credential()?;
        let err = service
            .register_finish(
                "not-a-challenge-token",
                Uuid::new_v4(),
                "https://example.com",
                &credential,
                None,
            )
            .await
            .err()
            .ok_or_else(|| anyhow!("expected not found"))?;
        assert!(matches!(err, PasskeyRegistrationError::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_finish_rejects_malformed_challenge_without_database() -> Result<()> {
        let service = test_service()?;
        let credential = dummy_public_key_credential()?;
        let err = service
            .authenticate_finish("@@@@", "https://example.com", &credential)
            .await
            .err()
            .ok_or_else(|| anyhow!("expected not found"))?;
        assert!(matches!(err, PasskeyAuthenticationError::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn register_begin_surfaces_database_errors() -> Result<()> {
        let service = test_service()?;
        let result = service
            .register_begin(Uuid::new_v4(), "https://example.com")
            .await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_begin_surfaces_database_errors() -> Result<()> {
        let service = test_service()?;
        let result = service.authenticate_begin("https://example.com").await;
        assert!(result.is_err());
        Ok(())
    }
}
