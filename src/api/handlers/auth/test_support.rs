//! Builders shared by the auth handler tests. No database is reachable; the
//! lazy pool fails fast so storage-path tests exercise error handling only.

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;

use crate::otp::{OtpConfig, OtpService};
use crate::token::{AccessTokenKey, TokenConfig, TokenService};
use crate::webauthn::{PasskeyConfig, PasskeyService};

use super::rate_limit::{NoopRateLimiter, RateLimiter};
use super::state::{AuthConfig, AuthState};

pub(crate) const TEST_ORIGIN: &str = "http://localhost:8080";

pub(crate) fn unreachable_pool() -> PgPool {
    let options = PgConnectOptions::new()
        .host("127.0.0.1")
        .port(1)
        .username("atesti")
        .password("atesti")
        .database("atesti");
    PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy_with(options)
}

pub(crate) fn auth_state() -> AuthState {
    auth_state_with_limiter(Arc::new(NoopRateLimiter))
}

pub(crate) fn auth_state_with_limiter(limiter: Arc<dyn RateLimiter>) -> AuthState {
    let key = AccessTokenKey::from_seed("https://issuer.test", "atesti", &[7u8; 32])
        .unwrap_or_else(|err| panic!("seed key: {err}"));
    let tokens = TokenService::new(unreachable_pool(), Arc::new(key), TokenConfig::new());
    let otp = OtpService::new(unreachable_pool(), OtpConfig::new());
    let passkey_config = PasskeyConfig::new("localhost", "atesti", vec![TEST_ORIGIN.to_string()])
        .unwrap_or_else(|err| panic!("passkey config: {err}"));
    let passkeys = PasskeyService::new(unreachable_pool(), passkey_config)
        .unwrap_or_else(|err| panic!("passkey service: {err}"));
    AuthState::new(
        AuthConfig::new()
            .with_failure_pause(Duration::ZERO)
            .with_cookie_secure(false),
        tokens,
        otp,
        passkeys,
        limiter,
        "test-salt".to_string(),
    )
}
