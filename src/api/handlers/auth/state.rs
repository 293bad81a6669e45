//! Shared state for the auth endpoints.

use std::sync::Arc;
use std::time::Duration;

use crate::otp::OtpService;
use crate::token::TokenService;
use crate::webauthn::PasskeyService;

use super::rate_limit::RateLimiter;

const DEFAULT_FAILURE_PAUSE_MS: u64 = 250;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    failure_pause: Duration,
    cookie_secure: bool,
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            failure_pause: Duration::from_millis(DEFAULT_FAILURE_PAUSE_MS),
            cookie_secure: true,
        }
    }

    #[must_use]
    pub fn with_failure_pause(mut self, pause: Duration) -> Self {
        self.failure_pause = pause;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    pub(super) fn failure_pause(&self) -> Duration {
        self.failure_pause
    }

    pub(super) fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AuthState {
    config: AuthConfig,
    tokens: TokenService,
    otp: OtpService,
    passkeys: PasskeyService,
    rate_limiter: Arc<dyn RateLimiter>,
    fingerprint_salt: String,
}

impl AuthState {
    pub fn new(
        config: AuthConfig,
        tokens: TokenService,
        otp: OtpService,
        passkeys: PasskeyService,
        rate_limiter: Arc<dyn RateLimiter>,
        fingerprint_salt: String,
    ) -> Self {
        Self {
            config,
            tokens,
            otp,
            passkeys,
            rate_limiter,
            fingerprint_salt,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub(crate) fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub(super) fn otp(&self) -> &OtpService {
        &self.otp
    }

    pub(super) fn passkeys(&self) -> &PasskeyService {
        &self.passkeys
    }

    pub(super) fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    pub(super) fn fingerprint_salt(&self) -> &str {
        &self.fingerprint_salt
    }

    /// Fixed delay before failure responses, keeping rejection timing uniform
    /// across the different failure causes.
    pub(super) async fn pause_on_failure(&self) {
        let pause = self.config.failure_pause();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}
