//! Sliding-window rate limiting for the auth endpoints.
//!
//! Counters live in process memory and are keyed by `(store key, identifier)`
//! where the identifier is a salted hash of an email, a user id, or a client
//! IP plus user-agent signature. Raw IPs and emails never enter the map. The
//! limiter is best effort: multi-instance deployments count per instance.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

const WINDOW_SECS: u64 = 600;
const MAX_TRACKED_KEYS: usize = 10_000;

/// A rate-limited operation together with the dimension it counts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    OtpRequestPerEmail,
    OtpRequestPerClient,
    TokenOtpPerEmail,
    TokenRefreshPerClient,
    PasskeyAuthenticatePerClient,
    PasskeyRegisterPerUser,
}

impl RateLimitAction {
    pub(crate) fn store_key(self) -> &'static str {
        match self {
            Self::OtpRequestPerEmail | Self::OtpRequestPerClient => "auth.otp.request",
            Self::TokenOtpPerEmail => "auth.token",
            Self::TokenRefreshPerClient => "auth.token.refresh",
            Self::PasskeyAuthenticatePerClient => "auth.passkey.authenticate",
            Self::PasskeyRegisterPerUser => "auth.passkey.register",
        }
    }

    fn max_in_window(self) -> usize {
        match self {
            Self::OtpRequestPerEmail => 3,
            Self::OtpRequestPerClient => 10,
            Self::TokenOtpPerEmail => 10,
            Self::TokenRefreshPerClient => 30,
            Self::PasskeyAuthenticatePerClient => 10,
            Self::PasskeyRegisterPerUser => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

impl RateLimitDecision {
    #[must_use]
    pub(crate) fn is_limited(self) -> bool {
        matches!(self, Self::Limited)
    }
}

/// Pre-handler admission checks. Implementations must only record an attempt
/// when they return [`RateLimitDecision::Allowed`], so limited requests do
/// not extend their own lockout.
pub trait RateLimiter: Send + Sync {
    fn check_client(
        &self,
        action: RateLimitAction,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> RateLimitDecision;

    fn check_email(&self, action: RateLimitAction, email_normalized: &str) -> RateLimitDecision;

    fn check_user(&self, action: RateLimitAction, user_id: Uuid) -> RateLimitDecision;
}

/// Limiter that never limits. Used in tests.
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check_client(
        &self,
        _action: RateLimitAction,
        _ip: Option<&str>,
        _user_agent: Option<&str>,
    ) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }

    fn check_email(&self, _action: RateLimitAction, _email_normalized: &str) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }

    fn check_user(&self, _action: RateLimitAction, _user_id: Uuid) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

/// In-memory sliding-window limiter over salted identifiers.
pub struct SlidingWindowLimiter {
    salt: String,
    window: Duration,
    entries: Mutex<HashMap<(&'static str, String), Vec<Instant>>>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(salt: &str) -> Self {
        Self::with_window(salt, Duration::from_secs(WINDOW_SECS))
    }

    #[must_use]
    pub fn with_window(salt: &str, window: Duration) -> Self {
        Self {
            salt: salt.to_string(),
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, action: RateLimitAction, identifier: String) -> RateLimitDecision {
        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() > MAX_TRACKED_KEYS {
            let window = self.window;
            entries.retain(|_, stamps| {
                stamps
                    .iter()
                    .any(|stamp| now.duration_since(*stamp) < window)
            });
        }
        let stamps = entries.entry((action.store_key(), identifier)).or_default();
        stamps.retain(|stamp| now.duration_since(*stamp) < self.window);
        if stamps.len() >= action.max_in_window() {
            return RateLimitDecision::Limited;
        }
        stamps.push(now);
        RateLimitDecision::Allowed
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check_client(
        &self,
        action: RateLimitAction,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> RateLimitDecision {
        // Without an IP there is no stable identifier to key on.
        match client_identifier(&self.salt, ip, user_agent) {
            Some(identifier) => self.check(action, identifier),
            None => RateLimitDecision::Allowed,
        }
    }

    fn check_email(&self, action: RateLimitAction, email_normalized: &str) -> RateLimitDecision {
        let identifier = URL_SAFE_NO_PAD.encode(fingerprint(&self.salt, "email", email_normalized));
        self.check(action, identifier)
    }

    fn check_user(&self, action: RateLimitAction, user_id: Uuid) -> RateLimitDecision {
        let identifier =
            URL_SAFE_NO_PAD.encode(fingerprint(&self.salt, "user", &user_id.to_string()));
        self.check(action, identifier)
    }
}

/// Salted fingerprint for emails, IPs, and client signatures.
///
/// NUL separators keep `("ab", "c")` and `("a", "bc")` from colliding, and
/// the label keeps email and IP digests in disjoint spaces under one salt.
pub(super) fn fingerprint(salt: &str, label: &str, value: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([0u8]);
    hasher.update(label.as_bytes());
    hasher.update([0u8]);
    hasher.update(value.as_bytes());
    hasher.finalize().to_vec()
}

/// Identifier for client-keyed limits: salted hash over the IP and the
/// coarse user-agent signature. `None` when no IP was extracted.
pub(super) fn client_identifier(
    salt: &str,
    ip: Option<&str>,
    user_agent: Option<&str>,
) -> Option<String> {
    let ip = ip?;
    let signature = user_agent.map_or_else(|| "unknown".to_string(), normalize_user_agent);
    let digest = fingerprint(salt, "client", &format!("{ip}\u{0}{signature}"));
    Some(URL_SAFE_NO_PAD.encode(digest))
}

/// Collapse a raw user-agent header into a `browser/os/device` signature so
/// fingerprints survive patch-level version bumps.
pub(super) fn normalize_user_agent(user_agent: &str) -> String {
    let ua = user_agent.to_lowercase();
    // Order matters: Edge and Opera carry "chrome", Chrome carries "safari".
    let browser = if ua.contains("edg/") || ua.contains("edge") {
        "edge"
    } else if ua.contains("opr/") || ua.contains("opera") {
        "opera"
    } else if ua.contains("firefox") {
        "firefox"
    } else if ua.contains("chrome") || ua.contains("crios") {
        "chrome"
    } else if ua.contains("safari") {
        "safari"
    } else {
        "other"
    };
    let os = if ua.contains("windows") {
        "windows"
    } else if ua.contains("android") {
        "android"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "ios"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "macos"
    } else if ua.contains("linux") {
        "linux"
    } else {
        "other"
    };
    // Tablet before mobile: Android tablets still carry "android".
    let device = if Regex::new(r"(ipad|tablet)").is_ok_and(|re| re.is_match(&ua)) {
        "tablet"
    } else if Regex::new(r"(mobi|iphone|android)").is_ok_and(|re| re.is_match(&ua)) {
        "mobile"
    } else {
        "desktop"
    };
    format!("{browser}/{os}/{device}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const UA_CHROME_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
         AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
    const UA_SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) \
         AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1";

    #[test]
    fn normalize_user_agent_buckets_common_browsers() {
        assert_eq!(normalize_user_agent(UA_CHROME_WINDOWS), "chrome/windows/desktop");
        assert_eq!(normalize_user_agent(UA_SAFARI_IPHONE), "safari/ios/mobile");
        assert_eq!(
            normalize_user_agent("Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0"),
            "firefox/linux/desktop"
        );
        assert_eq!(normalize_user_agent("curl/8.6.0"), "other/other/desktop");
    }

    #[test]
    fn normalize_user_agent_stable_across_versions() {
        let v126 = normalize_user_agent(UA_CHROME_WINDOWS);
        let v127 = normalize_user_agent(&UA_CHROME_WINDOWS.replace("126.0.0.0", "127.0.2.1"));
        assert_eq!(v126, v127);
    }

    #[test]
    fn fingerprint_depends_on_salt_and_label() {
        let base = fingerprint("salt-a", "email", "a@example.com");
        assert_eq!(base, fingerprint("salt-a", "email", "a@example.com"));
        assert_ne!(base, fingerprint("salt-b", "email", "a@example.com"));
        assert_ne!(base, fingerprint("salt-a", "ip", "a@example.com"));
    }

    #[test]
    fn client_identifier_requires_ip() {
        assert!(client_identifier("salt", None, Some(UA_CHROME_WINDOWS)).is_none());
        let with_ua = client_identifier("salt", Some("1.2.3.4"), Some(UA_CHROME_WINDOWS));
        assert!(with_ua.is_some());
        assert_eq!(
            with_ua,
            client_identifier("salt", Some("1.2.3.4"), Some(UA_CHROME_WINDOWS))
        );
        assert_ne!(
            with_ua,
            client_identifier("salt", Some("5.6.7.8"), Some(UA_CHROME_WINDOWS))
        );
    }

    #[test]
    fn limiter_caps_attempts_per_email() {
        let limiter = SlidingWindowLimiter::new("salt");
        for _ in 0..3 {
            let decision = limiter.check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com");
            assert_eq!(decision, RateLimitDecision::Allowed);
        }
        let decision = limiter.check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com");
        assert!(decision.is_limited());

        // Another email is unaffected.
        let decision = limiter.check_email(RateLimitAction::OtpRequestPerEmail, "b@example.com");
        assert_eq!(decision, RateLimitDecision::Allowed);
    }

    #[test]
    fn limiter_counts_store_keys_independently() {
        let limiter = SlidingWindowLimiter::new("salt");
        for _ in 0..3 {
            limiter.check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com");
        }
        assert!(
            limiter
                .check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com")
                .is_limited()
        );
        assert_eq!(
            limiter.check_email(RateLimitAction::TokenOtpPerEmail, "a@example.com"),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn limiter_forgets_attempts_outside_window() {
        let limiter = SlidingWindowLimiter::with_window("salt", Duration::from_millis(20));
        for _ in 0..3 {
            limiter.check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com");
        }
        assert!(
            limiter
                .check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com")
                .is_limited()
        );
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(
            limiter.check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com"),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn limiter_allows_clients_without_ip() {
        let limiter = SlidingWindowLimiter::new("salt");
        for _ in 0..20 {
            let decision =
                limiter.check_client(RateLimitAction::OtpRequestPerClient, None, Some("curl/8"));
            assert_eq!(decision, RateLimitDecision::Allowed);
        }
    }

    #[test]
    fn limited_requests_do_not_extend_the_window() {
        let limiter = SlidingWindowLimiter::with_window("salt", Duration::from_millis(40));
        for _ in 0..3 {
            limiter.check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com");
        }
        // Hammering while limited must not push the reset further out.
        for _ in 0..5 {
            assert!(
                limiter
                    .check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com")
                    .is_limited()
            );
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            limiter.check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com"),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn noop_limiter_always_allows() {
        let limiter = NoopRateLimiter;
        for _ in 0..100 {
            assert_eq!(
                limiter.check_email(RateLimitAction::OtpRequestPerEmail, "a@example.com"),
                RateLimitDecision::Allowed
            );
        }
    }

    #[test]
    fn limiter_caps_per_user() {
        let limiter = SlidingWindowLimiter::new("salt");
        let user_id = Uuid::new_v4();
        for _ in 0..10 {
            assert_eq!(
                limiter.check_user(RateLimitAction::PasskeyRegisterPerUser, user_id),
                RateLimitDecision::Allowed
            );
        }
        assert!(
            limiter
                .check_user(RateLimitAction::PasskeyRegisterPerUser, user_id)
                .is_limited()
        );
    }
}
