//! Auth handlers and supporting modules.
//!
//! Three grant surfaces feed the same token pipeline: email one-time codes,
//! passkey assertions, and refresh-token rotation. Credential management and
//! logout round out the module.
//!
//! ## Rate Limiting
//!
//! Issuance and verification endpoints are throttled inside a 10-minute
//! sliding window, keyed per store and identifier:
//!
//! - **Code requests:** 3 per email and 10 per client.
//! - **Token grants:** 10 code redemptions per email, 30 refresh grants per client.
//! - **Passkeys:** 10 assertions per client, 10 registrations per user.
//!
//! Counters are process-local and reset on restart; the store remains the
//! source of truth for per-challenge attempt caps.
//!
//! ## Failure Shape
//!
//! Failure responses share a fixed pause and a small JSON body of the form
//! `{"error": "<code>"}`. The precise cause lands in logs and the
//! `auth_attempts` trail as salted hashes, never in the response.

mod audit;
pub(crate) mod otp;
pub(crate) mod passkey;
pub(crate) mod principal;
mod rate_limit;
mod state;
#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod token;
pub(crate) mod types;
mod utils;

pub use rate_limit::{NoopRateLimiter, RateLimiter, SlidingWindowLimiter};
pub use state::{AuthConfig, AuthState};
