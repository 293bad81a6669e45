//! # atesti
//!
//! `atesti` is a passwordless authentication and session token service. Users
//! prove control of an email inbox or a WebAuthn passkey and receive a signed
//! access token plus a rotating refresh token.
//!
//! ## Email One-Time Codes
//!
//! `POST /auth/otp/request` stores a hashed six-digit code bound to an opaque
//! challenge token and queues the email through a transactional outbox, so the
//! delivered code can never drift from the stored hash. The code is redeemed
//! at `POST /auth/token` with the `email_otp` grant; every challenge carries
//! its own expiry and attempt budget.
//!
//! ## Passkeys (WebAuthn)
//!
//! Registration and discoverable authentication ceremonies persist their
//! in-progress state server-side, pinned to the browser origin that started
//! them. Signature counters are enforced on every assertion; a counter that
//! moves backwards is treated as a cloned credential and rejected.
//!
//! ## Sessions
//!
//! Access tokens are PASETO `v4.public`, verified offline and revocable by
//! `jti`. Refresh tokens are opaque, stored hashed, and rotate on every use.
//! Replaying an already-rotated refresh token outside a short grace window is
//! treated as theft and revokes the whole token family.

pub mod api;
pub mod cli;
pub mod otp;
pub mod token;
pub mod webauthn;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
