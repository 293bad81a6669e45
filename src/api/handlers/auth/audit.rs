//! Append-only audit trail for authentication attempts.
//!
//! Writes are fire and forget: an audit failure is logged and never fails the
//! request it describes. Emails and IPs land as salted hashes only, so the
//! table supports abuse investigations without holding raw identifiers.

use sqlx::PgPool;
use tracing::{Instrument, error};
use uuid::Uuid;

use super::rate_limit::fingerprint;

#[derive(Debug, Clone, Copy)]
pub(super) enum AuthMethod {
    OtpRequest,
    EmailOtp,
    RefreshToken,
    Passkey,
    PasskeyRegister,
}

impl AuthMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::OtpRequest => "otp_request",
            Self::EmailOtp => "email_otp",
            Self::RefreshToken => "refresh_token",
            Self::Passkey => "passkey",
            Self::PasskeyRegister => "passkey_register",
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn record_attempt(
    pool: &PgPool,
    salt: &str,
    method: AuthMethod,
    outcome: &str,
    email: Option<&str>,
    ip: Option<&str>,
    user_id: Option<Uuid>,
    request_id: &str,
) {
    let email_hash = email.map(|email| fingerprint(salt, "email", email));
    let ip_hash = ip.map(|ip| fingerprint(salt, "ip", ip));
    let query = r"
        INSERT INTO auth_attempts (email_hash, ip_hash, outcome, method, request_id, user_id)
        VALUES ($1, $2, $3, $4, $5, $6)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT"
    );
    if let Err(err) = sqlx::query(query)
        .bind(email_hash)
        .bind(ip_hash)
        .bind(outcome)
        .bind(method.as_str())
        .bind(request_id)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
    {
        error!("Failed to record auth attempt: {err}");
    }
}
