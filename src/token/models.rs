use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row, postgres::PgRow};
use std::net::IpAddr;
use uuid::Uuid;

/// Revocation/audit row backing a self-describing access token.
#[derive(Debug, Clone)]
pub struct AccessTokenRecord {
    pub jti: Uuid,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for AccessTokenRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            jti: row.try_get("jti")?,
            user_id: row.try_get("user_id")?,
            issued_at: row.try_get("issued_at")?,
            expires_at: row.try_get("expires_at")?,
            revoked_at: row.try_get("revoked_at")?,
        })
    }
}

/// One refresh token in a rotation lineage. `token_family_id` is shared by
/// every descendant of the original login; `parent_id` points at the token
/// this one was rotated from.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_family_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for RefreshTokenRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            token_family_id: row.try_get("token_family_id")?,
            parent_id: row.try_get("parent_id")?,
            issued_at: row.try_get("issued_at")?,
            expires_at: row.try_get("expires_at")?,
            revoked_at: row.try_get("revoked_at")?,
            used_at: row.try_get("used_at")?,
            ip: row.try_get("ip")?,
            user_agent: row.try_get("user_agent")?,
        })
    }
}

/// A freshly minted access/refresh pair. `refresh_token` is the raw value for
/// the cookie; only its hash is ever stored.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub user_id: Uuid,
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub refresh_expires_in: i64,
    pub token_family_id: Uuid,
}

/// Terminal outcomes of a refresh call. Reuse detection is reported
/// separately so callers can log the incident, but it must surface to the
/// client exactly like `Unauthorized`.
#[derive(Debug)]
pub enum RefreshOutcome {
    Rotated(IssuedTokens),
    Unauthorized,
    ReuseRevoked {
        user_id: Uuid,
        token_family_id: Uuid,
        revoked: u64,
    },
}

/// Result of revoking a whole token family, e.g. on logout.
#[derive(Debug, Clone, Copy)]
pub struct RevokedFamily {
    pub user_id: Uuid,
    pub token_family_id: Uuid,
    pub revoked: u64,
}

/// Identity extracted from a bearer token that passed both signature
/// verification and the revocation-row check.
#[derive(Debug, Clone, Copy)]
pub struct AccessTokenIdentity {
    pub user_id: Uuid,
    pub jti: Uuid,
}
