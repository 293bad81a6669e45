use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row, postgres::PgRow};
use uuid::Uuid;

/// A pending email code challenge loaded from `auth_challenges`.
///
/// The raw challenge token and code never appear here; the row carries only
/// their hashes.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub id: Uuid,
    pub email: String,
    pub code_hash: Vec<u8>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AuthChallenge {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            code_hash: row.try_get("code_hash")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            expires_at: row.try_get("expires_at")?,
            used_at: row.try_get("used_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// What the client gets back after requesting a code: the opaque correlator
/// for the follow-up verify call plus the challenge lifetime.
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub challenge_token: String,
    pub expires_in: i64,
}

/// Terminal outcomes of verifying a submitted code.
///
/// `Expired` covers both aged-out and already-consumed challenges and must
/// never be collapsed into `Invalid`; clients re-request a code on `Expired`
/// and re-type it on `Invalid`.
#[derive(Debug)]
pub enum VerifyOutcome {
    Verified { challenge_id: Uuid, email: String },
    Invalid,
    Expired,
    MaxAttempts,
}
