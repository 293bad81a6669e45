use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row, postgres::PgRow};
use uuid::Uuid;

/// A stored credential loaded from `passkeys`.
///
/// `public_key` holds the serialized `webauthn-rs` credential (COSE key,
/// policy flags, internal counter); `counter` mirrors the signature counter
/// in its own column so clone detection is one conditional UPDATE.
#[derive(Debug, Clone)]
pub struct PasskeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub counter: i64,
    pub device_type: String,
    pub backed_up: bool,
    pub transports: Option<String>,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for PasskeyRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            credential_id: row.try_get("credential_id")?,
            public_key: row.try_get("public_key")?,
            counter: row.try_get("counter")?,
            device_type: row.try_get("device_type")?,
            backed_up: row.try_get("backed_up")?,
            transports: row.try_get("transports")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}

/// Client-facing view of a stored passkey. Never exposes key material.
#[derive(Debug, Clone)]
pub struct PasskeySummary {
    pub id: Uuid,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for PasskeySummary {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}

/// Which ceremony a stored challenge belongs to. A registration challenge can
/// never complete an authentication, or the other way round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Registration,
    Authentication,
}

impl ChallengeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Authentication => "authentication",
        }
    }

    /// Parse the persisted `passkey_challenges.kind` value.
    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "registration" => Ok(Self::Registration),
            "authentication" => Ok(Self::Authentication),
            _ => Err(sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid passkey_challenges.kind value: {value}"),
            )))),
        }
    }
}

/// A consumed ceremony challenge. `state` carries the serialized in-progress
/// `webauthn-rs` ceremony as JSON text.
#[derive(Debug, Clone)]
pub struct PasskeyChallengeRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub state: String,
    pub kind: ChallengeKind,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PasskeyChallengeRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            state: row.try_get("state")?,
            kind: ChallengeKind::from_db(&kind)?,
            expires_at: row.try_get("expires_at")?,
            used_at: row.try_get("used_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Identity proven by a completed passkey authentication.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedPasskey {
    pub user_id: Uuid,
    pub passkey_id: Uuid,
}
