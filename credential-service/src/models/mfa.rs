use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Pending one-time code. At most one per user.
#[derive(Debug, Clone, FromRow)]
pub struct MfaCode {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
    pub attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl MfaCode {
    pub fn new(user_id: Uuid, code_hash: String, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            code_hash,
            attempts: 0,
            expires_at,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Single-use recovery code, stored hashed.
#[derive(Debug, Clone, FromRow)]
pub struct RecoveryCode {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RecoveryCode {
    pub fn new(user_id: Uuid, code_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            code_hash,
            used_at: None,
            created_at: now,
        }
    }
}

/// Device fingerprint that may skip MFA until `trust_expires_at`.
#[derive(Debug, Clone, FromRow)]
pub struct TrustedDevice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub fingerprint_hash: String,
    pub label: Option<String>,
    pub trusted_at: DateTime<Utc>,
    pub trust_expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl TrustedDevice {
    pub fn is_trusted(&self, now: DateTime<Utc>) -> bool {
        now < self.trust_expires_at
    }
}

/// Persistent login token. The user holds `prefix.secret`; only the
/// prefix and a hash of the secret are stored.
#[derive(Debug, Clone, FromRow)]
pub struct RememberMeToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_prefix: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
