use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// User entity. Owned exclusively by one company.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub company_id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub password_changed_at: DateTime<Utc>,
    /// Consecutive failures since the last successful verification.
    pub failed_login_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_failed_login_at: Option<DateTime<Utc>>,
    pub mfa_enabled: bool,
    /// Sessions created at or before this instant are no longer valid.
    pub force_logout_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        company_id: Uuid,
        email: impl Into<String>,
        password_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_id,
            email: email.into(),
            password_hash: password_hash.into(),
            password_changed_at: now,
            failed_login_attempts: 0,
            locked_until: None,
            last_failed_login_at: None,
            mfa_enabled: false,
            force_logout_at: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sanitized(&self) -> SanitizedUser {
        SanitizedUser {
            id: self.id,
            company_id: self.company_id,
            email: self.email.clone(),
            mfa_enabled: self.mfa_enabled,
        }
    }
}

/// User view safe to return over the wire.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct SanitizedUser {
    pub id: Uuid,
    pub company_id: Uuid,
    pub email: String,
    pub mfa_enabled: bool,
}
