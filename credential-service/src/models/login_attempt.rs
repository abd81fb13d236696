//! Login attempt model - immutable record of every credential check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::session::SessionSource;

/// Why a login attempt failed. Recorded internally, never returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginFailureReason {
    UnknownUser,
    BadPassword,
    AccountLocked,
    AccountInactive,
}

impl LoginFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginFailureReason::UnknownUser => "unknown_user",
            LoginFailureReason::BadPassword => "bad_password",
            LoginFailureReason::AccountLocked => "account_locked",
            LoginFailureReason::AccountInactive => "account_inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown_user" => Some(LoginFailureReason::UnknownUser),
            "bad_password" => Some(LoginFailureReason::BadPassword),
            "account_locked" => Some(LoginFailureReason::AccountLocked),
            "account_inactive" => Some(LoginFailureReason::AccountInactive),
            _ => None,
        }
    }
}

/// Where a login came from.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub email: String,
    pub source: SessionSource,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Append-only login attempt row.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub email: String,
    pub success: bool,
    pub failure_reason: Option<LoginFailureReason>,
    pub source: SessionSource,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl LoginAttempt {
    pub fn succeeded(user_id: Uuid, ctx: &AttemptContext, now: DateTime<Utc>) -> Self {
        Self::build(Some(user_id), ctx, true, None, now)
    }

    pub fn failed(
        user_id: Option<Uuid>,
        ctx: &AttemptContext,
        reason: LoginFailureReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(user_id, ctx, false, Some(reason), now)
    }

    fn build(
        user_id: Option<Uuid>,
        ctx: &AttemptContext,
        success: bool,
        failure_reason: Option<LoginFailureReason>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            email: ctx.email.clone(),
            success,
            failure_reason,
            source: ctx.source,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            attempted_at: now,
        }
    }
}

/// Prior password hash, kept to reject reuse.
#[derive(Debug, Clone, FromRow)]
pub struct PasswordHistoryEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl PasswordHistoryEntry {
    pub fn new(user_id: Uuid, password_hash: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            password_hash: password_hash.into(),
            created_at: now,
        }
    }
}
