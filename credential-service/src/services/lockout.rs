//! Failed-login tracking and account lockout.
//!
//! Unlocked -> (threshold consecutive failures) -> Locked -> (window elapses
//! or a successful verification) -> Unlocked.
//!
//! Every attempt is appended to `login_attempts`. Unlike audit events those
//! writes must succeed, so their errors propagate.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::db::UnitOfWork;
use crate::models::{AttemptContext, AuditEvent, AuditEventType, LoginAttempt, LoginFailureReason, User};
use crate::utils::Clock;

use super::{AuditSink, AuthError};

#[derive(Debug, Clone, Copy)]
pub struct LockoutSettings {
    pub threshold: i32,
    pub duration: Duration,
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            duration: Duration::minutes(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked { failed_attempts: i32 },
    Locked { until: DateTime<Utc> },
}

#[derive(Clone)]
pub struct LockoutGuard {
    settings: LockoutSettings,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl LockoutGuard {
    pub fn new(settings: LockoutSettings, clock: Arc<dyn Clock>, audit: AuditSink) -> Self {
        Self {
            settings,
            clock,
            audit,
        }
    }

    pub fn is_locked(user: &User, now: DateTime<Utc>) -> bool {
        user.locked_until.map_or(false, |until| now < until)
    }

    /// Seconds until the lock lifts, zero when unlocked.
    pub fn retry_after_seconds(user: &User, now: DateTime<Utc>) -> i64 {
        user.locked_until
            .map(|until| (until - now).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// Count a wrong password. Locks the account once the consecutive
    /// failure count reaches the threshold.
    #[tracing::instrument(skip(self, uow, user, ctx), fields(user_id = %user.id))]
    pub async fn record_failure(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
        ctx: &AttemptContext,
    ) -> Result<LockState, AuthError> {
        let now = self.clock.now();
        let failed_attempts = uow.increment_failed_logins(user.id, now).await?;
        uow.insert_login_attempt(&LoginAttempt::failed(
            Some(user.id),
            ctx,
            LoginFailureReason::BadPassword,
            now,
        ))
        .await?;

        if failed_attempts < self.settings.threshold {
            tracing::debug!(failed_attempts, "Login failure recorded");
            return Ok(LockState::Unlocked { failed_attempts });
        }

        let until = now + self.settings.duration;
        uow.lock_user(user.id, until).await?;

        tracing::warn!(failed_attempts, locked_until = %until, "Account locked");
        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::AccountLocked, now)
                    .user(Some(user.company_id), Some(user.id))
                    .origin(ctx.ip_address.clone(), ctx.user_agent.clone())
                    .detail(serde_json::json!({
                        "failed_attempts": failed_attempts,
                        "locked_until": until,
                    })),
            )
            .await;

        Ok(LockState::Locked { until })
    }

    /// Reset the counter and clear any lock after a verified password.
    pub async fn record_success(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
        ctx: &AttemptContext,
    ) -> Result<(), AuthError> {
        let now = self.clock.now();
        uow.reset_failed_logins(user.id).await?;
        uow.insert_login_attempt(&LoginAttempt::succeeded(user.id, ctx, now))
            .await?;
        Ok(())
    }

    /// Record an attempt that never reached password verification.
    pub async fn record_rejected(
        &self,
        uow: &dyn UnitOfWork,
        user_id: Option<uuid::Uuid>,
        ctx: &AttemptContext,
        reason: LoginFailureReason,
    ) -> Result<(), AuthError> {
        let now = self.clock.now();
        uow.insert_login_attempt(&LoginAttempt::failed(user_id, ctx, reason, now))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_is_locked_window() {
        let now = Utc::now();
        let mut user = User::new(Uuid::new_v4(), "a@example.com", "hash", now);
        assert!(!LockoutGuard::is_locked(&user, now));

        user.locked_until = Some(now + Duration::minutes(15));
        assert!(LockoutGuard::is_locked(&user, now));
        assert_eq!(LockoutGuard::retry_after_seconds(&user, now), 900);

        let later = now + Duration::minutes(15);
        assert!(!LockoutGuard::is_locked(&user, later));
        assert_eq!(LockoutGuard::retry_after_seconds(&user, later), 0);
    }
}
