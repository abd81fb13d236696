//! Server-side sessions.
//!
//! A session id is a bearer capability: whoever holds a live, valid `sid`
//! is the authenticated party. Expiry slides on activity but never past the
//! absolute ceiling fixed at creation.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::models::{
    AdmissionOutcome, AttemptContext, AuditEvent, AuditEventType, Company, Session,
    SessionSource, SessionSummary, User,
};
use crate::utils::Clock;

use super::credential::{generate_secure_token, hash_token};
use super::{AuditSink, AuthError};

const SID_BYTES: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub absolute_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::minutes(30),
            absolute_timeout: Duration::hours(12),
        }
    }
}

/// Where a session is being opened from.
#[derive(Debug, Clone, Default)]
pub struct SessionOrigin {
    pub source: SessionSource,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl From<&AttemptContext> for SessionOrigin {
    fn from(ctx: &AttemptContext) -> Self {
        Self {
            source: ctx.source,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    settings: SessionSettings,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl SessionManager {
    pub fn new(settings: SessionSettings, clock: Arc<dyn Clock>, audit: AuditSink) -> Self {
        Self {
            settings,
            clock,
            audit,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Live and not cut off by a forced logout.
    pub fn is_valid(session: &Session, user: &User, now: DateTime<Utc>) -> bool {
        session.is_valid(user.force_logout_at, now)
    }

    /// Open a session under the company's concurrent-session limit.
    ///
    /// Counting, eviction and insert happen in one store primitive that is
    /// serialised per user.
    #[tracing::instrument(skip(self, uow, user, company, origin), fields(user_id = %user.id, source = %origin.source))]
    pub async fn create_session(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
        company: &Company,
        origin: &SessionOrigin,
        mfa_verified: bool,
    ) -> Result<Session, AuthError> {
        let now = self.clock.now();
        let absolute_expires_at = now + self.settings.absolute_timeout;
        let session = Session {
            sid: generate_secure_token(SID_BYTES),
            user_id: Some(user.id),
            company_id: Some(company.id),
            source: origin.source,
            ip_address: origin.ip_address.clone(),
            user_agent: origin.user_agent.clone(),
            created_at: now,
            last_activity_at: now,
            expires_at: (now + self.settings.idle_timeout).min(absolute_expires_at),
            absolute_expires_at,
            mfa_verified,
        };

        let limit = company.session_limit();
        let outcome = uow
            .admit_session(&session, limit, user.force_logout_at, now)
            .await?;

        match outcome {
            AdmissionOutcome::Admitted { evicted } => {
                for sid in &evicted {
                    self.audit
                        .record(
                            uow,
                            AuditEvent::new(AuditEventType::SessionRevoked, now)
                                .user(Some(company.id), Some(user.id))
                                .session(hash_token(sid))
                                .detail(serde_json::json!({ "reason": "session_limit" })),
                        )
                        .await;
                }

                tracing::info!(evicted = evicted.len(), "Session created");
                self.audit
                    .record(
                        uow,
                        AuditEvent::new(AuditEventType::SessionCreated, now)
                            .user(Some(company.id), Some(user.id))
                            .session(hash_token(&session.sid))
                            .origin(session.ip_address.clone(), session.user_agent.clone())
                            .detail(serde_json::json!({
                                "source": session.source.as_str(),
                                "mfa_verified": session.mfa_verified,
                            })),
                    )
                    .await;

                Ok(session)
            }
            AdmissionOutcome::Blocked => {
                tracing::info!("Session limit reached, new session blocked");
                self.audit
                    .record(
                        uow,
                        AuditEvent::new(AuditEventType::SessionLimitBlocked, now)
                            .user(Some(company.id), Some(user.id))
                            .origin(session.ip_address.clone(), session.user_agent.clone()),
                    )
                    .await;
                Err(AuthError::SessionLimitExceeded)
            }
            AdmissionOutcome::PromptRequired(sessions) => {
                tracing::info!(competing = sessions.len(), "Session limit reached, prompting user");
                Err(AuthError::LimitReachedChoice { sessions })
            }
        }
    }

    /// Resolve a `LimitReachedChoice`: end the named session, then retry.
    pub async fn create_session_replacing(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
        company: &Company,
        origin: &SessionOrigin,
        mfa_verified: bool,
        revoke_sid: &str,
    ) -> Result<Session, AuthError> {
        let target = uow
            .get_session(revoke_sid)
            .await?
            .filter(|s| s.user_id == Some(user.id))
            .ok_or(AuthError::InvalidSession)?;

        self.destroy(uow, &target.sid).await?;
        self.create_session(uow, user, company, origin, mfa_verified)
            .await
    }

    /// Slide the idle deadline, capped at the absolute ceiling.
    pub async fn touch(&self, uow: &dyn UnitOfWork, sid: &str) -> Result<Session, AuthError> {
        let now = self.clock.now();
        let mut session = uow
            .get_session(sid)
            .await?
            .filter(|s| s.is_live(now))
            .ok_or(AuthError::InvalidSession)?;

        let expires_at = (now + self.settings.idle_timeout).min(session.absolute_expires_at);
        if !uow.update_session_activity(sid, now, expires_at).await? {
            return Err(AuthError::InvalidSession);
        }

        session.last_activity_at = now;
        session.expires_at = expires_at;
        Ok(session)
    }

    /// Resolve a presented sid to its session and user. The session must be
    /// valid and past MFA; activity is recorded.
    pub async fn authenticate(
        &self,
        uow: &dyn UnitOfWork,
        sid: &str,
    ) -> Result<(Session, User), AuthError> {
        let now = self.clock.now();
        let session = uow
            .get_session(sid)
            .await?
            .ok_or(AuthError::InvalidSession)?;
        let user_id = session.user_id.ok_or(AuthError::InvalidSession)?;
        let user = uow
            .get_user(user_id)
            .await?
            .filter(|u| u.active)
            .ok_or(AuthError::InvalidSession)?;

        if !Self::is_valid(&session, &user, now) {
            return Err(AuthError::InvalidSession);
        }
        if !session.mfa_verified {
            return Err(AuthError::MfaRequired);
        }

        let session = self.touch(uow, sid).await?;
        Ok((session, user))
    }

    /// Idempotent.
    pub async fn destroy(&self, uow: &dyn UnitOfWork, sid: &str) -> Result<(), AuthError> {
        let existing = uow.get_session(sid).await?;
        if !uow.delete_session(sid).await? {
            return Ok(());
        }

        if let Some(session) = existing {
            self.audit
                .record(
                    uow,
                    AuditEvent::new(AuditEventType::SessionRevoked, self.clock.now())
                        .user(session.company_id, session.user_id)
                        .session(hash_token(sid)),
                )
                .await;
        }
        Ok(())
    }

    /// Idempotent. Returns how many sessions were removed.
    pub async fn destroy_all_for_user(
        &self,
        uow: &dyn UnitOfWork,
        user_id: Uuid,
        except_sid: Option<&str>,
    ) -> Result<u64, AuthError> {
        let removed = uow.delete_user_sessions(user_id, except_sid).await?;
        if removed > 0 {
            tracing::info!(%user_id, removed, "User sessions destroyed");
            self.audit
                .record(
                    uow,
                    AuditEvent::new(AuditEventType::SessionRevoked, self.clock.now())
                        .user(None, Some(user_id))
                        .detail(serde_json::json!({ "count": removed })),
                )
                .await;
        }
        Ok(removed)
    }

    /// Invalidate every session created up to now.
    pub async fn force_logout_user(
        &self,
        uow: &dyn UnitOfWork,
        user_id: Uuid,
    ) -> Result<DateTime<Utc>, AuthError> {
        let now = self.clock.now();
        uow.set_force_logout(user_id, now).await?;
        tracing::info!(%user_id, "Forced logout");
        Ok(now)
    }

    /// The user's currently valid sessions.
    pub async fn list_sessions(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
    ) -> Result<Vec<SessionSummary>, AuthError> {
        let now = self.clock.now();
        Ok(uow
            .list_user_sessions(user.id)
            .await?
            .iter()
            .filter(|s| Self::is_valid(s, user, now))
            .map(Session::summary)
            .collect())
    }
}
