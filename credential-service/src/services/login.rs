//! Login orchestration.
//!
//! Ties the credential check, lockout, MFA gating, trusted devices,
//! sessions and remember-me tokens into the flows the route layer exposes.

use std::sync::Arc;
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::models::{
    AttemptContext, AuditEvent, AuditEventType, Company, LoginFailureReason,
    PasswordHistoryEntry, SanitizedUser, Session, SessionSource, User,
};
use crate::utils::{Clock, Password, PasswordHashString};

use super::credential;
use super::lockout::{LockState, LockoutGuard};
use super::mfa::{CodeDispatch, MfaCoordinator};
use super::policy::PolicyEngine;
use super::remember_me::RememberMeService;
use super::session::{SessionManager, SessionOrigin};
use super::{AuditSink, AuthError};

/// Credentials and origin of a login.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: Password,
    pub source: SessionSource,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Client-supplied device fingerprint for the trusted-device check.
    pub device_fingerprint: Option<String>,
    pub remember_me: bool,
    /// Session to end when the company prompts on the session limit.
    pub replace_session: Option<String>,
}

impl LoginRequest {
    fn context(&self) -> AttemptContext {
        AttemptContext {
            email: normalize_email(&self.email),
            source: self.source,
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Second-factor submission for a pending session.
#[derive(Debug, Clone)]
pub struct MfaVerification {
    pub user_id: Uuid,
    pub code: String,
    pub sid: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Trust this device fingerprint for future logins.
    pub trust_device: Option<String>,
    pub remember_me: bool,
}

/// A session that has cleared every factor.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub session: Session,
    pub user: SanitizedUser,
    pub remember_me_token: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated(AuthenticatedSession),
    /// A session exists but is not usable until the code is verified.
    MfaPending {
        session: Session,
        user: SanitizedUser,
        challenge: CodeDispatch,
    },
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone)]
pub struct LoginService {
    lockout: LockoutGuard,
    sessions: SessionManager,
    mfa: MfaCoordinator,
    remember_me: RememberMeService,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl LoginService {
    pub fn new(
        lockout: LockoutGuard,
        sessions: SessionManager,
        mfa: MfaCoordinator,
        remember_me: RememberMeService,
        clock: Arc<dyn Clock>,
        audit: AuditSink,
    ) -> Self {
        Self {
            lockout,
            sessions,
            mfa,
            remember_me,
            clock,
            audit,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn mfa(&self) -> &MfaCoordinator {
        &self.mfa
    }

    pub fn remember_me(&self) -> &RememberMeService {
        &self.remember_me
    }

    /// Create a user under `company`. The password must satisfy the
    /// company policy and becomes the first history entry.
    pub async fn provision_user(
        &self,
        uow: &dyn UnitOfWork,
        company: &Company,
        email: &str,
        password: &Password,
    ) -> Result<User, AuthError> {
        let email = normalize_email(email);
        if uow.find_user_by_email(&email).await?.is_some() {
            return Err(AuthError::InvalidRequest(
                "email is already registered".to_string(),
            ));
        }
        PolicyEngine::validate_password(password, &company.password_policy)?;

        let now = self.clock.now();
        let digest = credential::hash(password)?.into_string();
        let user = User::new(company.id, email, digest.clone(), now);
        uow.insert_user(&user).await?;
        uow.insert_password_history(&PasswordHistoryEntry::new(user.id, digest, now))
            .await?;

        tracing::info!(user_id = %user.id, company_id = %company.id, "User provisioned");
        Ok(user)
    }

    /// Password login. Returns a usable session, or a pending one when a
    /// second factor is still owed.
    #[tracing::instrument(skip(self, uow, request), fields(source = %request.source))]
    pub async fn login(
        &self,
        uow: &dyn UnitOfWork,
        request: &LoginRequest,
    ) -> Result<LoginOutcome, AuthError> {
        let ctx = request.context();
        let user = self.check_credentials(uow, &ctx, &request.password).await?;
        let company = self.company_of(uow, &user).await?;
        let now = self.clock.now();

        if PolicyEngine::is_expired(
            user.password_changed_at,
            company.password_policy.max_age_days,
            now,
        ) {
            return Err(AuthError::PasswordExpired);
        }

        let trusted = match request.device_fingerprint.as_deref() {
            Some(fingerprint) => {
                self.mfa
                    .devices()
                    .is_trusted(uow, user.id, fingerprint)
                    .await?
            }
            None => false,
        };
        let needs_challenge = MfaCoordinator::requires_mfa(&user, &company) && !trusted;

        let origin = SessionOrigin::from(&ctx);
        let session = match request.replace_session.as_deref() {
            Some(revoke_sid) => {
                self.sessions
                    .create_session_replacing(uow, &user, &company, &origin, !needs_challenge, revoke_sid)
                    .await?
            }
            None => {
                self.sessions
                    .create_session(uow, &user, &company, &origin, !needs_challenge)
                    .await?
            }
        };

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::LoginSucceeded, now)
                    .user(Some(company.id), Some(user.id))
                    .session(credential::hash_token(&session.sid))
                    .origin(ctx.ip_address.clone(), ctx.user_agent.clone())
                    .detail(serde_json::json!({
                        "mfa_pending": needs_challenge,
                        "trusted_device": trusted,
                    })),
            )
            .await;

        if needs_challenge {
            let challenge = self.mfa.send_code(uow, &user).await?;
            return Ok(LoginOutcome::MfaPending {
                session,
                user: user.sanitized(),
                challenge,
            });
        }

        let remember_me_token = if request.remember_me {
            Some(self.remember_me.issue(uow, user.id).await?)
        } else {
            None
        };

        Ok(LoginOutcome::Authenticated(AuthenticatedSession {
            session,
            user: user.sanitized(),
            remember_me_token,
        }))
    }

    pub async fn verify_mfa_code(
        &self,
        uow: &dyn UnitOfWork,
        verification: &MfaVerification,
    ) -> Result<AuthenticatedSession, AuthError> {
        let user = uow
            .get_user(verification.user_id)
            .await?
            .filter(|u| u.active)
            .ok_or(AuthError::InvalidCode)?;

        let session = self
            .mfa
            .verify_code(uow, &user, &verification.code, &verification.sid)
            .await?;
        self.finish_mfa(uow, &user, session, verification).await
    }

    pub async fn verify_mfa_recovery_code(
        &self,
        uow: &dyn UnitOfWork,
        verification: &MfaVerification,
    ) -> Result<AuthenticatedSession, AuthError> {
        let user = uow
            .get_user(verification.user_id)
            .await?
            .filter(|u| u.active)
            .ok_or(AuthError::InvalidRecoveryCode)?;

        let session = self
            .mfa
            .verify_recovery_code(uow, &user, &verification.code, &verification.sid)
            .await?;
        self.finish_mfa(uow, &user, session, verification).await
    }

    async fn finish_mfa(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
        session: Session,
        verification: &MfaVerification,
    ) -> Result<AuthenticatedSession, AuthError> {
        if let Some(fingerprint) = verification.trust_device.as_deref() {
            let devices = self.mfa.devices();
            devices
                .trust(
                    uow,
                    user.id,
                    fingerprint,
                    verification.user_agent.clone(),
                    devices.default_ttl(),
                )
                .await?;
        }

        let remember_me_token = if verification.remember_me {
            Some(self.remember_me.issue(uow, user.id).await?)
        } else {
            None
        };

        Ok(AuthenticatedSession {
            session,
            user: user.sanitized(),
            remember_me_token,
        })
    }

    /// Open a session from a remember-me token. The token is rotated; the
    /// replacement is returned with the session.
    pub async fn login_with_remember_me(
        &self,
        uow: &dyn UnitOfWork,
        token: &str,
        origin: &SessionOrigin,
    ) -> Result<AuthenticatedSession, AuthError> {
        let (user_id, replacement) = self.remember_me.redeem(uow, token).await?;
        let now = self.clock.now();

        let user = uow
            .get_user(user_id)
            .await?
            .filter(|u| u.active)
            .ok_or(AuthError::InvalidCredentials)?;
        if LockoutGuard::is_locked(&user, now) {
            return Err(AuthError::AccountLocked {
                retry_after_seconds: LockoutGuard::retry_after_seconds(&user, now),
            });
        }
        let company = self.company_of(uow, &user).await?;

        // Tokens are only handed out once every factor has been cleared.
        let session = self
            .sessions
            .create_session(uow, &user, &company, origin, true)
            .await?;

        Ok(AuthenticatedSession {
            session,
            user: user.sanitized(),
            remember_me_token: Some(replacement),
        })
    }

    pub async fn logout(&self, uow: &dyn UnitOfWork, sid: &str) -> Result<(), AuthError> {
        self.sessions.destroy(uow, sid).await
    }

    /// Change a password after re-verifying the current one. Every other
    /// session and all remember-me tokens of the user are ended.
    #[tracing::instrument(skip_all)]
    pub async fn change_password(
        &self,
        uow: &dyn UnitOfWork,
        ctx: &AttemptContext,
        current: &Password,
        new_password: &Password,
        keep_sid: Option<&str>,
    ) -> Result<(), AuthError> {
        let ctx = AttemptContext {
            email: normalize_email(&ctx.email),
            ..ctx.clone()
        };
        let user = self.check_credentials(uow, &ctx, current).await?;
        let company = self.company_of(uow, &user).await?;
        let policy = &company.password_policy;

        PolicyEngine::validate_password(new_password, policy)?;

        if policy.history_count > 0 {
            let current_hash = PasswordHashString::new(user.password_hash.clone());
            let history = uow
                .recent_password_history(user.id, policy.history_count as i64)
                .await?;
            if credential::verify(new_password, &current_hash)
                || !PolicyEngine::check_history(new_password, &history, policy.history_count)
            {
                return Err(AuthError::PasswordReused);
            }
        }

        let now = self.clock.now();
        let digest = credential::hash(new_password)?.into_string();
        uow.update_password(user.id, &digest, now).await?;
        uow.insert_password_history(&PasswordHistoryEntry::new(user.id, digest, now))
            .await?;
        uow.trim_password_history(user.id, policy.history_count.max(1) as i64)
            .await?;

        let keep = match keep_sid {
            Some(sid) => uow
                .get_session(sid)
                .await?
                .filter(|s| s.user_id == Some(user.id))
                .map(|s| s.sid),
            None => None,
        };
        self.sessions
            .destroy_all_for_user(uow, user.id, keep.as_deref())
            .await?;
        self.remember_me.revoke_all(uow, user.id).await?;

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::PasswordChanged, now)
                    .user(Some(company.id), Some(user.id))
                    .origin(ctx.ip_address.clone(), ctx.user_agent.clone()),
            )
            .await;
        Ok(())
    }

    /// Resolve and verify the user behind `ctx.email`, applying lockout.
    /// Unknown and wrong-password cases are indistinguishable to the caller.
    async fn check_credentials(
        &self,
        uow: &dyn UnitOfWork,
        ctx: &AttemptContext,
        password: &Password,
    ) -> Result<User, AuthError> {
        let now = self.clock.now();

        let user = match uow.find_user_by_email(&ctx.email).await? {
            Some(user) if user.active => user,
            other => {
                credential::verify_dummy(password);
                let (user_id, reason) = match &other {
                    Some(user) => (Some(user.id), LoginFailureReason::AccountInactive),
                    None => (None, LoginFailureReason::UnknownUser),
                };
                self.lockout.record_rejected(uow, user_id, ctx, reason).await?;
                self.login_failed(uow, other.as_ref(), ctx, reason).await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        if LockoutGuard::is_locked(&user, now) {
            self.lockout
                .record_rejected(uow, Some(user.id), ctx, LoginFailureReason::AccountLocked)
                .await?;
            self.login_failed(uow, Some(&user), ctx, LoginFailureReason::AccountLocked)
                .await;
            return Err(AuthError::AccountLocked {
                retry_after_seconds: LockoutGuard::retry_after_seconds(&user, now),
            });
        }

        let digest = PasswordHashString::new(user.password_hash.clone());
        if !credential::verify(password, &digest) {
            let state = self.lockout.record_failure(uow, &user, ctx).await?;
            self.login_failed(uow, Some(&user), ctx, LoginFailureReason::BadPassword)
                .await;
            return Err(match state {
                LockState::Locked { until } => AuthError::AccountLocked {
                    retry_after_seconds: (until - now).num_seconds().max(0),
                },
                LockState::Unlocked { .. } => AuthError::InvalidCredentials,
            });
        }

        self.lockout.record_success(uow, &user, ctx).await?;
        Ok(user)
    }

    async fn company_of(&self, uow: &dyn UnitOfWork, user: &User) -> Result<Company, AuthError> {
        uow.get_company(user.company_id)
            .await?
            .ok_or_else(|| AuthError::Internal(anyhow::anyhow!("company {} not found", user.company_id)))
    }

    async fn login_failed(
        &self,
        uow: &dyn UnitOfWork,
        user: Option<&User>,
        ctx: &AttemptContext,
        reason: LoginFailureReason,
    ) {
        tracing::info!(reason = reason.as_str(), "Login failed");
        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::LoginFailed, self.clock.now())
                    .user(user.map(|u| u.company_id), user.map(|u| u.id))
                    .origin(ctx.ip_address.clone(), ctx.user_agent.clone())
                    .detail(serde_json::json!({ "reason": reason.as_str() })),
            )
            .await;
    }
}
