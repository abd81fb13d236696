//! Second-factor challenge and recovery codes.
//!
//! A user has at most one pending numeric code. Failures are always
//! reported as a bare `InvalidCode` whether the code was missing, expired,
//! exhausted or wrong; the distinction only goes to the audit trail.

use chrono::Duration;
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::models::{AuditEvent, AuditEventType, Company, MfaCode, RecoveryCode, Session, User};
use crate::utils::Clock;

use super::credential::{constant_time_eq, hash_token};
use super::notifier::Notifier;
use super::trusted_device::TrustedDeviceRegistry;
use super::{AuditSink, AuthError};

const CODE_DIGITS: u32 = 6;
const RECOVERY_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
const RECOVERY_HALF_LEN: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct MfaSettings {
    pub code_ttl: Duration,
    pub max_attempts: i32,
    pub recovery_code_count: usize,
    pub trusted_device_ttl: Duration,
}

impl Default for MfaSettings {
    fn default() -> Self {
        Self {
            code_ttl: Duration::minutes(10),
            max_attempts: 5,
            recovery_code_count: 10,
            trusted_device_ttl: Duration::days(30),
        }
    }
}

/// Result of [`MfaCoordinator::send_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeDispatch {
    /// Whether the notifier accepted the code. The code is valid either way.
    pub sent: bool,
    pub expires_in_seconds: i64,
}

fn generate_numeric_code() -> String {
    let bound = 10u32.pow(CODE_DIGITS);
    let n = rand::thread_rng().gen_range(0..bound);
    format!("{:0width$}", n, width = CODE_DIGITS as usize)
}

fn generate_recovery_code() -> String {
    let mut rng = rand::thread_rng();
    let mut pick = || {
        (0..RECOVERY_HALF_LEN)
            .map(|_| RECOVERY_ALPHABET[rng.gen_range(0..RECOVERY_ALPHABET.len())] as char)
            .collect::<String>()
    };
    let first = pick();
    let second = pick();
    format!("{}-{}", first, second)
}

/// Recovery codes are matched case-insensitively with or without the dash.
fn normalize_recovery_code(code: &str) -> String {
    code.trim()
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Clone)]
pub struct MfaCoordinator {
    settings: MfaSettings,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
    notifier: Arc<dyn Notifier>,
    devices: TrustedDeviceRegistry,
}

impl MfaCoordinator {
    pub fn new(
        settings: MfaSettings,
        clock: Arc<dyn Clock>,
        audit: AuditSink,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let devices =
            TrustedDeviceRegistry::new(settings.trusted_device_ttl, clock.clone(), audit.clone());
        Self {
            settings,
            clock,
            audit,
            notifier,
            devices,
        }
    }

    pub fn devices(&self) -> &TrustedDeviceRegistry {
        &self.devices
    }

    /// A company-wide requirement overrides the user's own choice.
    pub fn requires_mfa(user: &User, company: &Company) -> bool {
        user.mfa_enabled || company.mfa_required
    }

    /// Issue a fresh code, replacing any pending one, and hand it to the
    /// notifier. Delivery failure is logged; the stored code stands.
    #[tracing::instrument(skip(self, uow, user), fields(user_id = %user.id))]
    pub async fn send_code(&self, uow: &dyn UnitOfWork, user: &User) -> Result<CodeDispatch, AuthError> {
        let now = self.clock.now();
        let code = generate_numeric_code();
        let expires_at = now + self.settings.code_ttl;

        uow.replace_mfa_code(&MfaCode::new(user.id, hash_token(&code), expires_at, now))
            .await?;

        let sent = match self.notifier.send_mfa_code(user.id, &user.email, &code).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "MFA code delivery failed");
                false
            }
        };

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::MfaChallengeSent, now)
                    .user(Some(user.company_id), Some(user.id))
                    .detail(serde_json::json!({ "delivered": sent })),
            )
            .await;

        Ok(CodeDispatch {
            sent,
            expires_in_seconds: self.settings.code_ttl.num_seconds(),
        })
    }

    /// Check a numeric code and, on success, mark `sid` as past MFA.
    #[tracing::instrument(skip(self, uow, user, code, sid), fields(user_id = %user.id))]
    pub async fn verify_code(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
        code: &str,
        sid: &str,
    ) -> Result<Session, AuthError> {
        let now = self.clock.now();
        let session = self.pending_session(uow, user, sid).await?;

        let Some(stored) = uow.get_mfa_code(user.id).await? else {
            return Err(self.code_failure(uow, user, "no_pending_code").await);
        };

        if stored.is_expired(now) || stored.attempts >= self.settings.max_attempts {
            uow.consume_mfa_code(stored.id).await?;
            return Err(self.code_failure(uow, user, "expired_or_exhausted").await);
        }

        if !constant_time_eq(&hash_token(code.trim()), &stored.code_hash) {
            let attempts = uow.increment_mfa_code_attempts(stored.id).await?;
            if attempts >= self.settings.max_attempts {
                uow.consume_mfa_code(stored.id).await?;
                tracing::warn!(attempts, "MFA code discarded after too many attempts");
            }
            return Err(self.code_failure(uow, user, "mismatch").await);
        }

        // A concurrent verification may have taken it first.
        if !uow.consume_mfa_code(stored.id).await? {
            return Err(self.code_failure(uow, user, "already_used").await);
        }

        let session = self.complete(uow, session).await?;
        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::MfaVerified, now)
                    .user(Some(user.company_id), Some(user.id))
                    .session(hash_token(sid)),
            )
            .await;
        Ok(session)
    }

    /// Complete MFA with a single-use recovery code.
    #[tracing::instrument(skip(self, uow, user, code, sid), fields(user_id = %user.id))]
    pub async fn verify_recovery_code(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
        code: &str,
        sid: &str,
    ) -> Result<Session, AuthError> {
        let now = self.clock.now();
        let session = self
            .pending_session(uow, user, sid)
            .await
            .map_err(|_| AuthError::InvalidRecoveryCode)?;

        let presented = hash_token(&normalize_recovery_code(code));
        let unused = uow.unused_recovery_codes(user.id).await?;

        // Compare against every candidate so timing does not depend on position.
        let matched = unused.iter().fold(None, |found, candidate| {
            let hit = constant_time_eq(&presented, &candidate.code_hash);
            found.or(if hit { Some(candidate.id) } else { None })
        });

        let Some(code_id) = matched else {
            self.audit
                .record(
                    uow,
                    AuditEvent::new(AuditEventType::MfaFailed, now)
                        .user(Some(user.company_id), Some(user.id))
                        .detail(serde_json::json!({ "method": "recovery_code" })),
                )
                .await;
            return Err(AuthError::InvalidRecoveryCode);
        };

        if !uow.consume_recovery_code(code_id, now).await? {
            return Err(AuthError::InvalidRecoveryCode);
        }
        uow.delete_mfa_codes(user.id).await?;

        let session = self.complete(uow, session).await?;
        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::RecoveryCodeUsed, now)
                    .user(Some(user.company_id), Some(user.id))
                    .session(hash_token(sid))
                    .detail(serde_json::json!({ "remaining": unused.len().saturating_sub(1) })),
            )
            .await;
        Ok(session)
    }

    /// Turn MFA on and return a fresh set of recovery codes in clear. They
    /// are never retrievable again.
    pub async fn enable_mfa(&self, uow: &dyn UnitOfWork, user: &User) -> Result<Vec<String>, AuthError> {
        let now = self.clock.now();
        uow.set_mfa_enabled(user.id, true, now).await?;
        let codes = self.regenerate_recovery_codes(uow, user).await?;

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::MfaEnabled, now)
                    .user(Some(user.company_id), Some(user.id)),
            )
            .await;
        Ok(codes)
    }

    /// Turn MFA off. Remaining recovery codes, any pending code and all
    /// trusted devices are discarded.
    pub async fn disable_mfa(&self, uow: &dyn UnitOfWork, user: &User) -> Result<(), AuthError> {
        let now = self.clock.now();
        uow.set_mfa_enabled(user.id, false, now).await?;
        uow.delete_recovery_codes(user.id).await?;
        uow.delete_mfa_codes(user.id).await?;
        self.devices.revoke_all(uow, user.id).await?;

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::MfaDisabled, now)
                    .user(Some(user.company_id), Some(user.id)),
            )
            .await;
        Ok(())
    }

    /// Replace the recovery-code set, invalidating every previous code.
    pub async fn regenerate_recovery_codes(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
    ) -> Result<Vec<String>, AuthError> {
        let now = self.clock.now();
        let codes: Vec<String> = (0..self.settings.recovery_code_count)
            .map(|_| generate_recovery_code())
            .collect();
        let stored: Vec<RecoveryCode> = codes
            .iter()
            .map(|c| RecoveryCode::new(user.id, hash_token(&normalize_recovery_code(c)), now))
            .collect();

        uow.replace_recovery_codes(user.id, &stored).await?;
        Ok(codes)
    }

    pub async fn remaining_recovery_codes(
        &self,
        uow: &dyn UnitOfWork,
        user_id: Uuid,
    ) -> Result<usize, AuthError> {
        Ok(uow.unused_recovery_codes(user_id).await?.len())
    }

    /// The live session awaiting MFA must belong to `user`.
    async fn pending_session(
        &self,
        uow: &dyn UnitOfWork,
        user: &User,
        sid: &str,
    ) -> Result<Session, AuthError> {
        let now = self.clock.now();
        uow.get_session(sid)
            .await?
            .filter(|s| s.user_id == Some(user.id) && s.is_valid(user.force_logout_at, now))
            .ok_or(AuthError::InvalidSession)
    }

    async fn complete(&self, uow: &dyn UnitOfWork, mut session: Session) -> Result<Session, AuthError> {
        if !uow.mark_session_mfa_verified(&session.sid).await? {
            return Err(AuthError::InvalidSession);
        }
        session.mfa_verified = true;
        Ok(session)
    }

    async fn code_failure(&self, uow: &dyn UnitOfWork, user: &User, reason: &str) -> AuthError {
        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::MfaFailed, self.clock.now())
                    .user(Some(user.company_id), Some(user.id))
                    .detail(serde_json::json!({ "method": "code", "reason": reason })),
            )
            .await;
        AuthError::InvalidCode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_code_shape() {
        for _ in 0..50 {
            let code = generate_numeric_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_recovery_code_shape() {
        let code = generate_recovery_code();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
    }

    #[test]
    fn test_recovery_code_normalization() {
        assert_eq!(normalize_recovery_code(" ABCD-efgh "), "abcdefgh");
        assert_eq!(normalize_recovery_code("abcdefgh"), "abcdefgh");
    }

    #[test]
    fn test_company_requirement_overrides_user() {
        let now = chrono::Utc::now();
        let mut company = Company::new("Acme", now);
        let user = User::new(company.id, "a@example.com", "hash", now);
        assert!(!MfaCoordinator::requires_mfa(&user, &company));

        company.mfa_required = true;
        assert!(MfaCoordinator::requires_mfa(&user, &company));
    }
}
