//! Audit event model - security and compliance logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoginSucceeded,
    LoginFailed,
    AccountLocked,
    MfaChallengeSent,
    MfaVerified,
    MfaFailed,
    RecoveryCodeUsed,
    MfaEnabled,
    MfaDisabled,
    SessionCreated,
    SessionRevoked,
    SessionLimitBlocked,
    PasswordChanged,
    DeviceTrusted,
    OAuthCodeIssued,
    OAuthTokenIssued,
    OAuthTokenRotated,
    OAuthTokenRevoked,
    RefreshReuseDetected,
    AuthorizationCodeReplay,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoginSucceeded => "login_succeeded",
            AuditEventType::LoginFailed => "login_failed",
            AuditEventType::AccountLocked => "account_locked",
            AuditEventType::MfaChallengeSent => "mfa_challenge_sent",
            AuditEventType::MfaVerified => "mfa_verified",
            AuditEventType::MfaFailed => "mfa_failed",
            AuditEventType::RecoveryCodeUsed => "recovery_code_used",
            AuditEventType::MfaEnabled => "mfa_enabled",
            AuditEventType::MfaDisabled => "mfa_disabled",
            AuditEventType::SessionCreated => "session_created",
            AuditEventType::SessionRevoked => "session_revoked",
            AuditEventType::SessionLimitBlocked => "session_limit_blocked",
            AuditEventType::PasswordChanged => "password_changed",
            AuditEventType::DeviceTrusted => "device_trusted",
            AuditEventType::OAuthCodeIssued => "oauth_code_issued",
            AuditEventType::OAuthTokenIssued => "oauth_token_issued",
            AuditEventType::OAuthTokenRotated => "oauth_token_rotated",
            AuditEventType::OAuthTokenRevoked => "oauth_token_revoked",
            AuditEventType::RefreshReuseDetected => "refresh_reuse_detected",
            AuditEventType::AuthorizationCodeReplay => "authorization_code_replay",
        }
    }

    pub fn severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::RefreshReuseDetected | AuditEventType::AuthorizationCodeReplay => {
                AuditSeverity::Critical
            }
            AuditEventType::LoginFailed
            | AuditEventType::AccountLocked
            | AuditEventType::MfaFailed
            | AuditEventType::SessionLimitBlocked
            | AuditEventType::MfaDisabled => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// Audit event entity. Append-only.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub company_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity: event_type.severity(),
            company_id: None,
            user_id: None,
            session_id: None,
            client_id: None,
            ip_address: None,
            user_agent: None,
            detail: None,
            created_at: now,
        }
    }

    pub fn user(mut self, company_id: Option<Uuid>, user_id: Option<Uuid>) -> Self {
        self.company_id = company_id;
        self.user_id = user_id;
        self
    }

    pub fn session(mut self, sid: impl Into<String>) -> Self {
        self.session_id = Some(sid.into());
        self
    }

    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn origin(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_events_are_critical() {
        assert_eq!(
            AuditEventType::RefreshReuseDetected.severity(),
            AuditSeverity::Critical
        );
        assert_eq!(AuditEventType::LoginSucceeded.severity(), AuditSeverity::Info);
    }

    #[test]
    fn test_builder_sets_fields() {
        let user_id = Uuid::new_v4();
        let event = AuditEvent::new(AuditEventType::SessionCreated, Utc::now())
            .user(None, Some(user_id))
            .session("abc")
            .detail(serde_json::json!({"source": "web"}));

        assert_eq!(event.user_id, Some(user_id));
        assert_eq!(event.session_id.as_deref(), Some("abc"));
        assert_eq!(event.event_type.as_str(), "session_created");
    }
}
