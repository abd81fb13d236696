pub mod audit_event;
pub mod company;
pub mod login_attempt;
pub mod mfa;
pub mod oauth;
pub mod scope;
pub mod session;
pub mod user;

pub use audit_event::{AuditEvent, AuditEventType, AuditSeverity};
pub use company::{Company, PasswordPolicy, SessionLimitStrategy};
pub use login_attempt::{AttemptContext, LoginAttempt, LoginFailureReason, PasswordHistoryEntry};
pub use mfa::{MfaCode, RecoveryCode, RememberMeToken, TrustedDevice};
pub use oauth::{
    AuthorizationCode, ClientType, CodeChallengeMethod, GrantType, OAuthClient, OAuthToken,
    RevocationReason,
};
pub use scope::{Scope, ScopeSet};
pub use session::{
    AdmissionOutcome, AdmissionPlan, Session, SessionLimit, SessionSource,
    SessionSummary,
};
pub use user::{SanitizedUser, User};
