pub mod audit;
pub mod credential;
pub mod error;
pub mod lockout;
pub mod login;
pub mod mfa;
pub mod notifier;
pub mod oauth;
pub mod policy;
pub mod remember_me;
pub mod session;
pub mod trusted_device;

pub use audit::AuditSink;
pub use error::{AuthError, PolicyViolation};
pub use lockout::{LockState, LockoutGuard, LockoutSettings};
pub use login::{AuthenticatedSession, LoginOutcome, LoginRequest, LoginService, MfaVerification};
pub use mfa::{CodeDispatch, MfaCoordinator, MfaSettings};
pub use notifier::{LogNotifier, MockNotifier, Notifier};
pub use oauth::{
    AuthorizationRequest, ClientRegistration, IssuedCode, IssuedTokens, OAuthSettings,
    OAuthTokenService, TokenIntrospection,
};
pub use policy::PolicyEngine;
pub use remember_me::{RememberMeService, RememberMeSettings};
pub use session::{SessionManager, SessionOrigin, SessionSettings};
pub use trusted_device::TrustedDeviceRegistry;
