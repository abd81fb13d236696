use service_core::error::AppError;
use thiserror::Error;

use crate::db::StoreError;
use crate::models::SessionSummary;

/// Unmet password rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    TooShort { min_length: i32 },
    MissingUppercase,
    MissingLowercase,
    MissingNumber,
    MissingSpecialChar,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::TooShort { min_length } => {
                write!(f, "must be at least {} characters long", min_length)
            }
            PolicyViolation::MissingUppercase => {
                write!(f, "must contain at least one uppercase letter")
            }
            PolicyViolation::MissingLowercase => {
                write!(f, "must contain at least one lowercase letter")
            }
            PolicyViolation::MissingNumber => write!(f, "must contain at least one number"),
            PolicyViolation::MissingSpecialChar => {
                write!(f, "must contain at least one special character")
            }
        }
    }
}

/// Caller-visible outcomes of the credential core.
///
/// Everything except `Persistence` and `Internal` is a recoverable result the
/// route layer turns into a response.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account locked")]
    AccountLocked { retry_after_seconds: i64 },

    #[error("Multi-factor authentication required")]
    MfaRequired,

    #[error("Invalid code")]
    InvalidCode,

    #[error("Invalid recovery code")]
    InvalidRecoveryCode,

    #[error("Session limit exceeded")]
    SessionLimitExceeded,

    #[error("Session limit reached; choose a session to end")]
    LimitReachedChoice { sessions: Vec<SessionSummary> },

    #[error("Invalid or expired session")]
    InvalidSession,

    #[error("Client authentication failed")]
    InvalidClient,

    #[error("Invalid grant")]
    InvalidGrant,

    #[error("Invalid scope")]
    InvalidScope,

    #[error("Unsupported grant type")]
    UnsupportedGrantType,

    #[error("Client is not authorized for this grant")]
    UnauthorizedClient,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Refresh token reuse detected")]
    ReuseDetected,

    #[error("Password does not meet policy")]
    WeakPassword(Vec<PolicyViolation>),

    #[error("Password was used recently")]
    PasswordReused,

    #[error("Password has expired")]
    PasswordExpired,

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// RFC 6749 error code for the OAuth endpoints.
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidClient => "invalid_client",
            AuthError::InvalidGrant | AuthError::ReuseDetected => "invalid_grant",
            AuthError::InvalidScope => "invalid_scope",
            AuthError::UnsupportedGrantType => "unsupported_grant_type",
            AuthError::UnauthorizedClient => "unauthorized_client",
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::Persistence(_) | AuthError::Internal(_) => "server_error",
            _ => "access_denied",
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            AuthError::AccountLocked {
                retry_after_seconds,
            } => AppError::TooManyRequests(
                "Account temporarily locked".to_string(),
                Some(retry_after_seconds.max(0) as u64),
            ),
            AuthError::MfaRequired => {
                AppError::Forbidden(anyhow::anyhow!("Multi-factor authentication required"))
            }
            AuthError::InvalidCode => AppError::AuthError(anyhow::anyhow!("Invalid code")),
            AuthError::InvalidRecoveryCode => {
                AppError::AuthError(anyhow::anyhow!("Invalid recovery code"))
            }
            AuthError::SessionLimitExceeded => {
                AppError::Conflict(anyhow::anyhow!("Session limit exceeded"))
            }
            AuthError::LimitReachedChoice { .. } => AppError::Conflict(anyhow::anyhow!(
                "Session limit reached; choose a session to end"
            )),
            AuthError::InvalidSession => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid or expired session"))
            }
            AuthError::InvalidClient => {
                AppError::Unauthorized(anyhow::anyhow!("Client authentication failed"))
            }
            AuthError::InvalidGrant => AppError::BadRequest(anyhow::anyhow!("Invalid grant")),
            AuthError::InvalidScope => AppError::BadRequest(anyhow::anyhow!("Invalid scope")),
            AuthError::UnsupportedGrantType => {
                AppError::BadRequest(anyhow::anyhow!("Unsupported grant type"))
            }
            AuthError::UnauthorizedClient => AppError::BadRequest(anyhow::anyhow!(
                "Client is not authorized for this grant"
            )),
            AuthError::InvalidRequest(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            AuthError::ReuseDetected => AppError::BadRequest(anyhow::anyhow!("Invalid grant")),
            AuthError::WeakPassword(violations) => {
                let details = violations
                    .iter()
                    .map(|v| format!("Password {}", v))
                    .collect::<Vec<_>>()
                    .join("; ");
                AppError::BadRequest(anyhow::anyhow!(details))
            }
            AuthError::PasswordReused => AppError::BadRequest(anyhow::anyhow!(
                "Password was used recently; choose a different one"
            )),
            AuthError::PasswordExpired => {
                AppError::Forbidden(anyhow::anyhow!("Password has expired"))
            }
            AuthError::Persistence(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            AuthError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_messages_do_not_leak_detail() {
        assert_eq!(AuthError::InvalidCredentials.to_string(), "Invalid credentials");
        assert_eq!(AuthError::InvalidCode.to_string(), "Invalid code");
    }

    #[test]
    fn test_reuse_is_reported_as_invalid_grant() {
        assert_eq!(AuthError::ReuseDetected.oauth_error_code(), "invalid_grant");
        assert_eq!(AuthError::InvalidClient.oauth_error_code(), "invalid_client");
    }

    #[test]
    fn test_lockout_maps_to_retry_after() {
        let app: AppError = AuthError::AccountLocked {
            retry_after_seconds: 90,
        }
        .into();
        assert!(matches!(app, AppError::TooManyRequests(_, Some(90))));
    }
}
