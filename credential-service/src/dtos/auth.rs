use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{SanitizedUser, SessionSource, SessionSummary};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "correct-horse-battery")]
    pub password: String,

    #[serde(default)]
    pub source: SessionSource,

    #[validate(length(max = 512))]
    pub device_fingerprint: Option<String>,

    #[serde(default)]
    pub remember_me: bool,

    /// Session to end when the previous attempt hit the session limit.
    pub replace_session: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    Authenticated,
    MfaRequired,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MfaChallenge {
    pub sent: bool,
    #[schema(example = 600)]
    pub expires_in_seconds: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub status: LoginStatus,
    pub user: SanitizedUser,
    pub session_expires_at: DateTime<Utc>,
    /// Returned for non-browser sources, which cannot hold the cookie.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa: Option<MfaChallenge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remember_me_token: Option<String>,
}

/// 409 body when the company asks the user to pick a session to end.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionLimitResponse {
    #[schema(example = "Session limit reached; choose a session to end")]
    pub error: String,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MfaVerifyRequest {
    pub user_id: Uuid,

    #[validate(length(min = 1, max = 64, message = "Code is required"))]
    #[schema(example = "123456")]
    pub code: String,

    /// Pending session id, when not sent as a cookie.
    pub session_token: Option<String>,

    /// Fingerprint of this device to trust for future logins.
    #[validate(length(max = 512))]
    pub trust_device: Option<String>,

    #[serde(default)]
    pub remember_me: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct LogoutRequest {
    pub session_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ChangePasswordRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,

    #[validate(length(min = 1, message = "New password is required"))]
    pub new_password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_request_defaults() {
        let req: LoginRequest = serde_json::from_str(
            r#"{"email":"user@example.com","password":"secret"}"#,
        )
        .unwrap();
        assert_eq!(req.source, SessionSource::Web);
        assert!(!req.remember_me);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_login_request_rejects_bad_email() {
        let req: LoginRequest =
            serde_json::from_str(r#"{"email":"nope","password":"secret","source":"ios"}"#)
                .unwrap();
        assert_eq!(req.source, SessionSource::Ios);
        assert!(req.validate().is_err());
    }
}
