use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;

use crate::{
    dtos::auth::{
        ChangePasswordRequest, LoginRequest, LoginResponse, LoginStatus, LogoutRequest,
        MfaChallenge, MfaVerifyRequest, SessionLimitResponse,
    },
    dtos::MessageResponse,
    models::{AttemptContext, SessionSource},
    services::{self, AuthError, AuthenticatedSession, LoginOutcome, MfaVerification},
    utils::{Password, ValidatedJson},
    AppState,
};

use super::{clear_session_cookie, request_origin, session_cookie, session_id};

fn authenticated_body(auth: AuthenticatedSession, source: SessionSource) -> LoginResponse {
    LoginResponse {
        status: LoginStatus::Authenticated,
        user: auth.user,
        session_expires_at: auth.session.expires_at,
        session_token: (source != SessionSource::Web).then(|| auth.session.sid.clone()),
        mfa: None,
        remember_me_token: auth.remember_me_token,
    }
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated, or a second factor is required", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 403, description = "Password expired", body = ErrorResponse),
        (status = 409, description = "Session limit reached", body = SessionLimitResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Account locked", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Response, AppError> {
    let (ip_address, user_agent) = request_origin(&headers);
    let request = services::LoginRequest {
        email: req.email,
        password: Password::new(req.password),
        source: req.source,
        ip_address,
        user_agent,
        device_fingerprint: req.device_fingerprint,
        remember_me: req.remember_me,
        replace_session: req.replace_session,
    };

    let uow = state.store.unit_of_work();
    let outcome = match state.login.login(uow.as_ref(), &request).await {
        Ok(outcome) => outcome,
        Err(AuthError::LimitReachedChoice { sessions }) => {
            let body = SessionLimitResponse {
                error: "Session limit reached; choose a session to end".to_string(),
                sessions,
            };
            return Ok((StatusCode::CONFLICT, Json(body)).into_response());
        }
        Err(e) => return Err(e.into()),
    };

    let (session, body) = match outcome {
        LoginOutcome::Authenticated(auth) => {
            let session = auth.session.clone();
            (session, authenticated_body(auth, request.source))
        }
        LoginOutcome::MfaPending {
            session,
            user,
            challenge,
        } => {
            let body = LoginResponse {
                status: LoginStatus::MfaRequired,
                user,
                session_expires_at: session.expires_at,
                session_token: (request.source != SessionSource::Web)
                    .then(|| session.sid.clone()),
                mfa: Some(MfaChallenge {
                    sent: challenge.sent,
                    expires_in_seconds: challenge.expires_in_seconds,
                }),
                remember_me_token: None,
            };
            (session, body)
        }
    };

    let jar = jar.add(session_cookie(&state.config, &session));
    Ok((StatusCode::OK, jar, Json(body)).into_response())
}

async fn complete_mfa(
    state: AppState,
    headers: HeaderMap,
    jar: CookieJar,
    req: MfaVerifyRequest,
    recovery: bool,
) -> Result<Response, AppError> {
    let from_cookie = session_id(&state.config, &jar);
    let source = if req.session_token.is_some() {
        SessionSource::Api
    } else {
        SessionSource::Web
    };
    let sid = req
        .session_token
        .or(from_cookie)
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("No pending session")))?;

    let (ip_address, user_agent) = request_origin(&headers);
    let verification = MfaVerification {
        user_id: req.user_id,
        code: req.code,
        sid,
        ip_address,
        user_agent,
        trust_device: req.trust_device,
        remember_me: req.remember_me,
    };

    let uow = state.store.unit_of_work();
    let auth = if recovery {
        state
            .login
            .verify_mfa_recovery_code(uow.as_ref(), &verification)
            .await?
    } else {
        state.login.verify_mfa_code(uow.as_ref(), &verification).await?
    };

    let jar = jar.add(session_cookie(&state.config, &auth.session));
    let mut body = authenticated_body(auth, source);
    if source == SessionSource::Api {
        body.session_token = Some(verification.sid);
    }
    Ok((StatusCode::OK, jar, Json(body)).into_response())
}

/// Complete a pending login with the emailed code
#[utoipa::path(
    post,
    path = "/auth/mfa/verify",
    request_body = MfaVerifyRequest,
    responses(
        (status = 200, description = "Session is fully authenticated", body = LoginResponse),
        (status = 401, description = "Invalid code or session", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn verify_mfa(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<MfaVerifyRequest>,
) -> Result<Response, AppError> {
    complete_mfa(state, headers, jar, req, false).await
}

/// Complete a pending login with a recovery code
#[utoipa::path(
    post,
    path = "/auth/mfa/recovery",
    request_body = MfaVerifyRequest,
    responses(
        (status = 200, description = "Session is fully authenticated", body = LoginResponse),
        (status = 401, description = "Invalid recovery code or session", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn verify_mfa_recovery(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<MfaVerifyRequest>,
) -> Result<Response, AppError> {
    complete_mfa(state, headers, jar, req, true).await
}

/// End the current session
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Logged out", body = MessageResponse)
    ),
    tag = "Authentication"
)]
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Option<Json<LogoutRequest>>,
) -> Result<Response, AppError> {
    let sid = body
        .and_then(|Json(req)| req.session_token)
        .or_else(|| session_id(&state.config, &jar));

    if let Some(sid) = sid {
        let uow = state.store.unit_of_work();
        state.login.logout(uow.as_ref(), &sid).await?;
    }

    let jar = clear_session_cookie(&state.config, jar);
    Ok((StatusCode::OK, jar, Json(MessageResponse::new("Logged out"))).into_response())
}

/// Change password
#[utoipa::path(
    post,
    path = "/auth/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed; other sessions ended", body = MessageResponse),
        (status = 400, description = "Password rejected by policy", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Account locked", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (ip_address, user_agent) = request_origin(&headers);
    let ctx = AttemptContext {
        email: req.email,
        source: SessionSource::Web,
        ip_address,
        user_agent,
    };
    let keep = session_id(&state.config, &jar);

    let uow = state.store.unit_of_work();
    state
        .login
        .change_password(
            uow.as_ref(),
            &ctx,
            &Password::new(req.current_password),
            &Password::new(req.new_password),
            keep.as_deref(),
        )
        .await?;

    Ok((StatusCode::OK, Json(MessageResponse::new("Password changed"))))
}
