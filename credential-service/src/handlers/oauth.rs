//! OAuth2 authorization server endpoints.
//!
//! Errors on these routes use the RFC 6749 `{error, error_description}`
//! body, not the service-wide error shape.

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use axum_extra::{
    extract::cookie::CookieJar,
    headers::{authorization::Basic, Authorization},
    TypedHeader,
};
use service_core::error::AppError;

use crate::{
    dtos::oauth::{
        AuthorizeDecision, AuthorizeQuery, ConsentResponse, IntrospectRequest,
        OAuthErrorResponse, RevokeRequest, TokenRequest, TokenResponse,
    },
    models::{GrantType, OAuthClient, RevocationReason, User},
    services::{AuthError, AuthorizationRequest, IssuedTokens},
    AppState,
};

use super::session_id;

/// [`AuthError`] rendered as an RFC 6749 error response.
#[derive(Debug)]
pub struct OAuthError(pub AuthError);

impl From<AuthError> for OAuthError {
    fn from(err: AuthError) -> Self {
        OAuthError(err)
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let code = self.0.oauth_error_code();
        let status = match code {
            "invalid_client" => StatusCode::UNAUTHORIZED,
            "access_denied" => StatusCode::FORBIDDEN,
            "server_error" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };

        let error_description = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "OAuth request failed");
            None
        } else {
            Some(self.0.to_string())
        };

        let mut res = (
            status,
            Json(OAuthErrorResponse {
                error: code.to_string(),
                error_description,
            }),
        )
            .into_response();

        let headers = res.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"oauth\""),
            );
        }
        res
    }
}

/// HTTP Basic wins over form-body credentials.
fn client_credentials(
    basic: Option<TypedHeader<Authorization<Basic>>>,
    form_id: Option<String>,
    form_secret: Option<String>,
) -> Result<(String, Option<String>), AuthError> {
    if let Some(TypedHeader(Authorization(basic))) = basic {
        let secret = Some(basic.password().to_string()).filter(|s| !s.is_empty());
        return Ok((basic.username().to_string(), secret));
    }
    match form_id.filter(|id| !id.is_empty()) {
        Some(id) => Ok((id, form_secret.filter(|s| !s.is_empty()))),
        None => Err(AuthError::InvalidClient),
    }
}

/// 302 to `redirect_uri` with `params` appended to its query.
fn redirect_with(redirect_uri: &str, params: &[(&str, &str)]) -> Response {
    let query = match serde_urlencoded::to_string(params) {
        Ok(query) => query,
        Err(e) => return OAuthError(AuthError::Internal(e.into())).into_response(),
    };
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let location = format!("{}{}{}", redirect_uri, separator, query);

    match HeaderValue::from_str(&location) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(e) => OAuthError(AuthError::Internal(e.into())).into_response(),
    }
}

fn redirect_error(redirect_uri: &str, err: &AuthError, state: Option<&str>) -> Response {
    let description = err.to_string();
    let mut params = vec![
        ("error", err.oauth_error_code()),
        ("error_description", description.as_str()),
    ];
    if let Some(state) = state {
        params.push(("state", state));
    }
    redirect_with(redirect_uri, &params)
}

fn token_response(issued: IssuedTokens) -> Response {
    let body = TokenResponse {
        access_token: issued.access_token,
        token_type: "Bearer".to_string(),
        expires_in: issued.expires_in,
        refresh_token: issued.refresh_token,
        scope: issued.scope,
    };
    (
        StatusCode::OK,
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
        ],
        Json(body),
    )
        .into_response()
}

/// Parameters shared by the consent screen and the consent decision.
struct AuthorizeParams<'a> {
    response_type: &'a str,
    client_id: &'a str,
    redirect_uri: &'a str,
    scope: Option<&'a str>,
    state: Option<&'a str>,
    code_challenge: Option<&'a str>,
    code_challenge_method: Option<&'a str>,
}

/// Resolve the logged-in user and validate the request. Errors that leave
/// the redirect URI untrusted come back as 400s; the rest as redirects.
async fn prepare_authorization(
    state: &AppState,
    jar: &CookieJar,
    params: &AuthorizeParams<'_>,
) -> Result<(User, OAuthClient, AuthorizationRequest), Response> {
    let uow = state.store.unit_of_work();

    let sid = session_id(&state.config, jar).ok_or_else(|| {
        AppError::Unauthorized(anyhow::anyhow!("Login required")).into_response()
    })?;
    let (_, user) = state
        .login
        .sessions()
        .authenticate(uow.as_ref(), &sid)
        .await
        .map_err(|e| AppError::from(e).into_response())?;

    let client = state
        .oauth
        .resolve_redirect(uow.as_ref(), params.client_id, params.redirect_uri)
        .await
        .map_err(|e| OAuthError(e).into_response())?;

    let request = state
        .oauth
        .check_authorization_request(
            &client,
            params.response_type,
            params.redirect_uri,
            params.scope.unwrap_or(""),
            params.code_challenge,
            params.code_challenge_method,
        )
        .map_err(|e| redirect_error(params.redirect_uri, &e, params.state))?;

    Ok((user, client, request))
}

/// Describe an authorization request for the consent screen
#[utoipa::path(
    get,
    path = "/oauth/authorize",
    params(AuthorizeQuery),
    responses(
        (status = 200, description = "Consent description", body = ConsentResponse),
        (status = 302, description = "Invalid request, redirected back to the client"),
        (status = 400, description = "Unknown client or redirect URI", body = OAuthErrorResponse),
        (status = 401, description = "No authenticated session", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn authorize(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Json<ConsentResponse>, Response> {
    let params = AuthorizeParams {
        response_type: &query.response_type,
        client_id: &query.client_id,
        redirect_uri: &query.redirect_uri,
        scope: query.scope.as_deref(),
        state: query.state.as_deref(),
        code_challenge: query.code_challenge.as_deref(),
        code_challenge_method: query.code_challenge_method.as_deref(),
    };
    let (_, client, request) = prepare_authorization(&state, &jar, &params).await?;

    Ok(Json(ConsentResponse {
        client_id: client.client_id,
        client_name: client.name,
        scope: request.scope.to_string(),
        redirect_uri: request.redirect_uri,
        state: query.state,
    }))
}

/// Approve or deny an authorization request
#[utoipa::path(
    post,
    path = "/oauth/authorize",
    request_body(content = AuthorizeDecision, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 302, description = "Redirect to the client with a code or an error"),
        (status = 400, description = "Unknown client or redirect URI", body = OAuthErrorResponse),
        (status = 401, description = "No authenticated session", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn authorize_decision(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<AuthorizeDecision>,
) -> Response {
    let params = AuthorizeParams {
        response_type: &form.response_type,
        client_id: &form.client_id,
        redirect_uri: &form.redirect_uri,
        scope: form.scope.as_deref(),
        state: form.state.as_deref(),
        code_challenge: form.code_challenge.as_deref(),
        code_challenge_method: form.code_challenge_method.as_deref(),
    };
    let (user, client, request) = match prepare_authorization(&state, &jar, &params).await {
        Ok(prepared) => prepared,
        Err(res) => return res,
    };

    if !form.approved() {
        let mut params = vec![("error", "access_denied")];
        if let Some(s) = form.state.as_deref() {
            params.push(("state", s));
        }
        return redirect_with(&request.redirect_uri, &params);
    }

    let uow = state.store.unit_of_work();
    match state
        .oauth
        .save_authorization_code(uow.as_ref(), client.id, user.id, &request)
        .await
    {
        Ok(issued) => {
            let mut params = vec![("code", issued.code.as_str())];
            if let Some(s) = form.state.as_deref() {
                params.push(("state", s));
            }
            redirect_with(&request.redirect_uri, &params)
        }
        Err(e) => redirect_error(&request.redirect_uri, &e, form.state.as_deref()),
    }
}

/// Exchange a grant for tokens
#[utoipa::path(
    post,
    path = "/oauth/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid grant or request", body = OAuthErrorResponse),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn token(
    State(state): State<AppState>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    Form(req): Form<TokenRequest>,
) -> Result<Response, OAuthError> {
    let (client_id, client_secret) =
        client_credentials(basic, req.client_id, req.client_secret)?;

    let uow = state.store.unit_of_work();
    let client = state
        .oauth
        .get_client(uow.as_ref(), &client_id, client_secret.as_deref())
        .await?;

    let grant: GrantType = req
        .grant_type
        .parse()
        .map_err(|_| AuthError::UnsupportedGrantType)?;

    let issued = match grant {
        GrantType::AuthorizationCode => {
            let code = req
                .code
                .ok_or_else(|| AuthError::InvalidRequest("code is required".to_string()))?;
            state
                .oauth
                .exchange_authorization_code(
                    uow.as_ref(),
                    &client,
                    &code,
                    req.redirect_uri.as_deref(),
                    req.code_verifier.as_deref(),
                )
                .await?
        }
        GrantType::RefreshToken => {
            let refresh_token = req.refresh_token.ok_or_else(|| {
                AuthError::InvalidRequest("refresh_token is required".to_string())
            })?;
            state
                .oauth
                .refresh(uow.as_ref(), &client, &refresh_token, req.scope.as_deref())
                .await?
        }
    };

    Ok(token_response(issued))
}

/// Revoke a token
#[utoipa::path(
    post,
    path = "/oauth/revoke",
    request_body(content = RevokeRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked, or was never valid"),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn revoke(
    State(state): State<AppState>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    Form(req): Form<RevokeRequest>,
) -> Result<StatusCode, OAuthError> {
    let (client_id, client_secret) =
        client_credentials(basic, req.client_id, req.client_secret)?;

    let uow = state.store.unit_of_work();
    let client = state
        .oauth
        .get_client(uow.as_ref(), &client_id, client_secret.as_deref())
        .await?;

    if !req.token.is_empty() {
        state
            .oauth
            .revoke_token(uow.as_ref(), &client, &req.token, RevocationReason::ClientRequest)
            .await?;
    }
    Ok(StatusCode::OK)
}

/// Introspect a token
#[utoipa::path(
    post,
    path = "/oauth/introspect",
    request_body(content = IntrospectRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token status", body = TokenIntrospection),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn introspect(
    State(state): State<AppState>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    Form(req): Form<IntrospectRequest>,
) -> Result<Response, OAuthError> {
    let (client_id, client_secret) =
        client_credentials(basic, req.client_id, req.client_secret)?;

    let uow = state.store.unit_of_work();
    let client = state
        .oauth
        .get_client(uow.as_ref(), &client_id, client_secret.as_deref())
        .await?;

    let introspection = state
        .oauth
        .introspect(uow.as_ref(), &client, &req.token)
        .await?;
    Ok(Json(introspection).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_appends_to_existing_query() {
        let res = redirect_with("https://app.example.com/cb?x=1", &[("code", "abc"), ("state", "s t")]);
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(
            res.headers().get(header::LOCATION).unwrap(),
            "https://app.example.com/cb?x=1&code=abc&state=s+t"
        );
    }

    #[test]
    fn test_form_credentials_require_client_id() {
        assert!(matches!(
            client_credentials(None, None, Some("secret".to_string())),
            Err(AuthError::InvalidClient)
        ));
        let (id, secret) = client_credentials(None, Some("app".to_string()), None).unwrap();
        assert_eq!(id, "app");
        assert!(secret.is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        let res = OAuthError(AuthError::InvalidClient).into_response();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(res.headers().contains_key(header::WWW_AUTHENTICATE));

        let res = OAuthError(AuthError::ReuseDetected).into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
