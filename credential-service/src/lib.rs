pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::from_fn,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    security_headers::security_headers_middleware, tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;

use crate::config::AuthConfig;
use crate::db::StoreProvider;
use crate::services::{
    AuditSink, LockoutGuard, LoginService, MfaCoordinator, Notifier, OAuthTokenService,
    RememberMeService, SessionManager,
};
use crate::utils::Clock;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::auth::login,
        handlers::auth::verify_mfa,
        handlers::auth::verify_mfa_recovery,
        handlers::auth::logout,
        handlers::auth::change_password,
        handlers::oauth::authorize,
        handlers::oauth::authorize_decision,
        handlers::oauth::token,
        handlers::oauth::revoke,
        handlers::oauth::introspect,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::MessageResponse,
            dtos::auth::LoginRequest,
            dtos::auth::LoginResponse,
            dtos::auth::LoginStatus,
            dtos::auth::MfaChallenge,
            dtos::auth::SessionLimitResponse,
            dtos::auth::MfaVerifyRequest,
            dtos::auth::LogoutRequest,
            dtos::auth::ChangePasswordRequest,
            dtos::oauth::AuthorizeQuery,
            dtos::oauth::AuthorizeDecision,
            dtos::oauth::ConsentResponse,
            dtos::oauth::TokenRequest,
            dtos::oauth::TokenResponse,
            dtos::oauth::RevokeRequest,
            dtos::oauth::IntrospectRequest,
            dtos::oauth::OAuthErrorResponse,
            services::TokenIntrospection,
            models::SanitizedUser,
            models::SessionSource,
            models::SessionSummary,
        )
    ),
    tags(
        (name = "Authentication", description = "Login, second factor and session lifecycle"),
        (name = "OAuth", description = "OAuth2 authorization code and refresh token grants"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub config: AuthConfig,
    pub store: Arc<dyn StoreProvider>,
    pub clock: Arc<dyn Clock>,
    pub login: LoginService,
    pub oauth: OAuthTokenService,
}

impl AppState {
    /// Wire the services from configuration. All of them share one clock and
    /// one audit sink.
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn StoreProvider>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let audit = AuditSink::new();

        let lockout = LockoutGuard::new(config.lockout_settings(), clock.clone(), audit.clone());
        let sessions = SessionManager::new(config.session_settings(), clock.clone(), audit.clone());
        let mfa = MfaCoordinator::new(config.mfa_settings(), clock.clone(), audit.clone(), notifier);
        let remember_me = RememberMeService::new(config.remember_me_settings(), clock.clone());
        let login = LoginService::new(
            lockout,
            sessions,
            mfa,
            remember_me,
            clock.clone(),
            audit.clone(),
        );
        let oauth = OAuthTokenService::new(config.oauth_settings(), clock.clone(), audit);

        Self {
            config,
            store,
            clock,
            login,
            oauth,
        }
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Store is unreachable")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "service": state.config.service_name,
                "version": state.config.service_version,
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unhealthy" })),
            )
        }
    }
}

fn cors_layer(config: &AuthConfig) -> CorsLayer {
    let origins = config
        .security
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %origin, error = %e, "Skipping invalid CORS origin");
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-request-id"),
        ])
        .allow_credentials(true)
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let auth_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/mfa/verify", post(handlers::auth::verify_mfa))
        .route("/auth/mfa/recovery", post(handlers::auth::verify_mfa_recovery))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/password", post(handlers::auth::change_password));

    let oauth_routes = Router::new()
        .route(
            "/oauth/authorize",
            get(handlers::oauth::authorize).post(handlers::oauth::authorize_decision),
        )
        .route("/oauth/token", post(handlers::oauth::token))
        .route("/oauth/revoke", post(handlers::oauth::revoke))
        .route("/oauth/introspect", post(handlers::oauth::introspect));

    let cors = cors_layer(&state.config);

    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(auth_routes)
        .merge(oauth_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors);

    Ok(app)
}
