pub mod auth;
pub mod oauth;

use axum::http::HeaderMap;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use crate::config::AuthConfig;
use crate::models::Session;

/// Client IP and user agent as seen through the edge proxy.
pub(crate) fn request_origin(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let ip = header("x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .or_else(|| header("x-real-ip"));
    (ip, header("user-agent"))
}

/// The session id cookie. Lives no longer than the session's hard ceiling.
pub(crate) fn session_cookie(config: &AuthConfig, session: &Session) -> Cookie<'static> {
    let max_age = (session.absolute_expires_at - session.created_at)
        .num_seconds()
        .max(0);

    Cookie::build((config.session.cookie_name.clone(), session.sid.clone()))
        .http_only(true)
        .secure(config.session.cookie_secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(max_age))
        .build()
}

pub(crate) fn session_id(config: &AuthConfig, jar: &CookieJar) -> Option<String> {
    jar.get(&config.session.cookie_name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn clear_session_cookie(config: &AuthConfig, jar: CookieJar) -> CookieJar {
    jar.remove(
        Cookie::build((config.session.cookie_name.clone(), ""))
            .path("/")
            .build(),
    )
}
