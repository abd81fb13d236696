//! Request correlation: propagates or mints an `x-request-id` header.

use axum::http::HeaderValue;
use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Caller-supplied ids end up in log lines; anything long or outside the
/// visible ASCII range is replaced with a fresh id.
fn accept_request_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= MAX_REQUEST_ID_LEN
        && candidate.bytes().all(|b| b.is_ascii_graphic())
}

pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| accept_request_id(s))
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    let mut response = next.run(req).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_uuid_request_id() {
        assert!(accept_request_id("550e8400-e29b-41d4-a716-446655440000"));
    }

    #[test]
    fn test_rejects_oversized_or_control_request_id() {
        assert!(!accept_request_id(""));
        assert!(!accept_request_id(&"a".repeat(MAX_REQUEST_ID_LEN + 1)));
        assert!(!accept_request_id("abc\ndef"));
        assert!(!accept_request_id("with space"));
    }
}
