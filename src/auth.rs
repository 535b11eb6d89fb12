//! Pre-shared API key authentication.
//!
//! Every management endpoint requires an `X-IP6TUN-AUTH: <key>` header. The
//! check runs as middleware, so a request with a missing or wrong key is
//! rejected before any handler touches the broker.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Header carrying the pre-shared key.
pub const AUTH_HEADER: &str = "X-IP6TUN-AUTH";

/// Axum middleware that rejects requests without a valid `X-IP6TUN-AUTH`
/// header. The expected key is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or key mismatch
/// - `500 Internal Server Error` — [`ApiKey`] extension not found (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error", "code": "CONFIG_ERROR"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if !constant_time_eq(expected.as_bytes(), provided) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid API key", "code": "UNAUTHORIZED"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so the key length does not leak through response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can read it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"secret", b"sec"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }
}
