//! Credential checks for both planes.
//!
//! Operators authenticate to the HTTP API with `Authorization: Bearer <key>`
//! (WebSocket upgrades use `?token=` since browsers cannot set headers
//! there). Agents authenticate in their `hello` frame with the shared agent
//! token.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected operator key, injected as a router extension.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Middleware rejecting requests without a valid bearer token.
///
/// - `401` header missing or malformed
/// - `403` key present but wrong
/// - `500` [`ApiKey`] extension missing
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
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header", "code": "UNAUTHORIZED"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return forbidden();
    }

    next.run(request).await
}

/// Check a `?token=` query value against the operator key.
pub fn check_query_token(expected: &str, provided: Option<&str>) -> Result<(), Response> {
    match provided {
        Some(token) if constant_time_eq(expected.as_bytes(), token.as_bytes()) => Ok(()),
        Some(_) => Err(forbidden()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing token query parameter", "code": "UNAUTHORIZED"})),
        )
            .into_response()),
    }
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "Invalid API key", "code": "FORBIDDEN"})),
    )
        .into_response()
}

/// Constant-time byte comparison.
///
/// Always walks the full length of `expected`, so response time does not
/// reveal how much of a guess matched or how long the key is.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Agent ids: 1-64 chars of `[A-Za-z0-9._-]`.
pub fn is_valid_agent_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Outcome of checking an agent's `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeVerdict {
    Accept,
    Reject(&'static str),
}

/// Decide whether an agent handshake is acceptable. An empty configured
/// token rejects every agent.
pub fn verify_agent(expected_token: &str, agent_id: &str, token: &str) -> HandshakeVerdict {
    if expected_token.is_empty() {
        return HandshakeVerdict::Reject("agent registration disabled");
    }
    if !constant_time_eq(expected_token.as_bytes(), token.as_bytes()) {
        return HandshakeVerdict::Reject("invalid agent token");
    }
    if !is_valid_agent_id(agent_id) {
        return HandshakeVerdict::Reject("invalid agent id");
    }
    HandshakeVerdict::Accept
}
