//! API authentication middleware.
//!
//! The env var named by `config.server.password_env` (default
//! `SERVICE_PASSWORD`) is read **once at startup** and its SHA-256 digest
//! cached in `AppState`.
//! - If set and non-empty, every protected request must carry
//!   `Authorization: Bearer <password>` (the session WebSocket may use a
//!   `?password=` query parameter instead, since browsers cannot set
//!   headers on upgrade requests).
//! - If unset or empty, the server logs a warning once and allows
//!   unauthenticated access (dev mode).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Constant-time comparison of a candidate against the cached digest.
/// Hashing first normalizes lengths so `ct_eq` always sees 32 bytes.
pub fn password_matches(expected_hash: &[u8], provided: &str) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.ct_eq(expected_hash))
}

/// Axum middleware enforcing the service password on protected routes.
/// Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_password(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected_hash = match &state.password_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if !password_matches(expected_hash, provided) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing password" })),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_only_the_exact_password() {
        let hash = Sha256::digest(b"sekrit").to_vec();
        assert!(password_matches(&hash, "sekrit"));
        assert!(!password_matches(&hash, "sekri"));
        assert!(!password_matches(&hash, "sekrit "));
        assert!(!password_matches(&hash, ""));
    }
}
