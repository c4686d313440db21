//! Admin endpoints: sprite lifecycle and token seeding.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::state::AppState;

/// POST /v1/admin/sprites/:name/hibernate
pub async fn hibernate_sprite(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.sprites.suspend(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(sprite = %name, error = %e, "hibernate failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// DELETE /v1/admin/sprites/:name
pub async fn delete_sprite(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.sprites.delete(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(sprite = %name, error = %e, "sprite delete failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SeedTokenBody {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix milliseconds.
    pub expires_at: i64,
    pub scopes: Option<String>,
    pub subscription_tier: Option<String>,
}

/// POST /v1/oauth/seed — upsert the singleton agent credential.
pub async fn seed_token(
    State(state): State<AppState>,
    Json(body): Json<SeedTokenBody>,
) -> Response {
    match state
        .tokens
        .seed(
            &body.access_token,
            &body.refresh_token,
            body.expires_at,
            body.scopes.as_deref(),
            body.subscription_tier.as_deref(),
        )
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "token seed failed");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
