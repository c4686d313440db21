//! Repo registration endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRepoBody {
    pub remote_url: String,
    pub display_name: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".into()
}

/// POST /v1/repos — register (or refresh) a repository.
pub async fn create_repo(
    State(state): State<AppState>,
    Json(body): Json<CreateRepoBody>,
) -> Response {
    if body.remote_url.is_empty() || body.display_name.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "remote_url and display_name are required" })),
        )
            .into_response();
    }
    match state
        .store
        .upsert_repo(&body.remote_url, &body.display_name, &body.default_branch)
    {
        Ok(repo) => (StatusCode::CREATED, Json(repo)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "repo upsert failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /v1/repos
pub async fn list_repos(State(state): State<AppState>) -> Response {
    match state.store.list_repos() {
        Ok(repos) => Json(repos).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "repo listing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
