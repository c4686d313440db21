//! Task endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use sd_domain::error::Error;

use crate::runtime::supervisor;
use crate::state::AppState;

fn internal(e: Error) -> Response {
    tracing::error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub title: Option<String>,
    pub repo_id: Option<i64>,
    /// Begin sprite setup immediately so opening the session is fast.
    #[serde(default)]
    pub prewarm: bool,
}

/// POST /v1/tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> Response {
    if let Some(repo_id) = body.repo_id {
        match state.store.get_repo(repo_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(serde_json::json!({ "error": "no such repo" })),
                )
                    .into_response()
            }
            Err(e) => return internal(e),
        }
    }

    let task = match state.store.create_task(body.title.as_deref(), body.repo_id) {
        Ok(task) => task,
        Err(e) => return internal(e),
    };

    if body.prewarm {
        state.allocator.prewarm(task.id).await;
    }

    (StatusCode::CREATED, Json(task)).into_response()
}

/// GET /v1/tasks
pub async fn list_tasks(State(state): State<AppState>) -> Response {
    match state.store.list_tasks() {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /v1/tasks/:id
pub async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.get_task(id) {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

/// DELETE /v1/tasks/:id — stops the supervisor (releasing its sprite
/// allocation and repo lock), then removes the task and its history.
pub async fn delete_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Some(handle) = state.registry.get(id) {
        handle.terminate().await;
    }
    state.allocator.release(id).await;
    match state.store.delete_task(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal(e),
    }
}

/// GET /v1/tasks/:id/messages
pub async fn list_messages(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.list_messages(id, 500) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub content: String,
}

/// POST /v1/tasks/:id/messages — non-WebSocket path for sending a turn.
pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<SendMessageBody>,
) -> Response {
    let task = match state.store.get_task(id) {
        Ok(Some(task)) => task,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return internal(e),
    };
    let handle = match supervisor::ensure_supervisor(&state, task) {
        Ok(handle) => handle,
        Err(e) => return internal(e),
    };
    if !handle.send_message(body.content).await {
        return internal(Error::Other("session is shutting down".into()));
    }
    StatusCode::ACCEPTED.into_response()
}
