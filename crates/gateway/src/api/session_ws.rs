//! The session WebSocket.
//!
//! Flow:
//! 1. UI connects to `/v1/tasks/:id/session?password=<service password>`
//! 2. The gateway attaches to (or starts) the task's supervisor
//! 3. Outbound: every [`SessionEvent`] as one JSON text frame
//! 4. Inbound: `{"type":"message","content":...}` sends a user turn,
//!    `{"type":"interrupt"}` interrupts the agent

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;

use sd_domain::model::Task;

use crate::api::auth::password_matches;
use crate::runtime::supervisor;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    /// Browsers cannot set headers on WebSocket upgrades, so the
    /// password rides in the query string here.
    pub password: Option<String>,
}

/// Inbound client commands.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Message { content: String },
    Interrupt,
}

/// GET /v1/tasks/:id/session — upgrade to the session stream.
pub async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    if let Some(hash) = &state.password_hash {
        let provided = query.password.as_deref().unwrap_or("");
        if !password_matches(hash, provided) {
            return (StatusCode::UNAUTHORIZED, "invalid or missing password").into_response();
        }
    }

    let task = match state.store.get_task(task_id) {
        Ok(Some(task)) => task,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, task_id, "task lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, task))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, task: Task) {
    let task_id = task.id;
    let handle = match supervisor::ensure_supervisor(&state, task) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, task_id, "could not start session supervisor");
            return;
        }
    };
    let mut events = handle.subscribe();

    tracing::info!(task_id, "session subscriber connected");
    let (mut sink, mut stream) = socket.split();

    // Writer task: forwards session events to the socket.
    let writer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(error = %e, "unserializable session event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(task_id, skipped, "session subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Reader loop: client commands.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Message { content }) => {
                    if !handle.send_message(content).await {
                        break;
                    }
                }
                Ok(ClientMessage::Interrupt) => handle.interrupt().await,
                Err(_) => {
                    tracing::debug!(task_id, "ignoring unparseable client message");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    tracing::info!(task_id, "session subscriber disconnected");
}
