//! HTTP route table.

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::{admin, auth, repos, session_ws, tasks};
use crate::state::AppState;

/// Build the full router. Everything except the session WebSocket (which
/// authenticates via query parameter) sits behind the password gate.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route(
            "/v1/tasks/:id",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route(
            "/v1/tasks/:id/messages",
            get(tasks::list_messages).post(tasks::send_message),
        )
        .route("/v1/repos", post(repos::create_repo).get(repos::list_repos))
        .route("/v1/oauth/seed", post(admin::seed_token))
        .route(
            "/v1/admin/sprites/:name/hibernate",
            post(admin::hibernate_sprite),
        )
        .route("/v1/admin/sprites/:name", delete(admin::delete_sprite))
        .layer(from_fn_with_state(state.clone(), auth::require_password));

    Router::new()
        .route("/v1/tasks/:id/session", get(session_ws::session_ws))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
