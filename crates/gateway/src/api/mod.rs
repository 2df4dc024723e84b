//! WebSocket endpoints for agent sessions and the orchestrator.

pub mod chat;
pub mod orchestrator;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/sessions/chat", get(chat::chat_ws))
        .route("/api/orchestrator/chat", get(orchestrator::orchestrator_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
