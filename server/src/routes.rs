use axum::{routing::get, Router};

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router: the realtime socket plus a health probe.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (auth via query param, not header)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
