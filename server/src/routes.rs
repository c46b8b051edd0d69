use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use crate::rooms::listing;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint; the path segment is the caller-chosen client id
    let ws_routes = Router::new().route("/ws/{client_id}", get(ws_handler::ws_upgrade));

    // Read-only monitoring
    let api_routes = Router::new().route("/api/rooms", get(listing::list_rooms));

    // Health check
    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(api_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now(),
    }))
}
