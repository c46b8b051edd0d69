use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    response::Response,
};

use crate::state::AppState;
use crate::ws::actor;

/// GET /ws/{client_id}
/// WebSocket upgrade endpoint. The client id is taken from the path as-is;
/// callers are trusted to pick unique ids. Each upgraded socket runs its own
/// session actor.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!(client_id = %client_id, "WebSocket upgrade requested");

    let max_message_size = state.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| actor::run_connection(socket, state, client_id))
}
