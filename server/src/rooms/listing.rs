//! Read-only monitoring view over the room registry.

use axum::{extract::State, Json};
use std::collections::BTreeMap;

use crate::rooms::RoomSnapshot;
use crate::state::AppState;

/// GET /api/rooms — Every active room with its member count and members.
/// Built from a registry snapshot; live traffic is not paused.
pub async fn list_rooms(State(state): State<AppState>) -> Json<BTreeMap<String, RoomSnapshot>> {
    let rooms = state.registry.snapshot();
    tracing::debug!(rooms = rooms.len(), "Listing rooms");
    Json(rooms)
}
