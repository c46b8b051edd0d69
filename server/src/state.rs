use crate::config::Config;
use crate::rooms::Registry;

/// Room id used when a join request does not name one.
pub const DEFAULT_ROOM: &str = "default";

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Room membership and routing; one instance per process
    pub registry: Registry,
    /// Room assigned to joins that omit `room_id`
    pub default_room: String,
    /// Largest inbound WebSocket message accepted, in bytes
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(registry: Registry, config: &Config) -> Self {
        Self {
            registry,
            default_room: config.default_room.clone(),
            max_message_size: config.max_message_size_kb * 1024,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Registry::new(), &Config::default())
    }
}
