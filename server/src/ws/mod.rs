pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Type alias for the sender half of a WebSocket connection's channel.
/// The registry clones this to push frames to a specific client; the
/// connection's writer task drains it in order.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Identifies one physical connection. A client id may be reused by a later
/// connection; the connection id never is.
pub type ConnectionId = Uuid;

/// WebSocket close codes:
/// 1001 = server going away
/// 4000 = superseded by a newer connection with the same client id
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_SUPERSEDED: u16 = 4000;
