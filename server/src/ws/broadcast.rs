use axum::extract::ws::{CloseFrame, Message};

use super::protocol::{self, ServerMessage};
use super::ConnectionSender;

/// Queue an event on a single connection.
/// Returns false if the connection's writer has gone away.
pub fn send_message(tx: &ConnectionSender, message: &ServerMessage) -> bool {
    match protocol::encode(message) {
        Some(frame) => tx.send(frame).is_ok(),
        None => false,
    }
}

/// Queue an already-encoded frame on a connection.
/// Broadcasts encode once and call this per recipient.
pub fn send_frame(tx: &ConnectionSender, frame: &Message) -> bool {
    tx.send(frame.clone()).is_ok()
}

/// Ask a connection to close with the given code and reason.
pub fn force_close(tx: &ConnectionSender, close_code: u16, reason: &str) {
    let close_frame = CloseFrame {
        code: close_code,
        reason: reason.into(),
    };
    let _ = tx.send(Message::Close(Some(close_frame)));
}
