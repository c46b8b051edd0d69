//! JSON wire protocol spoken over a signaling WebSocket.
//!
//! Every frame is a single UTF-8 JSON object with a `type` discriminator.
//! Inbound frames are decoded once, at the boundary, into [`ClientMessage`];
//! outbound events are built as [`ServerMessage`] and serialized into text frames.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure to turn an inbound frame into a [`ClientMessage`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame was not a JSON object carrying a known shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The underlying transport failed while reading.
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
}

/// Messages a client may send.
///
/// Optional fields are modelled explicitly; defaults are applied by the session,
/// not here. A `type` outside the known set decodes to [`ClientMessage::Unknown`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message of every session. Missing `room_id` falls back to the
    /// configured default room, missing `username` to `User_<id prefix>`.
    Join {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        username: Option<String>,
    },
    /// Negotiation payload for one peer. `signal` and `signal_type` are opaque.
    Signal {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        signal: Value,
        #[serde(default)]
        signal_type: Value,
    },
    /// Room-wide chat line.
    Chat {
        #[serde(default)]
        message: Option<String>,
    },
    /// Application-level keepalive.
    Ping,
    #[serde(other)]
    Unknown,
}

/// Identity of a room member as advertised to other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub client_id: String,
    pub username: String,
}

/// Opaque negotiation payload carried by a relay.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalPayload {
    pub signal: Value,
    pub signal_type: Value,
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomJoined {
        room_id: String,
        client_id: String,
        existing_users: Vec<PeerInfo>,
        timestamp: DateTime<Utc>,
    },
    UserJoined {
        client_id: String,
        username: String,
        timestamp: DateTime<Utc>,
    },
    UserLeft {
        client_id: String,
        username: String,
        timestamp: DateTime<Utc>,
    },
    Signal {
        signal: Value,
        signal_type: Value,
        from: String,
    },
    Chat {
        from: String,
        username: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn room_joined(room_id: &str, client_id: &str, existing_users: Vec<PeerInfo>) -> Self {
        Self::RoomJoined {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
            existing_users,
            timestamp: Utc::now(),
        }
    }

    pub fn user_joined(client_id: &str, username: &str) -> Self {
        Self::UserJoined {
            client_id: client_id.to_string(),
            username: username.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn user_left(client_id: &str, username: &str) -> Self {
        Self::UserLeft {
            client_id: client_id.to_string(),
            username: username.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn signal(from: &str, payload: SignalPayload) -> Self {
        Self::Signal {
            signal: payload.signal,
            signal_type: payload.signal_type,
            from: from.to_string(),
        }
    }

    pub fn chat(from: &str, username: &str, message: &str) -> Self {
        Self::Chat {
            from: from.to_string(),
            username: username.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Serialize an event into a text frame, ready to be queued on any number of
/// connections.
pub fn encode(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server message");
            None
        }
    }
}
