use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::ops::ControlFlow;
use tokio::sync::mpsc;

use crate::rooms::{Registry, RelayOutcome};
use crate::state::AppState;
use crate::ws::broadcast::send_message;
use crate::ws::protocol::{self, ClientMessage, ProtocolError, ServerMessage, SignalPayload};
use crate::ws::{ConnectionId, ConnectionSender};

/// Outcome of waiting for the next inbound protocol message.
enum Received {
    Message(ClientMessage),
    /// Undecodable frame or transport failure. Ends the session.
    Failed(ProtocolError),
    Closed,
}

/// A session's registration in the room registry.
///
/// Leaving happens in `Drop`, so the member is removed exactly once on every
/// exit path: clean close, protocol error, transport error, or the task being
/// cancelled.
struct Membership {
    registry: Registry,
    client_id: String,
    room_id: String,
    username: String,
    connection_id: ConnectionId,
}

impl Membership {
    /// False once a newer connection has taken over this client id.
    fn is_current(&self) -> bool {
        self.registry.is_current(&self.client_id, self.connection_id)
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.registry
            .leave_connection(&self.client_id, self.connection_id);
        tracing::debug!(
            client_id = %self.client_id,
            connection_id = %self.connection_id,
            "Membership released"
        );
    }
}

/// Run one signaling session over an upgraded WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames queued on an mpsc channel
/// - Reader (this task): drives the session state machine
///
/// The session waits for a `join`, registers in the requested room, then
/// dispatches signal/chat/ping messages until the connection ends.
pub async fn run_connection(socket: WebSocket, state: AppState, client_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    tracing::info!(client_id = %client_id, "WebSocket session started");

    if let Some(membership) = await_join(&mut ws_receiver, &tx, &state, &client_id).await {
        run_active(&mut ws_receiver, &tx, &membership).await;
        drop(membership);
    }

    writer_handle.abort();

    tracing::info!(client_id = %client_id, "WebSocket session stopped");
}

/// AwaitingJoin: the first message must be a join request. Anything else, or
/// the connection closing, ends the session without registering.
async fn await_join(
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &ConnectionSender,
    state: &AppState,
    client_id: &str,
) -> Option<Membership> {
    let (room_id, username) = match receive(ws_receiver, tx, client_id).await {
        Received::Message(ClientMessage::Join { room_id, username }) => (
            room_id
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| state.default_room.clone()),
            username
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| default_username(client_id)),
        ),
        Received::Message(other) => {
            tracing::warn!(
                client_id = %client_id,
                message = ?other,
                "First message was not a join, closing"
            );
            return None;
        }
        Received::Failed(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "Failed before join");
            return None;
        }
        Received::Closed => {
            tracing::debug!(client_id = %client_id, "Closed before join");
            return None;
        }
    };

    let joined = state
        .registry
        .join(tx.clone(), client_id, &room_id, &username);

    tracing::info!(
        client_id = %client_id,
        room_id = %joined.room_id,
        existing = joined.existing_users.len(),
        replaced_stale = joined.replaced_stale,
        "Session active"
    );

    Some(Membership {
        registry: state.registry.clone(),
        client_id: joined.client_id,
        room_id: joined.room_id,
        username,
        connection_id: joined.connection_id,
    })
}

/// Active: dispatch messages until the connection closes or misbehaves.
async fn run_active(
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &ConnectionSender,
    membership: &Membership,
) {
    let client_id = membership.client_id.as_str();

    loop {
        let msg = match receive(ws_receiver, tx, client_id).await {
            Received::Message(msg) => msg,
            Received::Failed(e) => {
                tracing::warn!(client_id = %client_id, error = %e, "Ending session on protocol error");
                break;
            }
            Received::Closed => break,
        };

        if dispatch(membership, tx, msg).is_break() {
            break;
        }
    }

    if !membership.is_current() {
        tracing::info!(client_id = %client_id, "Session superseded by a newer connection");
    }
}

/// Handle one message from an active session.
fn dispatch(membership: &Membership, tx: &ConnectionSender, msg: ClientMessage) -> ControlFlow<()> {
    let client_id = membership.client_id.as_str();

    // A newer connection took over this client id; stop serving this one.
    if !membership.is_current() {
        return ControlFlow::Break(());
    }

    match msg {
        ClientMessage::Signal {
            to,
            signal,
            signal_type,
        } => {
            let Some(to) = to else {
                tracing::debug!(client_id = %client_id, "Signal without target ignored");
                return ControlFlow::Continue(());
            };
            let outcome = membership.registry.relay_direct(
                client_id,
                &to,
                SignalPayload {
                    signal,
                    signal_type,
                },
            );
            if outcome != RelayOutcome::Delivered {
                tracing::debug!(
                    client_id = %client_id,
                    to = %to,
                    outcome = ?outcome,
                    "Signal dropped"
                );
            }
        }
        ClientMessage::Chat {
            message: Some(message),
        } => {
            let chat = ServerMessage::chat(client_id, &membership.username, &message);
            membership
                .registry
                .broadcast_to_room(&membership.room_id, &chat, None);
        }
        ClientMessage::Chat { message: None } => {
            tracing::debug!(client_id = %client_id, "Chat without message ignored");
        }
        ClientMessage::Ping => {
            let _ = send_message(tx, &ServerMessage::pong());
        }
        ClientMessage::Join { .. } => {
            tracing::debug!(client_id = %client_id, "Repeated join ignored");
        }
        ClientMessage::Unknown => {
            tracing::debug!(client_id = %client_id, "Unknown message type ignored");
        }
    }
    ControlFlow::Continue(())
}

/// Wait for the next protocol message, answering transport pings and skipping
/// frames that carry none.
async fn receive(
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &ConnectionSender,
    client_id: &str,
) -> Received {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                return match protocol::decode(text.as_str()) {
                    Ok(msg) => Received::Message(msg),
                    Err(e) => Received::Failed(e),
                };
            }
            Some(Ok(Message::Binary(data))) => {
                tracing::debug!(
                    client_id = %client_id,
                    bytes = data.len(),
                    "Ignoring binary frame"
                );
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = tx.send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(
                    client_id = %client_id,
                    reason = ?frame,
                    "Client initiated close"
                );
                return Received::Closed;
            }
            Some(Err(e)) => return Received::Failed(e.into()),
            None => {
                tracing::info!(client_id = %client_id, "WebSocket stream ended");
                return Received::Closed;
            }
        }
    }
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}

/// Placeholder display name for joins that omit `username`.
fn default_username(client_id: &str) -> String {
    format!("User_{}", client_id.chars().take(6).collect::<String>())
}
