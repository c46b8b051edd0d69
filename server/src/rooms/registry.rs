use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::ws::broadcast::{force_close, send_frame};
use crate::ws::protocol::{encode, PeerInfo, ServerMessage, SignalPayload};
use crate::ws::{ConnectionId, ConnectionSender, CLOSE_SUPERSEDED};

/// One live connection registered in a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub client_id: String,
    pub username: String,
    pub room_id: String,
    pub joined_at: DateTime<Utc>,
    pub connection_id: ConnectionId,
    pub sender: ConnectionSender,
}

impl Member {
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            client_id: self.client_id.clone(),
            username: self.username.clone(),
        }
    }
}

/// A room is nothing but its members, in join order.
#[derive(Debug, Default)]
struct Room {
    members: Vec<Member>,
}

impl Room {
    fn member(&self, client_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.client_id == client_id)
    }

    /// Queue `frame` on every member except `exclude`.
    /// Returns how many queues accepted it and the members whose queue is closed.
    fn fan_out(&self, frame: &Message, exclude: Option<&str>) -> (usize, Vec<(String, ConnectionId)>) {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for member in &self.members {
            if exclude == Some(member.client_id.as_str()) {
                continue;
            }
            if send_frame(&member.sender, frame) {
                delivered += 1;
            } else {
                dead.push((member.client_id.clone(), member.connection_id));
            }
        }
        (delivered, dead)
    }
}

/// Where a client id currently lives.
#[derive(Debug, Clone)]
struct ClientSlot {
    room_id: String,
    connection_id: ConnectionId,
}

/// Result from joining a room.
#[derive(Debug, Clone)]
pub struct JoinResult {
    pub room_id: String,
    pub client_id: String,
    pub connection_id: ConnectionId,
    /// Members present before the join, in join order.
    pub existing_users: Vec<PeerInfo>,
    /// True if an older connection with the same client id was evicted.
    pub replaced_stale: bool,
}

/// What happened to a relayed signal. Only used for logging; the sender is
/// never told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    SelfTarget,
    UnknownSender,
    UnknownTarget,
    DifferentRoom,
    TargetUnreachable,
}

/// Point-in-time view of one member, for the room listing.
#[derive(Debug, Clone, Serialize)]
pub struct MemberSnapshot {
    pub client_id: String,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// Point-in-time view of one room, for the room listing.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub user_count: usize,
    pub users: Vec<MemberSnapshot>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// room_id -> Room
    rooms: DashMap<String, Room>,
    /// client_id -> current room and connection
    clients: DashMap<String, ClientSlot>,
}

/// Authoritative room membership and message routing.
///
/// Rooms live in a sharded map, so every operation on a room runs under that
/// room's entry lock while unrelated rooms proceed in parallel. The client index
/// is only written while the owning room's entry is held; locks are always taken
/// in the order rooms, then clients.
///
/// Frames are queued on each connection's unbounded channel while the room is
/// locked. Queuing never blocks; the socket write happens in the connection's
/// writer task, outside any lock. This keeps every room event in the same order
/// on every member's queue.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room on demand.
    ///
    /// Existing members receive `user_joined`; the joiner receives `room_joined`
    /// listing the members that were already present. A client id that is
    /// still registered from an older connection is evicted first and that
    /// connection is asked to close.
    pub fn join(
        &self,
        sender: ConnectionSender,
        client_id: &str,
        room_id: &str,
        username: &str,
    ) -> JoinResult {
        let mut replaced_stale = false;
        if let Some(slot) = self.slot(client_id) {
            replaced_stale |= self.evict(client_id, &slot);
        }

        let connection_id = Uuid::new_v4();
        let (existing_users, previous, dead) = {
            let mut room = self.inner.rooms.entry(room_id.to_string()).or_default();

            let existing_users: Vec<PeerInfo> = room.members.iter().map(Member::peer_info).collect();

            let dead = match encode(&ServerMessage::user_joined(client_id, username)) {
                Some(frame) => room.fan_out(&frame, None).1,
                None => Vec::new(),
            };

            if let Some(frame) = encode(&ServerMessage::room_joined(
                room_id,
                client_id,
                existing_users.clone(),
            )) {
                let _ = sender.send(frame);
            }

            room.members.push(Member {
                client_id: client_id.to_string(),
                username: username.to_string(),
                room_id: room_id.to_string(),
                joined_at: Utc::now(),
                connection_id,
                sender,
            });

            let previous = self.inner.clients.insert(
                client_id.to_string(),
                ClientSlot {
                    room_id: room_id.to_string(),
                    connection_id,
                },
            );

            (existing_users, previous, dead)
        };

        // A concurrent join with the same client id slipped in between the
        // eviction above and our insert.
        if let Some(slot) = previous {
            replaced_stale |= self.evict(client_id, &slot);
        }

        self.reap(dead);

        tracing::info!(
            client_id = %client_id,
            room_id = %room_id,
            connection_id = %connection_id,
            existing = existing_users.len(),
            "Member joined room"
        );

        JoinResult {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
            connection_id,
            existing_users,
            replaced_stale,
        }
    }

    /// Remove a client from its room. Idempotent: unknown ids are a no-op.
    pub fn leave(&self, client_id: &str) {
        if let Some(slot) = self.slot(client_id) {
            let _ = self.remove_member(&slot.room_id, client_id, slot.connection_id);
        }
    }

    /// Remove a client only if it is still registered through `connection_id`.
    /// Sessions call this on exit so a superseded connection cannot evict its
    /// replacement.
    pub fn leave_connection(&self, client_id: &str, connection_id: ConnectionId) {
        match self.slot(client_id) {
            Some(slot) if slot.connection_id == connection_id => {
                let _ = self.remove_member(&slot.room_id, client_id, connection_id);
            }
            _ => {}
        }
    }

    /// Queue an event on every member of a room except `exclude`.
    /// Returns the number of members it was queued for. Unknown rooms are a no-op.
    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };

        let (delivered, dead) = match self.inner.rooms.get(room_id) {
            Some(room) => room.fan_out(&frame, exclude),
            None => return 0,
        };

        self.reap(dead);
        delivered
    }

    /// Relay a signaling payload from one member to another.
    ///
    /// Delivered only when both ids are registered and share a room; every
    /// other combination, including a client targeting itself, is dropped.
    pub fn relay_direct(&self, from: &str, to: &str, payload: SignalPayload) -> RelayOutcome {
        if from == to {
            return RelayOutcome::SelfTarget;
        }
        let Some(sender_slot) = self.slot(from) else {
            return RelayOutcome::UnknownSender;
        };
        let Some(target_slot) = self.slot(to) else {
            return RelayOutcome::UnknownTarget;
        };
        if sender_slot.room_id != target_slot.room_id {
            return RelayOutcome::DifferentRoom;
        }

        let Some(frame) = encode(&ServerMessage::signal(from, payload)) else {
            return RelayOutcome::TargetUnreachable;
        };

        let dead = {
            let Some(room) = self.inner.rooms.get(&sender_slot.room_id) else {
                return RelayOutcome::UnknownSender;
            };
            // Membership may have changed since the index lookups.
            if room.member(from).is_none() {
                return RelayOutcome::UnknownSender;
            }
            let Some(target) = room.member(to) else {
                return RelayOutcome::UnknownTarget;
            };
            if send_frame(&target.sender, &frame) {
                return RelayOutcome::Delivered;
            }
            (target.client_id.clone(), target.connection_id)
        };

        self.reap(vec![dead]);
        RelayOutcome::TargetUnreachable
    }

    /// Queue an event on one registered client.
    pub fn send_to(&self, client_id: &str, message: &ServerMessage) -> bool {
        let Some(slot) = self.slot(client_id) else {
            return false;
        };
        let Some(frame) = encode(message) else {
            return false;
        };

        let dead = {
            let Some(room) = self.inner.rooms.get(&slot.room_id) else {
                return false;
            };
            let Some(member) = room.member(client_id) else {
                return false;
            };
            if send_frame(&member.sender, &frame) {
                return true;
            }
            (member.client_id.clone(), member.connection_id)
        };

        self.reap(vec![dead]);
        false
    }

    /// Room a client is currently in.
    pub fn room_of(&self, client_id: &str) -> Option<String> {
        self.slot(client_id).map(|slot| slot.room_id)
    }

    /// True if `client_id` is registered through this exact connection.
    pub fn is_current(&self, client_id: &str, connection_id: ConnectionId) -> bool {
        self.slot(client_id)
            .is_some_and(|slot| slot.connection_id == connection_id)
    }

    /// Members of a room, in join order.
    pub fn members(&self, room_id: &str) -> Vec<PeerInfo> {
        self.inner
            .rooms
            .get(room_id)
            .map(|room| room.members.iter().map(Member::peer_info).collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Snapshot of every room, keyed by room id.
    ///
    /// Shards are read one at a time, so live traffic on other rooms is never
    /// paused; the result may mix moments a few microseconds apart.
    pub fn snapshot(&self) -> BTreeMap<String, RoomSnapshot> {
        self.inner
            .rooms
            .iter()
            .map(|entry| {
                let users: Vec<MemberSnapshot> = entry
                    .value()
                    .members
                    .iter()
                    .map(|m| MemberSnapshot {
                        client_id: m.client_id.clone(),
                        username: m.username.clone(),
                        joined_at: m.joined_at,
                    })
                    .collect();
                (
                    entry.key().clone(),
                    RoomSnapshot {
                        user_count: users.len(),
                        users,
                    },
                )
            })
            .collect()
    }

    /// Ask every registered connection to close. Used at shutdown.
    pub fn close_all(&self, close_code: u16, reason: &str) {
        let mut closed = 0usize;
        for room in self.inner.rooms.iter() {
            for member in &room.value().members {
                force_close(&member.sender, close_code, reason);
                closed += 1;
            }
        }
        tracing::info!(connections = closed, "Closed all sessions");
    }

    fn slot(&self, client_id: &str) -> Option<ClientSlot> {
        self.inner
            .clients
            .get(client_id)
            .map(|entry| entry.value().clone())
    }

    /// Drop a stale registration and tell its connection to go away.
    fn evict(&self, client_id: &str, slot: &ClientSlot) -> bool {
        match self.remove_member(&slot.room_id, client_id, slot.connection_id) {
            Some(stale) => {
                tracing::warn!(
                    client_id = %client_id,
                    room_id = %stale.room_id,
                    connection_id = %stale.connection_id,
                    "Client id rejoined, evicting previous connection"
                );
                force_close(&stale.sender, CLOSE_SUPERSEDED, "Superseded by a newer connection");
                true
            }
            None => false,
        }
    }

    /// Remove the member registered through `connection_id` from a room,
    /// announce `user_left` to whoever remains, and drop the room once empty.
    fn remove_member(
        &self,
        room_id: &str,
        client_id: &str,
        connection_id: ConnectionId,
    ) -> Option<Member> {
        let (member, dead) = match self.inner.rooms.entry(room_id.to_string()) {
            Entry::Vacant(_) => return None,
            Entry::Occupied(mut occupied) => {
                let room = occupied.get_mut();
                let pos = room
                    .members
                    .iter()
                    .position(|m| m.client_id == client_id && m.connection_id == connection_id)?;
                let member = room.members.remove(pos);

                let _ = self
                    .inner
                    .clients
                    .remove_if(client_id, |_, slot| slot.connection_id == connection_id);

                // A newer connection for the same id may already sit in this
                // room; it must not hear about its own departure.
                let dead = match encode(&ServerMessage::user_left(&member.client_id, &member.username)) {
                    Some(frame) => room.fan_out(&frame, Some(client_id)).1,
                    None => Vec::new(),
                };

                if room.members.is_empty() {
                    let _ = occupied.remove();
                    tracing::debug!(room_id = %room_id, "Room emptied and removed");
                }

                (member, dead)
            }
        };

        tracing::info!(
            client_id = %client_id,
            room_id = %room_id,
            connection_id = %connection_id,
            "Member left room"
        );

        self.reap(dead);
        Some(member)
    }

    /// Schedule removal of members whose outbound queue is closed.
    /// Runs on a separate task when a runtime is available so the caller's
    /// fan-out is never re-entered.
    fn reap(&self, dead: Vec<(String, ConnectionId)>) {
        if dead.is_empty() {
            return;
        }
        tracing::debug!(count = dead.len(), "Reaping unreachable members");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.clone();
                let _ = handle.spawn(async move {
                    for (client_id, connection_id) in dead {
                        registry.leave_connection(&client_id, connection_id);
                    }
                });
            }
            Err(_) => {
                for (client_id, connection_id) in dead {
                    self.leave_connection(&client_id, connection_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    type Inbox = mpsc::UnboundedReceiver<Message>;

    fn connection() -> (ConnectionSender, Inbox) {
        mpsc::unbounded_channel()
    }

    /// Drain every queued frame as JSON, skipping non-text frames.
    fn drain(rx: &mut Inbox) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        out
    }

    fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
        frames.iter().filter(|f| f["type"] == kind).collect()
    }

    fn payload(signal: &str, kind: &str) -> SignalPayload {
        SignalPayload {
            signal: json!(signal),
            signal_type: json!(kind),
        }
    }

    #[tokio::test]
    async fn test_join_reports_existing_members_and_notifies_them() {
        let registry = Registry::new();
        let (tx1, mut rx1) = connection();
        let (tx2, mut rx2) = connection();

        let first = registry.join(tx1, "c1", "lobby", "alice");
        assert!(first.existing_users.is_empty());

        let second = registry.join(tx2, "c2", "lobby", "bob");
        assert_eq!(
            second.existing_users,
            vec![PeerInfo {
                client_id: "c1".to_string(),
                username: "alice".to_string()
            }]
        );

        let frames1 = drain(&mut rx1);
        let joined = of_type(&frames1, "user_joined");
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0]["client_id"], "c2");
        assert_eq!(joined[0]["username"], "bob");

        let frames2 = drain(&mut rx2);
        assert!(of_type(&frames2, "user_joined").is_empty());
        let confirm = of_type(&frames2, "room_joined");
        assert_eq!(confirm.len(), 1);
        assert_eq!(confirm[0]["room_id"], "lobby");
        assert_eq!(confirm[0]["client_id"], "c2");
        assert_eq!(
            confirm[0]["existing_users"],
            json!([{"client_id": "c1", "username": "alice"}])
        );
    }

    #[tokio::test]
    async fn test_room_joined_is_first_frame_for_joiner() {
        let registry = Registry::new();
        let (tx1, _rx1) = connection();
        let (tx2, mut rx2) = connection();
        let (tx3, _rx3) = connection();

        registry.join(tx1, "c1", "lobby", "alice");
        registry.join(tx2, "c2", "lobby", "bob");
        registry.join(tx3, "c3", "lobby", "carol");

        let frames = drain(&mut rx2);
        assert_eq!(frames[0]["type"], "room_joined");
        assert_eq!(frames[1]["type"], "user_joined");
        assert_eq!(frames[1]["client_id"], "c3");
    }

    #[tokio::test]
    async fn test_leave_notifies_remaining_and_removes_empty_room() {
        let registry = Registry::new();
        let (tx1, mut rx1) = connection();
        let (tx2, _rx2) = connection();

        registry.join(tx1, "c1", "lobby", "alice");
        registry.join(tx2, "c2", "lobby", "bob");
        drain(&mut rx1);

        registry.leave("c2");
        let frames = drain(&mut rx1);
        let left = of_type(&frames, "user_left");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["client_id"], "c2");
        assert_eq!(left[0]["username"], "bob");
        assert_eq!(registry.members("lobby").len(), 1);

        registry.leave("c1");
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.member_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let registry = Registry::new();
        let (tx1, mut rx1) = connection();
        let (tx2, _rx2) = connection();

        registry.join(tx1, "c1", "lobby", "alice");
        registry.join(tx2, "c2", "lobby", "bob");
        drain(&mut rx1);

        registry.leave("c2");
        registry.leave("c2");
        registry.leave("never-joined");

        let frames = drain(&mut rx1);
        assert_eq!(of_type(&frames, "user_left").len(), 1);
        assert_eq!(registry.member_count(), 1);
    }

    #[tokio::test]
    async fn test_relay_requires_shared_room() {
        let registry = Registry::new();
        let (tx1, _rx1) = connection();
        let (tx2, mut rx2) = connection();
        let (tx3, mut rx3) = connection();

        registry.join(tx1, "c1", "lobby", "alice");
        registry.join(tx2, "c2", "lobby", "bob");
        registry.join(tx3, "c3", "attic", "carol");
        drain(&mut rx2);
        drain(&mut rx3);

        assert_eq!(
            registry.relay_direct("c1", "c2", payload("offer-blob", "offer")),
            RelayOutcome::Delivered
        );
        let frames = drain(&mut rx2);
        assert_eq!(
            frames,
            vec![json!({"type": "signal", "signal": "offer-blob", "signal_type": "offer", "from": "c1"})]
        );

        assert_eq!(
            registry.relay_direct("c1", "c3", payload("offer-blob", "offer")),
            RelayOutcome::DifferentRoom
        );
        assert!(drain(&mut rx3).is_empty());

        assert_eq!(
            registry.relay_direct("c1", "ghost", payload("x", "candidate")),
            RelayOutcome::UnknownTarget
        );
        assert_eq!(
            registry.relay_direct("ghost", "c2", payload("x", "candidate")),
            RelayOutcome::UnknownSender
        );
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn test_self_relay_is_rejected() {
        let registry = Registry::new();
        let (tx1, mut rx1) = connection();
        registry.join(tx1, "c1", "lobby", "alice");
        drain(&mut rx1);

        assert_eq!(
            registry.relay_direct("c1", "c1", payload("loop", "offer")),
            RelayOutcome::SelfTarget
        );
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_respects_exclusion_and_room_scope() {
        let registry = Registry::new();
        let (tx1, mut rx1) = connection();
        let (tx2, mut rx2) = connection();
        let (tx3, mut rx3) = connection();

        registry.join(tx1, "c1", "lobby", "alice");
        registry.join(tx2, "c2", "lobby", "bob");
        registry.join(tx3, "c3", "attic", "carol");
        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        let chat = ServerMessage::chat("c1", "alice", "hello");
        assert_eq!(registry.broadcast_to_room("lobby", &chat, None), 2);
        assert_eq!(of_type(&drain(&mut rx1), "chat").len(), 1);
        assert_eq!(of_type(&drain(&mut rx2), "chat").len(), 1);
        assert!(drain(&mut rx3).is_empty());

        assert_eq!(registry.broadcast_to_room("lobby", &chat, Some("c1")), 1);
        assert!(drain(&mut rx1).is_empty());
        assert_eq!(drain(&mut rx2).len(), 1);

        assert_eq!(registry.broadcast_to_room("nowhere", &chat, None), 0);
    }

    #[tokio::test]
    async fn test_unreachable_member_is_reaped_after_broadcast() {
        let registry = Registry::new();
        let (tx1, mut rx1) = connection();
        let (tx2, rx2) = connection();

        registry.join(tx1, "c1", "lobby", "alice");
        registry.join(tx2, "c2", "lobby", "bob");
        drop(rx2);
        drain(&mut rx1);

        let chat = ServerMessage::chat("c1", "alice", "anyone there?");
        assert_eq!(registry.broadcast_to_room("lobby", &chat, None), 1);

        for _ in 0..10 {
            if registry.member_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.members("lobby").len(), 1);
        assert!(registry.room_of("c2").is_none());

        let frames = drain(&mut rx1);
        let left = of_type(&frames, "user_left");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["client_id"], "c2");
    }

    #[tokio::test]
    async fn test_rejoin_evicts_previous_connection() {
        let registry = Registry::new();
        let (tx_old, mut rx_old) = connection();
        let (tx_new, mut rx_new) = connection();
        let (tx_peer, mut rx_peer) = connection();

        registry.join(tx_peer, "peer", "lobby", "peer");
        let old = registry.join(tx_old, "c1", "lobby", "alice");
        drain(&mut rx_peer);

        let new = registry.join(tx_new, "c1", "attic", "alice");
        assert!(new.replaced_stale);
        assert!(new.existing_users.is_empty());
        assert_eq!(registry.room_of("c1").as_deref(), Some("attic"));
        assert_eq!(registry.members("lobby").len(), 1);

        let mut saw_close = false;
        while let Ok(msg) = rx_old.try_recv() {
            if let Message::Close(Some(frame)) = msg {
                assert_eq!(frame.code, CLOSE_SUPERSEDED);
                saw_close = true;
            }
        }
        assert!(saw_close, "stale connection should be asked to close");

        let peer_frames = drain(&mut rx_peer);
        assert_eq!(of_type(&peer_frames, "user_left").len(), 1);

        // The superseded session's own cleanup must not touch the new registration.
        registry.leave_connection("c1", old.connection_id);
        assert!(registry.is_current("c1", new.connection_id));
        assert_eq!(registry.members("attic").len(), 1);
        assert_eq!(of_type(&drain(&mut rx_new), "room_joined").len(), 1);
    }

    #[tokio::test]
    async fn test_membership_invariants_hold_across_churn() {
        let registry = Registry::new();
        let rooms = ["a", "b", "c"];
        let mut inboxes = Vec::new();

        for step in 0..60usize {
            let client = format!("c{}", step % 7);
            if step % 3 == 2 {
                registry.leave(&client);
            } else {
                let (tx, rx) = connection();
                inboxes.push(rx);
                registry.join(tx, &client, rooms[step % rooms.len()], &client);
            }

            let snapshot = registry.snapshot();
            let mut seen = std::collections::HashSet::new();
            for (room_id, room) in &snapshot {
                assert!(room.user_count > 0, "room {} leaked while empty", room_id);
                for user in &room.users {
                    assert!(seen.insert(user.client_id.clone()), "{} in two rooms", user.client_id);
                    assert_eq!(registry.room_of(&user.client_id).as_deref(), Some(room_id.as_str()));
                }
            }
            assert_eq!(seen.len(), registry.member_count());
        }
    }

    #[tokio::test]
    async fn test_stale_eviction_skips_replacement_in_same_room() {
        let registry = Registry::new();
        let (tx_peer, mut rx_peer) = connection();
        let (tx_old, _rx_old) = connection();
        let (tx_new, mut rx_new) = connection();

        registry.join(tx_peer, "peer", "lobby", "peer");
        let old = registry.join(tx_old, "c1", "lobby", "alice");
        let stale = registry.slot("c1").unwrap();
        drain(&mut rx_peer);

        // Replacement registered in the same room before the stale record was
        // evicted, as happens when two joins for one id interleave.
        let new_id = Uuid::new_v4();
        registry.inner.rooms.get_mut("lobby").unwrap().members.push(Member {
            client_id: "c1".to_string(),
            username: "alice".to_string(),
            room_id: "lobby".to_string(),
            joined_at: Utc::now(),
            connection_id: new_id,
            sender: tx_new,
        });
        registry.inner.clients.insert(
            "c1".to_string(),
            ClientSlot {
                room_id: "lobby".to_string(),
                connection_id: new_id,
            },
        );

        assert_eq!(stale.connection_id, old.connection_id);
        assert!(registry.evict("c1", &stale));

        assert_eq!(of_type(&drain(&mut rx_peer), "user_left").len(), 1);
        assert!(of_type(&drain(&mut rx_new), "user_left").is_empty());
        assert!(registry.is_current("c1", new_id));
        assert_eq!(registry.members("lobby").len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_leave_rejoin_keeps_invariants() {
        let registry = Registry::new();
        let rooms = ["a", "b", "c"];

        let mut handles = Vec::new();
        for worker in 0..8usize {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let mut inboxes = Vec::new();
                for step in 0..200usize {
                    let client = format!("c{}", (worker + step) % 5);
                    let room = rooms[(worker * 7 + step) % rooms.len()];
                    if step % 4 == 3 {
                        registry.leave(&client);
                    } else {
                        let (tx, rx) = connection();
                        inboxes.push(rx);
                        registry.join(tx, &client, room, &client);
                    }
                    if step % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                inboxes
            }));
        }

        let mut inboxes = Vec::new();
        for handle in handles {
            inboxes.extend(handle.await.unwrap());
        }

        let snapshot = registry.snapshot();
        let mut seen = std::collections::HashSet::new();
        for (room_id, room) in &snapshot {
            assert!(room.user_count > 0, "room {} leaked while empty", room_id);
            for user in &room.users {
                assert!(seen.insert(user.client_id.clone()), "{} registered twice", user.client_id);
                assert_eq!(registry.room_of(&user.client_id).as_deref(), Some(room_id.as_str()));
            }
        }
        assert_eq!(seen.len(), registry.member_count());

        for i in 0..5 {
            registry.leave(&format!("c{}", i));
        }
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.member_count(), 0);
        drop(inboxes);
    }

    #[tokio::test]
    async fn test_snapshot_lists_rooms_with_members() {
        let registry = Registry::new();
        let (tx1, _rx1) = connection();
        let (tx2, _rx2) = connection();
        let (tx3, _rx3) = connection();

        registry.join(tx1, "c1", "lobby", "alice");
        registry.join(tx2, "c2", "lobby", "bob");
        registry.join(tx3, "c3", "attic", "carol");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["lobby"].user_count, 2);
        assert_eq!(snapshot["lobby"].users[0].username, "alice");
        assert_eq!(snapshot["lobby"].users[1].username, "bob");
        assert_eq!(snapshot["attic"].user_count, 1);
    }

    #[tokio::test]
    async fn test_send_to_and_close_all() {
        let registry = Registry::new();
        let (tx1, mut rx1) = connection();
        registry.join(tx1, "c1", "lobby", "alice");
        drain(&mut rx1);

        assert!(registry.send_to("c1", &ServerMessage::pong()));
        assert!(!registry.send_to("ghost", &ServerMessage::pong()));
        assert_eq!(of_type(&drain(&mut rx1), "pong").len(), 1);

        registry.close_all(1001, "server shutting down");
        match rx1.try_recv() {
            Ok(Message::Close(Some(frame))) => assert_eq!(frame.code, 1001),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }
}
