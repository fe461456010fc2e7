pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::models::{GroupId, UserId};

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Fan-out audiences a connection can be subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    /// Every connected member of the group: membership and list updates.
    Group(GroupId),
    /// Members with the conversation open: full message stream.
    GroupChat(GroupId),
}

impl Room {
    pub fn group_id(&self) -> &str {
        match self {
            Self::Group(id) | Self::GroupChat(id) => id,
        }
    }
}

/// Live connection handle. Cheap to clone; equality is by connection id, so a
/// handle from an earlier session never matches a newer one.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: ConnectionSender,
    rooms: Arc<DashSet<Room>>,
}

impl ConnectionHandle {
    pub fn new(tx: ConnectionSender) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            rooms: Arc::new(DashSet::new()),
        }
    }

    /// Create a handle together with the receiving end of its ordered stream.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame for the writer task. Returns false if the connection is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn join_room(&self, room: Room) {
        self.rooms.insert(room);
    }

    pub fn leave_room(&self, room: &Room) {
        self.rooms.remove(room);
    }

    /// Drop both subscriptions for a group.
    pub fn leave_group_rooms(&self, group_id: &str) {
        self.rooms.remove(&Room::Group(group_id.to_string()));
        self.rooms.remove(&Room::GroupChat(group_id.to_string()));
    }

    pub fn in_room(&self, room: &Room) -> bool {
        self.rooms.contains(room)
    }

    pub fn rooms(&self) -> BTreeSet<Room> {
        self.rooms.iter().map(|room| room.key().clone()).collect()
    }

    pub fn clear_rooms(&self) {
        self.rooms.clear();
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// Connection registry: at most one live connection per user.
///
/// Each operation touches a single DashMap shard and never awaits, so
/// callers resolve a handle, release, then send.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<UserId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `user_id` to `handle`, returning the superseded handle if any.
    /// The previous connection is not closed here.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self.sessions.insert(user_id.to_string(), handle);
        tracing::debug!(
            user_id = %user_id,
            superseded = previous.is_some(),
            "Connection registered"
        );
        previous
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.sessions.get(user_id).map(|entry| entry.value().clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Remove the mapping only if it still points at `handle`. A stale
    /// disconnect from an earlier session leaves a newer one untouched.
    pub fn unregister(&self, user_id: &str, handle: &ConnectionHandle) -> bool {
        let removed = self
            .sessions
            .remove_if(user_id, |_, current| current == handle)
            .is_some();
        tracing::debug!(user_id = %user_id, removed, "Connection unregistered");
        removed
    }

    pub fn list_online(&self) -> BTreeSet<UserId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every live handle, for broadcasts.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
