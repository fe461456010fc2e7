//! Fan-out dispatcher.
//!
//! Every emit resolves live handles from the registry (and, for rooms, the
//! group presence index), releases those maps, then queues the frame on each
//! handle's channel. Offline targets are a silent no-op: catch-up happens on
//! reconnect, never by queueing here.

use std::sync::Arc;

use axum::extract::ws::Message;

use super::protocol::ServerEvent;
use super::{ConnectionHandle, ConnectionRegistry, Room};
use crate::presence::GroupPresenceIndex;

/// Audience for an emit.
#[derive(Debug, Clone)]
pub enum Target<'a> {
    User(&'a str),
    Room(&'a Room),
    All,
}

#[derive(Clone)]
pub struct Dispatcher {
    connections: Arc<ConnectionRegistry>,
    presence: Arc<GroupPresenceIndex>,
}

/// Encode a server event as a JSON text frame.
pub fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode server event");
            None
        }
    }
}

/// Send a server event straight to one handle.
pub fn send_to(handle: &ConnectionHandle, event: &ServerEvent) -> bool {
    encode(event).is_some_and(|msg| handle.send(msg))
}

impl Dispatcher {
    pub fn new(connections: Arc<ConnectionRegistry>, presence: Arc<GroupPresenceIndex>) -> Self {
        Self {
            connections,
            presence,
        }
    }

    /// Returns true if the user had a live connection that accepted the frame.
    pub fn emit_to_user(&self, user_id: &str, event: &ServerEvent) -> bool {
        match self.connections.lookup(user_id) {
            Some(handle) => send_to(&handle, event),
            None => false,
        }
    }

    /// Returns the number of connections reached.
    pub fn emit_to_group_room(&self, room: &Room, event: &ServerEvent) -> usize {
        self.emit(None, Target::Room(room), event)
    }

    pub fn emit_to_all(&self, event: &ServerEvent) -> usize {
        self.emit(None, Target::All, event)
    }

    /// Emit to `target`, skipping the connection `except`.
    pub fn emit_except(
        &self,
        except: &ConnectionHandle,
        target: Target<'_>,
        event: &ServerEvent,
    ) -> usize {
        self.emit(Some(except), target, event)
    }

    fn resolve(&self, target: &Target<'_>) -> Vec<ConnectionHandle> {
        match target {
            Target::User(user_id) => self.connections.lookup(user_id).into_iter().collect(),
            Target::Room(room) => self
                .presence
                .online_members(room.group_id())
                .iter()
                .filter_map(|user_id| self.connections.lookup(user_id))
                .filter(|handle| handle.in_room(room))
                .collect(),
            Target::All => self.connections.handles(),
        }
    }

    fn emit(
        &self,
        except: Option<&ConnectionHandle>,
        target: Target<'_>,
        event: &ServerEvent,
    ) -> usize {
        let handles = self.resolve(&target);
        if handles.is_empty() {
            return 0;
        }
        let Some(msg) = encode(event) else {
            return 0;
        };

        handles
            .iter()
            .filter(|handle| except != Some(*handle))
            .filter(|handle| handle.send(msg.clone()))
            .count()
    }
}
