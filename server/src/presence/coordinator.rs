//! Connect/disconnect lifecycle.
//!
//! Registry and index updates for one user run under that user's lifecycle
//! lock; the lock is released before any presence fan-out.

use std::collections::BTreeMap;

use super::GroupPresence;
use crate::db::models::{GroupId, MessageId, UserId, UserProfile};
use crate::error::{AuthError, ChatError};
use crate::state::AppState;
use crate::ws::broadcast::send_to;
use crate::ws::protocol::ServerEvent;
use crate::ws::{ConnectionHandle, Room};

/// An admitted connection: who it belongs to and where its frames go.
#[derive(Debug, Clone)]
pub struct Session {
    pub profile: UserProfile,
    pub handle: ConnectionHandle,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.profile.id
    }

    pub fn username(&self) -> &str {
        &self.profile.username
    }
}

/// Authenticating -> Online. Registers `handle`, joins every group the
/// directory lists, announces, then runs the catch-up sweep.
pub async fn connect(
    state: &AppState,
    user_id: &str,
    handle: ConnectionHandle,
) -> Result<Session, ChatError> {
    let guard = state.lifecycle.lock(user_id).await;

    let users = state.users.clone();
    let uid = user_id.to_string();
    let user = state
        .blocking(move || users.get_user(&uid))
        .await?
        .ok_or_else(|| AuthError::UnknownUser(user_id.to_string()))?;

    if let Some(previous) = state.connections.register(user_id, handle.clone()) {
        tracing::info!(
            user_id = %user_id,
            previous = %previous.id(),
            "Earlier session superseded"
        );
    }

    let group_ids: Vec<GroupId> = user.groups.iter().cloned().collect();
    for group_id in &group_ids {
        handle.join_room(Room::Group(group_id.clone()));
    }
    let snapshots = state.presence.add_to_groups(user_id, &group_ids);
    drop(guard);

    tracing::info!(
        user_id = %user_id,
        connection = %handle.id(),
        groups = group_ids.len(),
        "User online"
    );

    for snapshot in &snapshots {
        announce_group(state, snapshot);
    }
    broadcast_online_users(state);

    if let Err(e) = catch_up(state, user_id, &group_ids).await {
        tracing::warn!(user_id = %user_id, error = %e, "Catch-up sweep failed");
    }

    Ok(Session {
        profile: user.profile(),
        handle,
    })
}

/// Online -> Disconnected. Idempotent: a second call, or a call for a session
/// that has already been superseded, changes nothing and returns false.
pub async fn disconnect(state: &AppState, session: &Session) -> bool {
    let user_id = session.user_id();
    let guard = state.lifecycle.lock(user_id).await;

    session.handle.clear_rooms();
    if !state.connections.unregister(user_id, &session.handle) {
        tracing::debug!(user_id = %user_id, "Stale disconnect ignored");
        return false;
    }
    let snapshots = state.presence.remove_from_all(user_id);
    drop(guard);

    tracing::info!(
        user_id = %user_id,
        connection = %session.handle.id(),
        "User offline"
    );

    for snapshot in &snapshots {
        announce_group(state, snapshot);
    }
    broadcast_online_users(state);
    true
}

/// Put an online user into one group's presence set and room. Call with the
/// user's lifecycle lock held. Returns None if the user is offline.
pub fn attach_to_group(state: &AppState, group_id: &str, user_id: &str) -> Option<ConnectionHandle> {
    let handle = state.connections.lookup(user_id)?;
    handle.join_room(Room::Group(group_id.to_string()));
    state.presence.add_member(group_id, user_id);
    Some(handle)
}

/// Inverse of `attach_to_group`. The connection stays open.
pub fn detach_from_group(state: &AppState, group_id: &str, user_id: &str) -> Option<ConnectionHandle> {
    state.presence.remove_member(group_id, user_id);
    let handle = state.connections.lookup(user_id)?;
    handle.leave_group_rooms(group_id);
    Some(handle)
}

/// Group-presence delta: the member list to the group's room, the count to
/// everyone.
pub fn announce_group(state: &AppState, snapshot: &GroupPresence) {
    state.dispatcher.emit_to_group_room(
        &Room::Group(snapshot.group_id.clone()),
        &ServerEvent::OnlineGroupUsers {
            group_id: snapshot.group_id.clone(),
            online_users: snapshot.online.clone(),
        },
    );
    state.dispatcher.emit_to_all(&ServerEvent::OnlineGroupUsersLength {
        group_id: snapshot.group_id.clone(),
        count: snapshot.count(),
    });
}

pub fn announce_group_by_id(state: &AppState, group_id: &str) {
    announce_group(state, &state.presence.snapshot(group_id));
}

fn broadcast_online_users(state: &AppState) {
    state.dispatcher.emit_to_all(&ServerEvent::OnlineUsers {
        users: state.connections.list_online(),
    });
}

pub fn send_online_users(state: &AppState, session: &Session) {
    send_to(
        &session.handle,
        &ServerEvent::OnlineUsers {
            users: state.connections.list_online(),
        },
    );
}

pub fn send_group_online_users(state: &AppState, session: &Session, group_ids: &[GroupId]) {
    for group_id in group_ids.iter().filter(|g| state.presence.has_group(g)) {
        send_to(
            &session.handle,
            &ServerEvent::OnlineGroupUsers {
                group_id: group_id.clone(),
                online_users: state.presence.online_members(group_id),
            },
        );
    }
}

pub fn send_group_online_count(state: &AppState, session: &Session, group_ids: &[GroupId]) {
    for group_id in group_ids.iter().filter(|g| state.presence.has_group(g)) {
        let (count, _) = state.presence.online_count_and_members(group_id);
        send_to(
            &session.handle,
            &ServerEvent::OnlineGroupUsersLength {
                group_id: group_id.clone(),
                count,
            },
        );
    }
}

/// Mark everything addressed to `user_id` while offline as delivered and tell
/// the senders (direct) and open conversations (group).
async fn catch_up(state: &AppState, user_id: &str, group_ids: &[GroupId]) -> Result<(), ChatError> {
    let messages = state.messages.clone();
    let uid = user_id.to_string();
    let groups = group_ids.to_vec();
    let (direct, group) = state
        .blocking(move || {
            let direct = messages.find_undelivered_direct(&uid)?;
            let ids: Vec<MessageId> = direct.iter().map(|(_, id)| id.clone()).collect();
            messages.mark_direct_delivered(&ids)?;

            let group = messages.find_undelivered_group(&uid, &groups)?;
            let ids: Vec<MessageId> = group.iter().map(|(_, id)| id.clone()).collect();
            messages.mark_group_delivered(&uid, &ids)?;
            Ok((direct, group))
        })
        .await?;

    if direct.is_empty() && group.is_empty() {
        return Ok(());
    }
    tracing::debug!(
        user_id = %user_id,
        direct = direct.len(),
        group = group.len(),
        "Catch-up sweep delivered messages"
    );

    for (sender_id, message_ids) in group_by_key(direct) {
        state.dispatcher.emit_to_user(
            &sender_id,
            &ServerEvent::UndeliveredMessagesUpdated {
                receiver_id: user_id.to_string(),
                message_ids,
            },
        );
    }
    for (group_id, message_ids) in group_by_key(group) {
        state.dispatcher.emit_to_group_room(
            &Room::GroupChat(group_id.clone()),
            &ServerEvent::GroupMessagesDelivered {
                group_id,
                user_id: user_id.to_string(),
                message_ids,
            },
        );
    }
    Ok(())
}

fn group_by_key(pairs: Vec<(UserId, MessageId)>) -> BTreeMap<String, Vec<MessageId>> {
    let mut out: BTreeMap<String, Vec<MessageId>> = BTreeMap::new();
    for (key, id) in pairs {
        out.entry(key).or_default().push(id);
    }
    out
}
