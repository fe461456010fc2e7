//! Group message delivery and read tracking.
//!
//! `deliveredTo` starts as the group's online set at send time and `readBy`
//! as the sender. Both only ever grow, through set-add updates in the store.

use std::collections::BTreeSet;

use super::load_group_as_member;
use crate::db::models::{GroupMessage, GroupRecord, MessageId, MessageType, NewGroupMessage, UserId};
use crate::error::ChatError;
use crate::presence::coordinator::Session;
use crate::state::AppState;
use crate::ws::broadcast::{send_to, Target};
use crate::ws::protocol::ServerEvent;
use crate::ws::Room;

pub async fn send_group_message(
    state: &AppState,
    session: &Session,
    group_id: &str,
    message: &str,
    message_type: MessageType,
) -> Result<GroupMessage, ChatError> {
    if message.trim().is_empty() {
        return Err(ChatError::invalid("message is empty"));
    }
    load_group_as_member(state, group_id, session.user_id()).await?;

    let new = NewGroupMessage {
        group_id: group_id.to_string(),
        sender_id: session.user_id().to_string(),
        message: message.to_string(),
        message_type,
        is_notification: false,
        delivered_to: state.presence.online_members(group_id),
        read_by: BTreeSet::from([session.user_id().to_string()]),
    };
    let stored = persist(state, new).await?;

    state.dispatcher.emit_to_group_room(
        &Room::GroupChat(group_id.to_string()),
        &ServerEvent::NewGroupMessage {
            message: stored.clone(),
            sender: Some(session.profile.clone()),
        },
    );
    state.dispatcher.emit_except(
        &session.handle,
        Target::Room(&Room::Group(group_id.to_string())),
        &ServerEvent::NewGroupNotification {
            group_id: group_id.to_string(),
            latest_message: stored.preview(Some(session.username())),
        },
    );
    Ok(stored)
}

/// Persist a system notification in `group` and fan it out. `deliveredTo` is
/// the group's online set at this instant; the actor counts as having read it
/// only while still present in the group.
pub(crate) async fn post_notification(
    state: &AppState,
    actor: &Session,
    group: &GroupRecord,
    sender_id: &str,
    text: String,
) -> Result<GroupMessage, ChatError> {
    let delivered_to = state.presence.online_members(&group.id);
    let read_by = if delivered_to.contains(actor.user_id()) {
        BTreeSet::from([actor.user_id().to_string()])
    } else {
        BTreeSet::new()
    };
    let new = NewGroupMessage {
        group_id: group.id.clone(),
        sender_id: sender_id.to_string(),
        message: text,
        message_type: MessageType::Text,
        is_notification: true,
        delivered_to,
        read_by,
    };
    let stored = persist(state, new).await?;

    state.dispatcher.emit_to_group_room(
        &Room::GroupChat(group.id.clone()),
        &ServerEvent::NewGroupMessage {
            message: stored.clone(),
            sender: None,
        },
    );
    state.dispatcher.emit_except(
        &actor.handle,
        Target::Room(&Room::Group(group.id.clone())),
        &ServerEvent::NewGroupNotification {
            group_id: group.id.clone(),
            latest_message: stored.preview(None),
        },
    );
    Ok(stored)
}

/// Append, then set-add anyone who came online in the group while the write
/// was in flight.
async fn persist(state: &AppState, new: NewGroupMessage) -> Result<GroupMessage, ChatError> {
    let messages = state.messages.clone();
    let mut stored = state
        .blocking(move || messages.append_group_message(&new))
        .await?;

    let late: BTreeSet<UserId> = state
        .presence
        .online_members(&stored.group_id)
        .difference(&stored.delivered_to)
        .cloned()
        .collect();
    if late.is_empty() {
        return Ok(stored);
    }

    let messages = state.messages.clone();
    let (id, users) = (stored.id.clone(), late.clone());
    match state
        .blocking(move || messages.add_group_delivered(&id, &users))
        .await
    {
        Ok(_) => stored.delivered_to.extend(late),
        Err(e) => tracing::warn!(
            message_id = %stored.id,
            error = %e,
            "Late delivery mark failed, leaving message for catch-up"
        ),
    }
    Ok(stored)
}

/// Viewing a conversation: every message in the group the caller has not
/// read yet becomes read. The conversation room hears which ones.
pub async fn read_group_messages(
    state: &AppState,
    session: &Session,
    group_id: &str,
) -> Result<Vec<MessageId>, ChatError> {
    load_group_as_member(state, group_id, session.user_id()).await?;

    let messages = state.messages.clone();
    let (group, reader) = (group_id.to_string(), session.user_id().to_string());
    let read = state
        .blocking(move || {
            let ids = messages.find_unread_group(&group, &reader)?;
            messages.mark_group_read(&reader, &ids)?;
            Ok(ids)
        })
        .await?;

    if read.is_empty() {
        return Ok(read);
    }

    let room = Room::GroupChat(group_id.to_string());
    let event = ServerEvent::GroupMessagesRead {
        group_id: group_id.to_string(),
        reader_id: session.user_id().to_string(),
        message_ids: read.clone(),
    };
    state.dispatcher.emit_to_group_room(&room, &event);
    if !session.handle.in_room(&room) {
        send_to(&session.handle, &event);
    }
    Ok(read)
}

/// Read one message. Returns false if the caller had already read it.
pub async fn read_group_message(
    state: &AppState,
    session: &Session,
    message_id: &str,
) -> Result<bool, ChatError> {
    let messages = state.messages.clone();
    let id = message_id.to_string();
    let message = state
        .blocking(move || messages.get_group_message(&id))
        .await?
        .ok_or_else(|| ChatError::not_found("message"))?;
    load_group_as_member(state, &message.group_id, session.user_id()).await?;

    let messages = state.messages.clone();
    let (id, reader) = (message_id.to_string(), session.user_id().to_string());
    let changed = state
        .blocking(move || messages.mark_group_read(&reader, &[id]))
        .await?
        > 0;

    if changed && message.sender_id != session.user_id() {
        state.dispatcher.emit_to_user(
            &message.sender_id,
            &ServerEvent::GroupMessageRead {
                group_id: message.group_id.clone(),
                message_id: message_id.to_string(),
                reader_id: session.user_id().to_string(),
            },
        );
    }
    Ok(changed)
}
