//! Direct-message delivery and read tracking.
//!
//! Send order is: block gate, presence check, persist, converge, fan out,
//! acknowledge. Nothing is announced to either party until the store has
//! accepted the write.

use crate::db::models::{DirectMessage, MessageId, MessageType, NewDirectMessage, UserId};
use crate::error::ChatError;
use crate::presence::coordinator::Session;
use crate::state::AppState;
use crate::ws::broadcast::send_to;
use crate::ws::protocol::ServerEvent;

/// A direct message as submitted by its sender.
#[derive(Debug, Clone)]
pub struct OutgoingDirect {
    /// Client-side correlation id, echoed in `message-sent`.
    pub temp_id: String,
    pub recipient_id: UserId,
    pub message: String,
    pub message_type: MessageType,
}

pub async fn send_direct_message(
    state: &AppState,
    session: &Session,
    outgoing: OutgoingDirect,
) -> Result<DirectMessage, ChatError> {
    let sender_id = session.user_id().to_string();
    if outgoing.recipient_id == sender_id {
        return Err(ChatError::invalid("cannot send a direct message to yourself"));
    }
    if outgoing.message.trim().is_empty() {
        return Err(ChatError::invalid("message is empty"));
    }

    let users = state.users.clone();
    let (recipient, sender) = (outgoing.recipient_id.clone(), sender_id.clone());
    let is_blocked = state
        .blocking(move || match users.get_user(&recipient)? {
            Some(record) => Ok(Some(record.blocked.contains(&sender))),
            None => Ok(None),
        })
        .await?
        .ok_or_else(|| ChatError::not_found("recipient"))?;

    let recipient_id = outgoing.recipient_id;
    let new = NewDirectMessage {
        sender_id: sender_id.clone(),
        receiver_id: recipient_id.clone(),
        message: outgoing.message,
        message_type: outgoing.message_type,
        is_delivered: !is_blocked && state.connections.is_online(&recipient_id),
        is_blocked,
    };
    let messages = state.messages.clone();
    let mut stored = state
        .blocking(move || messages.append_direct_message(&new))
        .await?;

    // The recipient may have connected, and run its catch-up sweep, while
    // the write was in flight.
    if !stored.is_blocked && !stored.is_delivered && state.connections.is_online(&recipient_id) {
        let messages = state.messages.clone();
        let id = stored.id.clone();
        match state
            .blocking(move || messages.mark_direct_delivered(&[id]))
            .await
        {
            Ok(_) => stored.is_delivered = true,
            Err(e) => tracing::warn!(
                message_id = %stored.id,
                error = %e,
                "Late delivery mark failed, leaving message for catch-up"
            ),
        }
    }

    if stored.is_delivered {
        state.dispatcher.emit_to_user(
            &recipient_id,
            &ServerEvent::NewDirectMessage {
                message: stored.clone(),
                sender: session.profile.clone(),
            },
        );
    }

    tracing::debug!(
        sender_id = %sender_id,
        recipient_id = %recipient_id,
        message_id = %stored.id,
        delivered = stored.is_delivered,
        blocked = stored.is_blocked,
        "Direct message stored"
    );

    send_to(
        &session.handle,
        &ServerEvent::MessageSent {
            temp_id: outgoing.temp_id,
            message_id: stored.id.clone(),
            is_delivered: stored.is_delivered,
        },
    );
    Ok(stored)
}

/// Flip every unread message `sender_id` sent to the caller to read and tell
/// the sender which ones changed. Nothing is reported to a sender who has
/// blocked the reader.
pub async fn mark_read(
    state: &AppState,
    session: &Session,
    sender_id: &str,
) -> Result<Vec<MessageId>, ChatError> {
    let reader_id = session.user_id().to_string();
    if sender_id == reader_id {
        return Err(ChatError::invalid("cannot mark your own messages as read"));
    }

    let users = state.users.clone();
    let messages = state.messages.clone();
    let (sender, reader) = (sender_id.to_string(), reader_id.clone());
    let read = state
        .blocking(move || {
            if users.is_blocked(&sender, &reader)? {
                return Ok(Vec::new());
            }
            let ids = messages.find_unread_direct(&sender, &reader)?;
            messages.mark_direct_read(&ids)?;
            Ok(ids)
        })
        .await?;

    if !read.is_empty() {
        state.dispatcher.emit_to_user(
            sender_id,
            &ServerEvent::MessagesRead {
                reader_id,
                message_ids: read.clone(),
            },
        );
    }
    Ok(read)
}

/// Soft-delete a message the caller sent. Deleting twice is a no-op.
pub async fn delete_message(
    state: &AppState,
    session: &Session,
    message_id: &str,
) -> Result<(), ChatError> {
    let messages = state.messages.clone();
    let id = message_id.to_string();
    let message = state
        .blocking(move || messages.get_direct_message(&id))
        .await?
        .ok_or_else(|| ChatError::not_found("message"))?;

    if message.sender_id != session.user_id() {
        return Err(ChatError::forbidden("Only the sender can delete a message."));
    }

    let messages = state.messages.clone();
    let id = message_id.to_string();
    if !state
        .blocking(move || messages.delete_direct_message(&id))
        .await?
    {
        return Ok(());
    }

    let event = ServerEvent::MessageDeleted {
        message_id: message_id.to_string(),
    };
    if !message.is_blocked {
        state.dispatcher.emit_to_user(&message.receiver_id, &event);
    }
    send_to(&session.handle, &event);
    Ok(())
}
