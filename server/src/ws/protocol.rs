//! JSON event envelope and per-session dispatch.
//!
//! Frames are `{"event": "<kebab-name>", "data": {...}}` with camelCase
//! payload fields. Each session decodes into `ClientEvent` and dispatches
//! through a single match, so no handler can outlive the session's reader loop.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::broadcast::send_to;
use crate::db::models::{
    DirectMessage, GroupId, GroupMessage, GroupSummary, MessageId, MessagePreview, MessageType,
    UserId, UserProfile,
};
use crate::dm;
use crate::error::ChatError;
use crate::groups;
use crate::presence::coordinator::{self, Session};
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    SendDirectMessage {
        #[serde(default)]
        temp_id: String,
        recipient_id: UserId,
        message: String,
        #[serde(default)]
        message_type: MessageType,
    },
    MarkRead {
        sender_id: UserId,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    BlockContact {
        user_id: UserId,
    },
    UnblockContact {
        user_id: UserId,
    },
    AmIBlocked {
        user_id: UserId,
    },
    RequestOnlineUsers,
    RequestGroupOnlineUsers {
        group_ids: Vec<GroupId>,
    },
    RequestGroupOnlineCount {
        group_ids: Vec<GroupId>,
    },
    CreateGroup {
        name: String,
        handle: String,
        description: String,
        #[serde(default)]
        members: BTreeSet<UserId>,
        #[serde(default)]
        is_private: bool,
        #[serde(default)]
        group_icon: Option<String>,
    },
    JoinGroup {
        group_id: GroupId,
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        invited: bool,
        #[serde(default)]
        message: Option<String>,
    },
    LeaveGroup {
        group_id: GroupId,
    },
    RemoveMember {
        group_id: GroupId,
        member_id: UserId,
    },
    RenameMember {
        group_id: GroupId,
        member_id: UserId,
        display_name: String,
    },
    SendGroupMessage {
        group_id: GroupId,
        message: String,
        #[serde(default)]
        message_type: MessageType,
    },
    OpenGroupChat {
        group_id: GroupId,
    },
    CloseGroupChat {
        group_id: GroupId,
    },
    ReadGroupMessages {
        group_id: GroupId,
    },
    ReadGroupMessage {
        message_id: MessageId,
    },
    Logout,
}

impl ClientEvent {
    /// Wire name, echoed back in error events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendDirectMessage { .. } => "send-direct-message",
            Self::MarkRead { .. } => "mark-read",
            Self::DeleteMessage { .. } => "delete-message",
            Self::BlockContact { .. } => "block-contact",
            Self::UnblockContact { .. } => "unblock-contact",
            Self::AmIBlocked { .. } => "am-i-blocked",
            Self::RequestOnlineUsers => "request-online-users",
            Self::RequestGroupOnlineUsers { .. } => "request-group-online-users",
            Self::RequestGroupOnlineCount { .. } => "request-group-online-count",
            Self::CreateGroup { .. } => "create-group",
            Self::JoinGroup { .. } => "join-group",
            Self::LeaveGroup { .. } => "leave-group",
            Self::RemoveMember { .. } => "remove-member",
            Self::RenameMember { .. } => "rename-member",
            Self::SendGroupMessage { .. } => "send-group-message",
            Self::OpenGroupChat { .. } => "open-group-chat",
            Self::CloseGroupChat { .. } => "close-group-chat",
            Self::ReadGroupMessages { .. } => "read-group-messages",
            Self::ReadGroupMessage { .. } => "read-group-message",
            Self::Logout => "logout",
        }
    }
}

/// What changed in a `group-membership-changed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MembershipChange {
    Joined,
    Left,
    Removed,
    Renamed { display_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    OnlineUsers {
        users: BTreeSet<UserId>,
    },
    OnlineGroupUsers {
        group_id: GroupId,
        online_users: BTreeSet<UserId>,
    },
    OnlineGroupUsersLength {
        group_id: GroupId,
        count: usize,
    },
    MessageSent {
        temp_id: String,
        message_id: MessageId,
        is_delivered: bool,
    },
    NewDirectMessage {
        message: DirectMessage,
        sender: UserProfile,
    },
    UndeliveredMessagesUpdated {
        receiver_id: UserId,
        message_ids: Vec<MessageId>,
    },
    MessagesRead {
        reader_id: UserId,
        message_ids: Vec<MessageId>,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    AmIBlocked {
        user_id: UserId,
        blocked: bool,
    },
    NewGroupMessage {
        message: GroupMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<UserProfile>,
    },
    NewGroupNotification {
        group_id: GroupId,
        latest_message: MessagePreview,
    },
    GroupMessagesRead {
        group_id: GroupId,
        reader_id: UserId,
        message_ids: Vec<MessageId>,
    },
    GroupMessageRead {
        group_id: GroupId,
        message_id: MessageId,
        reader_id: UserId,
    },
    GroupMessagesDelivered {
        group_id: GroupId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
    AddedToGroup {
        group: GroupSummary,
        latest_message: MessagePreview,
    },
    GroupCreated {
        group: GroupSummary,
    },
    JoinedGroup {
        group: GroupSummary,
        latest_message: MessagePreview,
        added_by: String,
    },
    GroupMembershipChanged {
        group_id: GroupId,
        member_id: UserId,
        actor_name: String,
        change: MembershipChange,
    },
    RemovedFromGroup {
        group_id: GroupId,
        actor_name: String,
    },
    Error {
        code: u16,
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(err: &ChatError, event: Option<&str>) -> Self {
        Self::Error {
            code: err.code(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            event: event.map(str::to_string),
        }
    }
}

/// Whether the reader loop keeps going after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Logout,
}

/// Handle an incoming text frame: decode, dispatch, report failures to the
/// originating connection only.
pub async fn handle_text_message(text: &str, session: &Session, state: &AppState) -> Flow {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                user_id = %session.user_id(),
                error = %e,
                "Failed to decode client event"
            );
            let err = ChatError::invalid(format!("malformed event: {e}"));
            send_to(&session.handle, &ServerEvent::error(&err, None));
            return Flow::Continue;
        }
    };

    let name = event.name();
    match dispatch(event, session, state).await {
        Ok(flow) => flow,
        Err(err) => {
            tracing::warn!(
                user_id = %session.user_id(),
                event = name,
                error = %err,
                "Client event rejected"
            );
            send_to(&session.handle, &ServerEvent::error(&err, Some(name)));
            Flow::Continue
        }
    }
}

async fn dispatch(event: ClientEvent, session: &Session, state: &AppState) -> Result<Flow, ChatError> {
    match event {
        ClientEvent::SendDirectMessage {
            temp_id,
            recipient_id,
            message,
            message_type,
        } => {
            dm::messages::send_direct_message(
                state,
                session,
                dm::messages::OutgoingDirect {
                    temp_id,
                    recipient_id,
                    message,
                    message_type,
                },
            )
            .await?;
        }
        ClientEvent::MarkRead { sender_id } => {
            dm::messages::mark_read(state, session, &sender_id).await?;
        }
        ClientEvent::DeleteMessage { message_id } => {
            dm::messages::delete_message(state, session, &message_id).await?;
        }
        ClientEvent::BlockContact { user_id } => {
            dm::blocks::block_contact(state, session, &user_id).await?;
        }
        ClientEvent::UnblockContact { user_id } => {
            dm::blocks::unblock_contact(state, session, &user_id).await?;
        }
        ClientEvent::AmIBlocked { user_id } => {
            dm::blocks::am_i_blocked(state, session, &user_id).await?;
        }
        ClientEvent::RequestOnlineUsers => {
            coordinator::send_online_users(state, session);
        }
        ClientEvent::RequestGroupOnlineUsers { group_ids } => {
            coordinator::send_group_online_users(state, session, &group_ids);
        }
        ClientEvent::RequestGroupOnlineCount { group_ids } => {
            coordinator::send_group_online_count(state, session, &group_ids);
        }
        ClientEvent::CreateGroup {
            name,
            handle,
            description,
            members,
            is_private,
            group_icon,
        } => {
            groups::membership::create_group(
                state,
                session,
                groups::membership::GroupDraft {
                    name,
                    handle,
                    description,
                    members,
                    is_private,
                    group_icon,
                },
            )
            .await?;
        }
        ClientEvent::JoinGroup {
            group_id,
            user_id,
            invited,
            message,
        } => {
            groups::membership::join_group(
                state,
                session,
                groups::membership::JoinRequest {
                    group_id,
                    user_id,
                    invited,
                    message,
                },
            )
            .await?;
        }
        ClientEvent::LeaveGroup { group_id } => {
            groups::membership::leave_group(state, session, &group_id).await?;
        }
        ClientEvent::RemoveMember {
            group_id,
            member_id,
        } => {
            groups::membership::remove_member(state, session, &group_id, &member_id).await?;
        }
        ClientEvent::RenameMember {
            group_id,
            member_id,
            display_name,
        } => {
            groups::membership::rename_member(state, session, &group_id, &member_id, &display_name)
                .await?;
        }
        ClientEvent::SendGroupMessage {
            group_id,
            message,
            message_type,
        } => {
            groups::messages::send_group_message(state, session, &group_id, &message, message_type)
                .await?;
        }
        ClientEvent::OpenGroupChat { group_id } => {
            groups::membership::open_group_chat(state, session, &group_id).await?;
        }
        ClientEvent::CloseGroupChat { group_id } => {
            groups::membership::close_group_chat(session, &group_id);
        }
        ClientEvent::ReadGroupMessages { group_id } => {
            groups::messages::read_group_messages(state, session, &group_id).await?;
        }
        ClientEvent::ReadGroupMessage { message_id } => {
            groups::messages::read_group_message(state, session, &message_id).await?;
        }
        ClientEvent::Logout => return Ok(Flow::Logout),
    }
    Ok(Flow::Continue)
}
