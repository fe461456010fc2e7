/// Record types shared by the stores, the delivery tracker and the wire protocol.
/// Set-valued fields are ordered sets so membership checks are explicit and
/// serialized output is stable.
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type GroupId = String;
pub type MessageId = String;

/// Closed set of message kinds accepted by the message store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Directory view of a user: profile plus authoritative group and block sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
    pub groups: BTreeSet<GroupId>,
    /// Users this user has blocked.
    pub blocked: BTreeSet<UserId>,
}

impl UserRecord {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            username: self.username.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

/// Public profile attached to live events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    pub handle: String,
    pub description: String,
    pub created_by: UserId,
    pub is_private: bool,
    pub group_icon: Option<String>,
    pub members: BTreeSet<UserId>,
    pub admins: BTreeSet<UserId>,
    /// Per-group display names, kept apart from the admin set.
    pub display_names: BTreeMap<UserId, String>,
}

impl GroupRecord {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    /// Admins and the creator may act on other members, but only while they
    /// are still members themselves.
    pub fn can_manage(&self, user_id: &str) -> bool {
        self.is_member(user_id) && (self.created_by == user_id || self.admins.contains(user_id))
    }

    pub fn display_name<'a>(&'a self, user_id: &str, fallback: &'a str) -> &'a str {
        self.display_names
            .get(user_id)
            .map(String::as_str)
            .unwrap_or(fallback)
    }

    pub fn summary(&self) -> GroupSummary {
        GroupSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            handle: self.handle.clone(),
            group_icon: self.group_icon.clone(),
            is_private: self.is_private,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub handle: String,
    pub group_icon: Option<String>,
    pub is_private: bool,
}

/// Input for `GroupDirectory::create_group`. `members` includes the creator.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub handle: String,
    pub description: String,
    pub created_by: UserId,
    pub members: BTreeSet<UserId>,
    pub is_private: bool,
    pub group_icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
    pub message_type: MessageType,
    pub is_read: bool,
    pub is_delivered: bool,
    pub is_blocked: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Delivery decision attached to a direct message before it is persisted.
#[derive(Debug, Clone)]
pub struct NewDirectMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
    pub message_type: MessageType,
    pub is_delivered: bool,
    pub is_blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessage {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub message: String,
    pub message_type: MessageType,
    pub is_notification: bool,
    pub delivered_to: BTreeSet<UserId>,
    pub read_by: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

impl GroupMessage {
    pub fn preview(&self, sender_name: Option<&str>) -> MessagePreview {
        MessagePreview {
            id: self.id.clone(),
            message: self.message.clone(),
            message_type: self.message_type,
            is_notification: self.is_notification,
            sender_id: self.sender_id.clone(),
            sender_name: sender_name.map(str::to_string),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewGroupMessage {
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub message: String,
    pub message_type: MessageType,
    pub is_notification: bool,
    pub delivered_to: BTreeSet<UserId>,
    pub read_by: BTreeSet<UserId>,
}

/// Latest-message summary shown in group lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub id: MessageId,
    pub message: String,
    pub message_type: MessageType,
    pub is_notification: bool,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub created_at: DateTime<Utc>,
}
