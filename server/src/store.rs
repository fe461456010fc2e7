//! Narrow interfaces to the collaborators the realtime core consumes.
//!
//! Implementations are synchronous; callers run them on the blocking pool
//! through `AppState::blocking`, which also applies the store deadline.
//! Every mutation is a set-style update, so replaying one is harmless.

use std::collections::BTreeSet;

use crate::db::models::{
    DirectMessage, GroupId, GroupMessage, GroupRecord, MessageId, NewDirectMessage, NewGroup,
    NewGroupMessage, UserId, UserRecord,
};
use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

pub trait UserDirectory: Send + Sync {
    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserRecord>>;

    /// Whether `blocker` has blocked `candidate`.
    fn is_blocked(&self, blocker: &str, candidate: &str) -> StoreResult<bool>;

    /// Returns true if the block set changed.
    fn block(&self, blocker: &str, target: &str) -> StoreResult<bool>;

    fn unblock(&self, blocker: &str, target: &str) -> StoreResult<bool>;
}

pub trait GroupDirectory: Send + Sync {
    fn get_group(&self, group_id: &str) -> StoreResult<Option<GroupRecord>>;

    fn find_group_by_handle(&self, handle: &str) -> StoreResult<Option<GroupId>>;

    /// Creates the group with every listed member and the creator as sole admin.
    fn create_group(&self, group: &NewGroup) -> StoreResult<GroupRecord>;

    fn add_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool>;

    /// Removes the member together with any admin entry and display name.
    fn remove_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool>;

    fn set_display_name(&self, group_id: &str, user_id: &str, display_name: &str)
        -> StoreResult<()>;

    fn is_admin(&self, group_id: &str, user_id: &str) -> StoreResult<bool> {
        Ok(self
            .get_group(group_id)?
            .is_some_and(|group| group.admins.contains(user_id)))
    }

    fn is_private(&self, group_id: &str) -> StoreResult<Option<bool>> {
        Ok(self.get_group(group_id)?.map(|group| group.is_private))
    }
}

pub trait MessageStore: Send + Sync {
    fn append_direct_message(&self, message: &NewDirectMessage) -> StoreResult<DirectMessage>;

    fn get_direct_message(&self, message_id: &str) -> StoreResult<Option<DirectMessage>>;

    /// Not-yet-delivered, not-blocked messages addressed to `recipient`, as
    /// `(sender, message)` pairs in send order.
    fn find_undelivered_direct(&self, recipient: &str) -> StoreResult<Vec<(UserId, MessageId)>>;

    /// Flips `isDelivered` on the given non-blocked messages. Returns the
    /// number that changed.
    fn mark_direct_delivered(&self, message_ids: &[MessageId]) -> StoreResult<usize>;

    fn find_unread_direct(&self, sender: &str, reader: &str) -> StoreResult<Vec<MessageId>>;

    /// Flips `isRead` (and `isDelivered`) on the given non-blocked messages.
    fn mark_direct_read(&self, message_ids: &[MessageId]) -> StoreResult<usize>;

    fn delete_direct_message(&self, message_id: &str) -> StoreResult<bool>;

    fn append_group_message(&self, message: &NewGroupMessage) -> StoreResult<GroupMessage>;

    fn get_group_message(&self, message_id: &str) -> StoreResult<Option<GroupMessage>>;

    /// Messages in `groups` whose deliveredTo set lacks `user_id`.
    fn find_undelivered_group(
        &self,
        user_id: &str,
        groups: &[GroupId],
    ) -> StoreResult<Vec<(GroupId, MessageId)>>;

    fn add_group_delivered(
        &self,
        message_id: &str,
        users: &BTreeSet<UserId>,
    ) -> StoreResult<usize>;

    fn mark_group_delivered(&self, user_id: &str, message_ids: &[MessageId]) -> StoreResult<usize>;

    fn find_unread_group(&self, group_id: &str, user_id: &str) -> StoreResult<Vec<MessageId>>;

    /// Adds `user_id` to readBy (and deliveredTo) of each message.
    fn mark_group_read(&self, user_id: &str, message_ids: &[MessageId]) -> StoreResult<usize>;
}
