pub mod membership;
pub mod messages;

use crate::db::models::GroupRecord;
use crate::error::ChatError;
use crate::state::AppState;

/// Fresh directory read of a group. Never cached across operations.
pub(crate) async fn load_group(state: &AppState, group_id: &str) -> Result<GroupRecord, ChatError> {
    let groups = state.groups.clone();
    let id = group_id.to_string();
    state
        .blocking(move || groups.get_group(&id))
        .await?
        .ok_or_else(|| ChatError::not_found("group"))
}

/// Like `load_group`, but the caller must currently be a member.
pub(crate) async fn load_group_as_member(
    state: &AppState,
    group_id: &str,
    user_id: &str,
) -> Result<GroupRecord, ChatError> {
    let group = load_group(state, group_id).await?;
    if !group.is_member(user_id) {
        return Err(ChatError::forbidden("You are not a member of this group."));
    }
    Ok(group)
}
