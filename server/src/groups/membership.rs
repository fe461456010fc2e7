//! Membership synchronizer.
//!
//! Every change writes the group directory first, then updates presence under
//! the affected user's lifecycle lock, then notifies. A change that affects
//! another member needs the actor to be an admin or the creator.

use std::collections::BTreeSet;

use super::messages::post_notification;
use super::{load_group, load_group_as_member};
use crate::db::models::{GroupRecord, NewGroup, UserId, UserRecord};
use crate::error::ChatError;
use crate::presence::coordinator::{self, Session};
use crate::state::AppState;
use crate::ws::broadcast::send_to;
use crate::ws::protocol::{MembershipChange, ServerEvent};
use crate::ws::Room;

#[derive(Debug, Clone)]
pub struct GroupDraft {
    pub name: String,
    pub handle: String,
    pub description: String,
    /// Invitees. The creator is added regardless.
    pub members: BTreeSet<UserId>,
    pub is_private: bool,
    pub group_icon: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub group_id: String,
    /// Member to add; the caller when absent.
    pub user_id: Option<UserId>,
    /// Self-join through an invitation, allowed into private groups.
    pub invited: bool,
    /// Custom notification text.
    pub message: Option<String>,
}

pub async fn create_group(
    state: &AppState,
    session: &Session,
    draft: GroupDraft,
) -> Result<GroupRecord, ChatError> {
    let name = draft.name.trim().to_string();
    let handle = draft.handle.trim().to_string();
    let description = draft.description.trim().to_string();
    if name.is_empty() || handle.is_empty() || description.is_empty() {
        return Err(ChatError::invalid("All fields are required"));
    }

    let creator = session.user_id().to_string();
    let users = state.users.clone();
    let groups = state.groups.clone();
    let invitees = draft.members;
    let new = NewGroup {
        name,
        handle,
        description,
        created_by: creator.clone(),
        members: BTreeSet::new(),
        is_private: draft.is_private,
        group_icon: draft.group_icon,
    };
    let group = state
        .blocking(move || {
            if groups.find_group_by_handle(&new.handle)?.is_some() {
                return Ok(None);
            }
            let mut new = new;
            for invitee in invitees {
                if users.get_user(&invitee)?.is_some() {
                    new.members.insert(invitee);
                }
            }
            new.members.insert(new.created_by.clone());
            groups.create_group(&new).map(Some)
        })
        .await?
        .ok_or_else(|| ChatError::invalid("Group already exists"))?;

    let mut online_invitees = Vec::new();
    for member in &group.members {
        let _guard = state.lifecycle.lock(member).await;
        if coordinator::attach_to_group(state, &group.id, member).is_some() && *member != creator {
            online_invitees.push(member.clone());
        }
    }

    tracing::info!(
        user_id = %creator,
        group_id = %group.id,
        members = group.members.len(),
        online = online_invitees.len() + 1,
        "Group created"
    );

    let notification = post_notification(
        state,
        session,
        &group,
        &creator,
        format!("{} created the group!", session.username()),
    )
    .await?;

    let latest_message = notification.preview(None);
    for invitee in &online_invitees {
        state.dispatcher.emit_to_user(
            invitee,
            &ServerEvent::AddedToGroup {
                group: group.summary(),
                latest_message: latest_message.clone(),
            },
        );
    }
    send_to(
        &session.handle,
        &ServerEvent::GroupCreated {
            group: group.summary(),
        },
    );
    coordinator::announce_group_by_id(state, &group.id);
    Ok(group)
}

pub async fn join_group(
    state: &AppState,
    session: &Session,
    request: JoinRequest,
) -> Result<(), ChatError> {
    let actor = session.user_id();
    let target = request.user_id.unwrap_or_else(|| actor.to_string());
    let group = load_group(state, &request.group_id).await?;

    if group.is_member(&target) {
        return Err(ChatError::invalid("Already a member of this group"));
    }
    let target_name = if target == actor {
        if group.is_private && !request.invited {
            return Err(ChatError::forbidden("This group is private"));
        }
        session.username().to_string()
    } else {
        if !group.can_manage(actor) {
            return Err(ChatError::forbidden(
                "You do not have permission to add members.",
            ));
        }
        load_user(state, &target).await?.username
    };

    {
        let _guard = state.lifecycle.lock(&target).await;
        let groups = state.groups.clone();
        let (g, u) = (group.id.clone(), target.clone());
        state.blocking(move || groups.add_member(&g, &u)).await?;
        coordinator::attach_to_group(state, &group.id, &target);
    }

    tracing::info!(
        user_id = %target,
        group_id = %group.id,
        added_by = %actor,
        "Member joined group"
    );

    let text = request.message.unwrap_or_else(|| {
        if target == actor {
            format!("{target_name} joined the group")
        } else {
            format!("{} added {target_name}", session.username())
        }
    });
    let notification = post_notification(state, session, &group, &target, text).await?;

    state.dispatcher.emit_to_group_room(
        &Room::Group(group.id.clone()),
        &ServerEvent::GroupMembershipChanged {
            group_id: group.id.clone(),
            member_id: target.clone(),
            actor_name: session.username().to_string(),
            change: MembershipChange::Joined,
        },
    );
    state.dispatcher.emit_to_user(
        &target,
        &ServerEvent::JoinedGroup {
            group: group.summary(),
            latest_message: notification.preview(None),
            added_by: session.username().to_string(),
        },
    );
    coordinator::announce_group_by_id(state, &group.id);
    Ok(())
}

/// Self-leave. Needs no authorization beyond membership.
pub async fn leave_group(state: &AppState, session: &Session, group_id: &str) -> Result<(), ChatError> {
    let user_id = session.user_id().to_string();
    let group = load_group_as_member(state, group_id, &user_id).await?;

    {
        let _guard = state.lifecycle.lock(&user_id).await;
        let groups = state.groups.clone();
        let (g, u) = (group.id.clone(), user_id.clone());
        state.blocking(move || groups.remove_member(&g, &u)).await?;
        coordinator::detach_from_group(state, &group.id, &user_id);
    }

    tracing::info!(user_id = %user_id, group_id = %group.id, "Member left group");

    let name = group.display_name(&user_id, session.username()).to_string();
    post_notification(
        state,
        session,
        &group,
        &user_id,
        format!("{name} left the group"),
    )
    .await?;

    let event = ServerEvent::GroupMembershipChanged {
        group_id: group.id.clone(),
        member_id: user_id,
        actor_name: session.username().to_string(),
        change: MembershipChange::Left,
    };
    state
        .dispatcher
        .emit_to_group_room(&Room::Group(group.id.clone()), &event);
    send_to(&session.handle, &event);
    coordinator::announce_group_by_id(state, &group.id);
    Ok(())
}

/// Evict another member. The evicted connection leaves the group's rooms but
/// stays open.
pub async fn remove_member(
    state: &AppState,
    session: &Session,
    group_id: &str,
    member_id: &str,
) -> Result<(), ChatError> {
    let actor = session.user_id();
    if member_id == actor {
        return Err(ChatError::invalid("Use leave-group to leave a group"));
    }
    let group = load_group(state, group_id).await?;
    if !group.can_manage(actor) {
        return Err(ChatError::forbidden(
            "You do not have permission to remove members.",
        ));
    }
    if !group.is_member(member_id) {
        return Err(ChatError::not_found("member"));
    }
    if group.created_by == member_id {
        return Err(ChatError::forbidden("The group creator cannot be removed."));
    }
    let member = load_user(state, member_id).await?;

    let evicted = {
        let _guard = state.lifecycle.lock(member_id).await;
        let groups = state.groups.clone();
        let (g, u) = (group.id.clone(), member_id.to_string());
        state.blocking(move || groups.remove_member(&g, &u)).await?;
        coordinator::detach_from_group(state, &group.id, member_id)
    };

    tracing::info!(
        user_id = %member_id,
        group_id = %group.id,
        removed_by = %actor,
        online = evicted.is_some(),
        "Member removed from group"
    );

    if let Some(handle) = &evicted {
        send_to(
            handle,
            &ServerEvent::RemovedFromGroup {
                group_id: group.id.clone(),
                actor_name: session.username().to_string(),
            },
        );
    }

    let name = group.display_name(member_id, &member.username).to_string();
    post_notification(
        state,
        session,
        &group,
        actor,
        format!("{} has removed {name} from the group.", session.username()),
    )
    .await?;

    state.dispatcher.emit_to_group_room(
        &Room::Group(group.id.clone()),
        &ServerEvent::GroupMembershipChanged {
            group_id: group.id.clone(),
            member_id: member_id.to_string(),
            actor_name: session.username().to_string(),
            change: MembershipChange::Removed,
        },
    );
    coordinator::announce_group_by_id(state, &group.id);
    Ok(())
}

/// Set a member's per-group display name. Renaming someone else needs admin
/// or creator rights.
pub async fn rename_member(
    state: &AppState,
    session: &Session,
    group_id: &str,
    member_id: &str,
    display_name: &str,
) -> Result<(), ChatError> {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(ChatError::invalid("display name is empty"));
    }
    let actor = session.user_id();
    let group = load_group_as_member(state, group_id, actor).await?;
    if member_id != actor && !group.can_manage(actor) {
        return Err(ChatError::forbidden(
            "You do not have permission to rename members.",
        ));
    }
    if !group.is_member(member_id) {
        return Err(ChatError::not_found("member"));
    }
    let member = load_user(state, member_id).await?;

    let groups = state.groups.clone();
    let (g, u, n) = (group.id.clone(), member_id.to_string(), display_name.to_string());
    state
        .blocking(move || groups.set_display_name(&g, &u, &n))
        .await?;

    let previous = group.display_name(member_id, &member.username).to_string();
    post_notification(
        state,
        session,
        &group,
        actor,
        format!("{} renamed {previous} to {display_name}", session.username()),
    )
    .await?;

    state.dispatcher.emit_to_group_room(
        &Room::Group(group.id.clone()),
        &ServerEvent::GroupMembershipChanged {
            group_id: group.id.clone(),
            member_id: member_id.to_string(),
            actor_name: session.username().to_string(),
            change: MembershipChange::Renamed {
                display_name: display_name.to_string(),
            },
        },
    );
    Ok(())
}

/// Subscribe to the group's full message stream.
pub async fn open_group_chat(
    state: &AppState,
    session: &Session,
    group_id: &str,
) -> Result<(), ChatError> {
    load_group_as_member(state, group_id, session.user_id()).await?;
    session.handle.join_room(Room::GroupChat(group_id.to_string()));
    Ok(())
}

pub fn close_group_chat(session: &Session, group_id: &str) {
    session
        .handle
        .leave_room(&Room::GroupChat(group_id.to_string()));
}

async fn load_user(state: &AppState, user_id: &str) -> Result<UserRecord, ChatError> {
    let users = state.users.clone();
    let id = user_id.to_string();
    state
        .blocking(move || users.get_user(&id))
        .await?
        .ok_or_else(|| ChatError::not_found("user"))
}
