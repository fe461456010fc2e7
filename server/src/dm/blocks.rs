//! Contact blocking. The block set lives in the user directory; the live
//! delivery gate in `dm::messages` rereads it on every send.

use crate::error::ChatError;
use crate::presence::coordinator::Session;
use crate::state::AppState;
use crate::ws::broadcast::send_to;
use crate::ws::protocol::ServerEvent;

pub async fn block_contact(
    state: &AppState,
    session: &Session,
    user_id: &str,
) -> Result<bool, ChatError> {
    set_blocked(state, session, user_id, true).await
}

pub async fn unblock_contact(
    state: &AppState,
    session: &Session,
    user_id: &str,
) -> Result<bool, ChatError> {
    set_blocked(state, session, user_id, false).await
}

/// Returns whether the block set changed. The target hears about the current
/// state either way.
async fn set_blocked(
    state: &AppState,
    session: &Session,
    target: &str,
    blocked: bool,
) -> Result<bool, ChatError> {
    let blocker = session.user_id().to_string();
    if target == blocker {
        return Err(ChatError::invalid("cannot block yourself"));
    }

    let users = state.users.clone();
    let (me, other) = (blocker.clone(), target.to_string());
    let changed = state
        .blocking(move || {
            if users.get_user(&other)?.is_none() {
                return Ok(None);
            }
            let changed = if blocked {
                users.block(&me, &other)?
            } else {
                users.unblock(&me, &other)?
            };
            Ok(Some(changed))
        })
        .await?
        .ok_or_else(|| ChatError::not_found("user"))?;

    tracing::info!(
        user_id = %blocker,
        target = %target,
        blocked,
        changed,
        "Block state updated"
    );

    state.dispatcher.emit_to_user(
        target,
        &ServerEvent::AmIBlocked {
            user_id: blocker,
            blocked,
        },
    );
    Ok(changed)
}

/// Answer whether `user_id` has blocked the caller.
pub async fn am_i_blocked(
    state: &AppState,
    session: &Session,
    user_id: &str,
) -> Result<bool, ChatError> {
    let users = state.users.clone();
    let (other, me) = (user_id.to_string(), session.user_id().to_string());
    let blocked = state
        .blocking(move || users.is_blocked(&other, &me))
        .await?;

    send_to(
        &session.handle,
        &ServerEvent::AmIBlocked {
            user_id: user_id.to_string(),
            blocked,
        },
    );
    Ok(blocked)
}
