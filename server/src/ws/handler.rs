use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::error::AuthError;
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection.
/// Auth is via query param ?token=JWT.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// WebSocket close codes:
/// 4001 = token expired
/// 4002 = token invalid or user unknown
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
pub const CLOSE_TOKEN_INVALID: u16 = 4002;

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint. Authenticates via query parameter.
/// On auth failure, upgrades then immediately closes with the matching close
/// code; no registry state is touched. On success, spawns an actor for the
/// connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.verifier.verify(&params.token) {
        Ok(user_id) => {
            tracing::info!(user_id = %user_id, "WebSocket connection authenticated");
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, user_id))
        }
        Err(err) => {
            let (close_code, reason) = match err {
                AuthError::Expired => (CLOSE_TOKEN_EXPIRED, "Token expired"),
                AuthError::Invalid | AuthError::UnknownUser(_) => {
                    (CLOSE_TOKEN_INVALID, "Token invalid")
                }
            };

            tracing::warn!(
                close_code = close_code,
                reason = reason,
                "WebSocket auth failed"
            );

            ws.on_upgrade(move |mut socket| async move {
                let close_frame = CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                };
                let _ = socket.send(Message::Close(Some(close_frame))).await;
            })
        }
    }
}
