use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout};

use crate::error::ChatError;
use crate::presence::coordinator;
use crate::state::AppState;
use crate::ws::handler::CLOSE_TOKEN_INVALID;
use crate::ws::protocol::{self, Flow};
use crate::ws::ConnectionHandle;

/// Normal closure after an explicit logout.
pub const CLOSE_NORMAL: u16 = 1000;
/// Keepalive failure.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Directory unavailable during the handshake.
pub const CLOSE_UNAVAILABLE: u16 = 1011;

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames from the connection handle's channel
/// - Ping task: keepalive, closes the connection if pongs stop
/// - Reader loop: decodes client events and dispatches them one at a time
///
/// The handle's channel is the single ordered stream for this connection.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (handle, rx) = ConnectionHandle::channel();
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let session = match coordinator::connect(&state, &user_id, handle.clone()).await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "Connection not admitted");
            let (code, reason) = match err {
                ChatError::Authentication(_) => (CLOSE_TOKEN_INVALID, "Unknown user"),
                _ => (CLOSE_UNAVAILABLE, "Service unavailable"),
            };
            handle.close(code, reason);
            drop(handle);
            let _ = writer_handle.await;
            return;
        }
    };

    tracing::info!(
        user_id = %user_id,
        connection = %session.handle.id(),
        "WebSocket actor started"
    );

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let keepalive_failed = Arc::new(Notify::new());

    let ping_conn = session.handle.clone();
    let ping_failed = keepalive_failed.clone();
    let (ping_interval, pong_timeout) = (state.settings.ping_interval, state.settings.pong_timeout);
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(ping_interval);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if !ping_conn.send(Message::Ping(vec![1, 2, 3, 4].into())) {
                // Writer task has died, connection is gone
                break;
            }

            match timeout(pong_timeout, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!(connection = %ping_conn.id(), "Pong timeout, closing connection");
                    ping_conn.close(CLOSE_GOING_AWAY, "Pong timeout");
                    ping_failed.notify_one();
                    break;
                }
            }
        }
    });

    let mut flow = Flow::Continue;
    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = keepalive_failed.notified() => break,
        };
        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    flow = protocol::handle_text_message(text.as_str(), &session, &state).await;
                    if flow == Flow::Logout {
                        break;
                    }
                }
                Message::Binary(data) => {
                    tracing::debug!(
                        user_id = %user_id,
                        bytes = data.len(),
                        "Ignoring binary frame"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    session.handle.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(user_id = %user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    ping_handle.abort();
    coordinator::disconnect(&state, &session).await;

    if flow == Flow::Logout {
        session.handle.close(CLOSE_NORMAL, "Logged out");
        drop(session);
        drop(handle);
        let _ = timeout(pong_timeout, writer_handle).await;
    } else {
        writer_handle.abort();
    }

    tracing::info!(user_id = %user_id, "WebSocket actor stopped");
}

/// Writer task: receives frames from the channel and forwards them to the
/// WebSocket sink. Stops after a close frame.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
