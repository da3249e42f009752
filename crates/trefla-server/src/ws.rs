//! Real-time channel: one WebSocket per connected user.
//!
//! Events queued for the session are forwarded as JSON text frames.  The
//! session id is stored as the user's `socket_id` while the socket is open.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use trefla_shared::types::UserId;
use trefla_store::StoreError;

use crate::api::AppState;
use crate::error::ServerError;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Response, ServerError> {
    state.engine.with_db(|db| match db.get_user(user_id) {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound) => {
            Err(ServerError::NotFound(format!("User {user_id} not found")))
        }
        Err(e) => Err(e.into()),
    })?;
    Ok(ws.on_upgrade(move |socket| run_session(state, user_id, socket)))
}

async fn run_session(state: AppState, user_id: UserId, socket: WebSocket) {
    let sessions = state.engine.sessions().clone();
    let (session_id, mut events) = sessions.register(user_id).await;
    if let Err(e) = state
        .engine
        .with_db(|db| Ok(db.set_socket_id(user_id, Some(session_id))?))
    {
        warn!(user = %user_id, error = %e, "Could not record socket id");
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(user = %user_id, error = %e, "Event not serializable");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    // clients only listen on this channel
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    sessions.unregister(session_id).await;
    match state
        .engine
        .with_db(|db| Ok(db.clear_socket_id(user_id, session_id)?))
    {
        Ok(cleared) => debug!(user = %user_id, session = %session_id, cleared, "Socket closed"),
        Err(e) => warn!(user = %user_id, error = %e, "Could not clear socket id"),
    }
}
