//! Axum WebSocket handler
//!
//! Upgrades the HTTP connection, starts one [`Session`] per connection and
//! pumps frames between the socket and the session.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::WebSocketError;
use super::processor::{handle_audio_message, handle_text_message};
use crate::auth::authorize;
use crate::core::session::{Outbound, ServerMessage, Session};
use crate::errors::auth_error::AuthError;
use crate::state::AppState;

/// Buffer between the session and the socket writer
const CHANNEL_BUFFER_SIZE: usize = 256;
/// Time the writer gets to flush the final frames after the session ends
const WRITER_DRAIN: Duration = Duration::from_secs(3);
const DEVICE_ID_QUERY: &str = "device-id";

/// WebSocket voice session handler
pub async fn ws_voice_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AuthError> {
    authorize(&headers, state.config.server.auth_key.as_deref())?;

    let device_id = headers
        .get(state.config.session.device_id_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get(DEVICE_ID_QUERY).cloned())
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("anonymous-{}", uuid::Uuid::new_v4()));

    info!(device_id = %device_id, "WebSocket voice connection upgrade requested");
    Ok(ws.on_upgrade(move |socket| handle_voice_socket(socket, state, device_id)))
}

fn encode(outbound: Outbound) -> Result<Option<Message>, WebSocketError> {
    Ok(match outbound {
        Outbound::Message(message) => Some(Message::Text(serde_json::to_string(&message)?.into())),
        Outbound::Audio(data) => Some(Message::Binary(data)),
        Outbound::Close => None,
    })
}

/// Drive one device connection until either side ends it.
async fn handle_voice_socket(socket: WebSocket, app_state: Arc<AppState>, device_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);

    let session = match Session::start(app_state.core_state.clone(), device_id, outbound_tx.clone()) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start session: {}", e);
            let message = ServerMessage::Error {
                message: format!("Voice service unavailable: {e}"),
            };
            if let Ok(Some(frame)) = encode(Outbound::Message(message)) {
                let _ = sender.send(frame).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = session.id();

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let frame = match encode(outbound) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(e) => {
                    error!("{}", e);
                    continue;
                }
            };
            if let Err(e) = sender.send(frame).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    let stopped = session.stopped();
    let mut writer_done = false;
    loop {
        tokio::select! {
            _ = stopped.cancelled() => break,
            _ = &mut writer => {
                debug!(session_id = %session_id, "Socket writer finished");
                writer_done = true;
                break;
            }
            message = receiver.next() => match message {
                Some(Ok(message)) => {
                    if !process_message(message, &session, &outbound_tx).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(session_id = %session_id, "WebSocket error: {}", e);
                    break;
                }
                None => {
                    info!(session_id = %session_id, "WebSocket connection closed by client");
                    break;
                }
            },
        }
    }

    session.close().await;
    drop(session);
    drop(outbound_tx);
    if !writer_done && tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(session_id = %session_id, "WebSocket voice connection terminated");
}

/// Returns false to end the connection.
async fn process_message(message: Message, session: &Session, outbound: &mpsc::Sender<Outbound>) -> bool {
    match message {
        Message::Text(text) => handle_text_message(text.as_str(), session, outbound).await,
        Message::Binary(data) => handle_audio_message(data, session).await,
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            info!(session_id = %session.id(), "WebSocket close frame received");
            false
        }
    }
}
