//! WebSocket error types and handling

use thiserror::Error;

use crate::core::SessionError;

/// WebSocket handler error types
#[derive(Debug, Error)]
pub enum WebSocketError {
    /// Text frame that is not a known control message
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// The session rejected a control message
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Failed to serialize an outgoing message
    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Text sent to the client in an `error` message.
    pub fn client_message(&self) -> String {
        match self {
            WebSocketError::Session(SessionError::UnsupportedAudio(format)) => {
                format!("Unsupported audio format: {format}")
            }
            other => other.to_string(),
        }
    }
}

pub type WebSocketResult<T> = Result<T, WebSocketError>;
