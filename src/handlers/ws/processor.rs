//! WebSocket message processing
//!
//! Routes text frames to the session as control messages and binary frames
//! to its audio ingress.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::{WebSocketError, WebSocketResult};
use crate::core::DialogueState;
use crate::core::session::{ClientMessage, Outbound, ServerMessage, Session};

/// Parse one text frame.
pub fn parse_control(text: &str) -> WebSocketResult<ClientMessage> {
    serde_json::from_str(text).map_err(|e| WebSocketError::InvalidMessage(e.to_string()))
}

/// Process a text control frame
///
/// Protocol errors are logged and never end the connection; the client is
/// told about them only while the session is idle or speaking.
///
/// # Returns
/// * `bool` - true to continue processing, false to terminate the connection
pub async fn handle_text_message(text: &str, session: &Session, outbound: &mpsc::Sender<Outbound>) -> bool {
    let result = match parse_control(text) {
        Ok(message) => {
            debug!(session_id = %session.id(), "Control message: {:?}", message);
            session.handle_message(message).await.map_err(WebSocketError::from)
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        warn!(session_id = %session.id(), "{}", e);
        let report = match &e {
            WebSocketError::InvalidMessage(_) => {
                matches!(session.state(), DialogueState::Speaking | DialogueState::Idle)
            }
            _ => true,
        };
        if report {
            let message = ServerMessage::Error {
                message: e.client_message(),
            };
            if outbound.send(Outbound::Message(message)).await.is_err() {
                return false;
            }
        }
    }
    true
}

/// Forward a binary audio frame to the session
pub async fn handle_audio_message(data: Bytes, session: &Session) -> bool {
    match session.push_audio(data).await {
        Ok(()) => true,
        Err(e) => {
            debug!(session_id = %session.id(), "Audio dropped: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::ListenState;

    #[test]
    fn test_parse_control() {
        assert!(matches!(
            parse_control(r#"{"type":"listen","state":"start","mode":"manual"}"#),
            Ok(ClientMessage::Listen {
                state: ListenState::Start,
                ..
            })
        ));
        assert!(matches!(parse_control("not json"), Err(WebSocketError::InvalidMessage(_))));
        assert!(matches!(
            parse_control(r#"{"type":"speak","text":"hi"}"#),
            Err(WebSocketError::InvalidMessage(_))
        ));
    }
}
