//! The session's side of tool execution: a JSON path to the device and
//! spoken confirmation prompts.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::SessionShared;
use super::protocol::{Outbound, ServerMessage};
use crate::core::tools::{ConfirmationChannel, DeviceChannel, ToolError, ToolResult};
use crate::core::tts::AudioPriority;
use crate::core::types::SessionId;

/// Sends tool-originated JSON to the device as regular server messages.
pub(crate) struct SessionDevice {
    session_id: SessionId,
    outbound: mpsc::Sender<Outbound>,
}

impl SessionDevice {
    pub fn new(session_id: SessionId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self { session_id, outbound }
    }
}

#[async_trait]
impl DeviceChannel for SessionDevice {
    async fn send_json(&self, mut message: Value) -> ToolResult<()> {
        if let Some(object) = message.as_object_mut() {
            object.insert("session_id".to_string(), Value::String(self.session_id.to_string()));
        }
        let message: ServerMessage = serde_json::from_value(message)
            .map_err(|e| ToolError::Execution(format!("Malformed device message: {e}")))?;
        self.outbound
            .send(Outbound::Message(message))
            .await
            .map_err(|_| ToolError::DeviceUnavailable)
    }
}

/// Speaks a confirmation prompt and takes the next final transcript as
/// the answer. Prompts from parallel tool calls are asked one at a time.
pub(crate) struct SessionConfirmer {
    shared: Weak<SessionShared>,
    turn: tokio::sync::Mutex<()>,
}

impl SessionConfirmer {
    pub fn new(shared: Weak<SessionShared>) -> Self {
        Self {
            shared,
            turn: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl ConfirmationChannel for SessionConfirmer {
    async fn confirm(&self, prompt: &str, timeout: Duration) -> Option<String> {
        let _turn = self.turn.lock().await;
        let shared = self.shared.upgrade()?;
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = shared.pending_confirmation.lock().replace(tx) {
            debug!(session_id = %shared.id, "Dropping a stale confirmation");
            drop(previous);
        }
        shared.say(prompt, AudioPriority::Transition).await;
        info!(session_id = %shared.id, "Waiting for confirmation: {}", prompt);

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => None,
        };
        // our receiver is gone by now, so only our own sender reads as closed
        let mut slot = shared.pending_confirmation.lock();
        if slot.as_ref().is_some_and(oneshot::Sender::is_closed) {
            slot.take();
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_device_message_gets_session_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let id = SessionId::new();
        let device = SessionDevice::new(id, tx);
        device
            .send_json(json!({"type": "iot", "commands": [{"name": "Lamp", "method": "TurnOn"}]}))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Message(ServerMessage::Iot { session_id, commands }) => {
                assert_eq!(session_id, id);
                assert_eq!(commands.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_message_type_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let device = SessionDevice::new(SessionId::new(), tx);
        let err = device.send_json(json!({"type": "teleport"})).await.unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }

    #[tokio::test]
    async fn test_closed_outbound_is_unavailable() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let device = SessionDevice::new(SessionId::new(), tx);
        let err = device
            .send_json(json!({"type": "mcp", "payload": {"id": 1}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::DeviceUnavailable));
    }
}
