//! Control messages exchanged with the device.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::SessionId;

/// Audio format announced in `hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

fn default_format() -> String {
    "opus".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u16 {
    1
}

fn default_frame_duration() -> u32 {
    60
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: default_format(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration: default_frame_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    /// Wake word detected; `text` carries it
    Detect,
    Start,
    Stop,
}

/// Messages from the device
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "hello")]
    Hello {
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
        #[serde(default)]
        features: Option<Value>,
    },
    #[serde(rename = "listen")]
    Listen {
        #[serde(default)]
        session_id: Option<String>,
        state: ListenState,
        /// auto | manual | realtime
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "abort")]
    Abort {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "goodbye")]
    Goodbye {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Reset the conversation without closing the connection
    #[serde(rename = "restart")]
    Restart {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "iot")]
    Iot {
        #[serde(default)]
        descriptors: Option<Vec<Value>>,
        #[serde(default)]
        states: Option<Vec<Value>>,
    },
    #[serde(rename = "mcp")]
    Mcp { payload: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

/// Messages to the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "hello")]
    Hello {
        session_id: SessionId,
        transport: String,
        audio_params: AudioParams,
    },
    #[serde(rename = "tts")]
    Tts {
        session_id: SessionId,
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    #[serde(rename = "stt")]
    Stt { session_id: SessionId, text: String },
    #[serde(rename = "iot")]
    Iot { session_id: SessionId, commands: Vec<Value> },
    #[serde(rename = "mcp")]
    Mcp { session_id: SessionId, payload: Value },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn tts(session_id: SessionId, state: TtsState, text: Option<String>) -> Self {
        Self::Tts {
            session_id,
            state,
            text,
        }
    }
}

/// Everything the session hands to the connection writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Audio(Bytes),
    /// The session wants the connection closed
    Close,
}
