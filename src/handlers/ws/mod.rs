//! # WebSocket Voice Handler Module
//!
//! One device connection drives one dialogue session.
//!
//! ## Connection Flow
//! 1. Device connects to `/ws` with `Authorization: Bearer <key>` (when a key
//!    is configured) and a `device-id` header
//! 2. Device sends `hello` with its audio parameters; server answers `hello`
//!    with the session id and its output audio parameters
//! 3. Device streams binary audio frames (optionally with a 16-byte
//!    timestamp/length header); server answers with `stt`, `tts` markers and
//!    binary audio
//!
//! ## Message Types
//!
//! **Incoming:**
//! - `{"type":"hello","version":3,"audio_params":{...},"features":["mcp"]}`
//! - `{"type":"listen","state":"detect|start|stop","mode":"auto|manual|realtime","text":"..."}`
//! - `{"type":"abort"}`, `{"type":"goodbye"}`, `{"type":"restart"}`
//! - `{"type":"iot","descriptors":[...]}` / `{"type":"iot","states":[...]}`
//! - `{"type":"mcp","payload":{...}}` - JSON-RPC reply from the device
//! - **Binary messages** - audio frames
//!
//! **Outgoing:**
//! - `{"type":"hello","session_id":"...","transport":"websocket","audio_params":{...}}`
//! - `{"type":"stt","text":"..."}`
//! - `{"type":"tts","state":"start|sentence_start|stop","text":"..."}`
//! - `{"type":"iot","commands":[...]}`, `{"type":"mcp","payload":{...}}`
//! - `{"type":"error","message":"..."}`
//! - **Binary messages** - synthesized audio, one encoded frame per message
//!
//! ## Rust Client Example
//!
//! ```rust,no_run
//! use futures::{SinkExt, StreamExt};
//! use serde_json::json;
//! use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (ws_stream, _) = connect_async("ws://localhost:8000/ws?device-id=esp32-01").await?;
//!     let (mut write, mut read) = ws_stream.split();
//!
//!     let hello = json!({
//!         "type": "hello",
//!         "version": 3,
//!         "audio_params": {"format": "pcm16", "sample_rate": 16000, "channels": 1, "frame_duration": 60}
//!     });
//!     write.send(Message::Text(hello.to_string().into())).await?;
//!     write
//!         .send(Message::Text(json!({"type": "listen", "state": "detect", "text": "你好"}).to_string().into()))
//!         .await?;
//!
//!     while let Some(message) = read.next().await {
//!         match message? {
//!             Message::Text(text) => println!("control: {text}"),
//!             Message::Binary(data) => println!("audio: {} bytes", data.len()),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod handler;
pub mod processor;

pub use error::WebSocketError;
pub use handler::ws_voice_handler;
