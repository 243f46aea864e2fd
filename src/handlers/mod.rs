//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `ws` - Device voice sessions over WebSocket

pub mod api;
pub mod ws;

// Re-export commonly used handlers for convenient access
pub use ws::ws_voice_handler;
