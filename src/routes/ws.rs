use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::ws;
use crate::state::AppState;
use std::sync::Arc;

/// Create the WebSocket router
///
/// The upgrade request is authenticated with `Authorization: Bearer <AUTH_KEY>`
/// when a key is configured, and identifies the device through the
/// configured device-id header (or a `device-id` query parameter).
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(ws::ws_voice_handler))
        .layer(TraceLayer::new_for_http())
}
