use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::CoreState;

/// Application state that can be shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Long-lived services every session is built from
    pub core_state: Arc<CoreState>,
}

impl AppState {
    pub fn new(core_state: Arc<CoreState>) -> Arc<Self> {
        Arc::new(Self {
            config: core_state.config.clone(),
            core_state,
        })
    }
}
