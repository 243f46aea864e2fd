use std::sync::Arc;

use tracing::info;

use crate::config::ServerConfig;
use crate::core::observability::{DegradationManager, FeatureFlags, FlagResult, PerformanceTracer};
use crate::core::providers::ProviderRegistry;
use crate::core::tools::PluginExecutor;
use crate::core::transition::TransitionGenerator;
use crate::core::worker_pool::WorkerPool;

/// Core-specific shared state for the application.
///
/// Holds the long-lived services every session is built from: provider
/// factories, runtime feature flags with their degradation manager, the
/// latency tracer, server plugins and the CPU worker pool. Created once at
/// startup and injected into each session.
pub struct CoreState {
    pub config: Arc<ServerConfig>,
    pub providers: ProviderRegistry,
    pub flags: Arc<FeatureFlags>,
    pub degradation: Arc<DegradationManager>,
    pub tracer: Arc<PerformanceTracer>,
    /// Server-side plugin functions shared by all sessions
    pub plugins: Arc<PluginExecutor>,
    pub transitions: Arc<TransitionGenerator>,
    pub pool: WorkerPool,
}

impl CoreState {
    /// Initialize core state from a validated configuration.
    pub fn new(config: ServerConfig, providers: ProviderRegistry) -> FlagResult<Arc<Self>> {
        let flags = Arc::new(FeatureFlags::from_config(&config.features)?);
        let degradation = Arc::new(DegradationManager::new(config.degradation.clone(), flags.clone()));
        let tracer = Arc::new(PerformanceTracer::new(config.tracing.clone(), flags.clone()));

        let mut transitions = TransitionGenerator::new(config.transition);
        if config.transition.llm_fallback {
            match providers.llm(&config.selected_module.llm) {
                Ok(llm) => transitions = transitions.with_llm(llm),
                Err(e) => info!("Transition LLM fallback unavailable: {}", e),
            }
        }

        let pool = WorkerPool::with_default_size();
        info!(
            "Core state ready: worker pool of {}, features {:?}",
            pool.size(),
            flags.snapshot()
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            providers,
            flags,
            degradation,
            tracer,
            plugins: Arc::new(PluginExecutor::new()),
            transitions: Arc::new(transitions),
            pool,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observability::Feature;

    #[tokio::test]
    async fn test_core_state_from_defaults() {
        let core = CoreState::new(ServerConfig::default(), ProviderRegistry::with_dev_providers()).unwrap();
        assert!(core.flags.is_enabled(Feature::ParallelExecution));
        assert!(core.plugins.is_empty());
        assert!(core.pool.size() >= 1);
    }

    #[tokio::test]
    async fn test_features_section_applies() {
        let mut config = ServerConfig::default();
        config.features.insert("transition_response".to_string(), false);
        let core = CoreState::new(config, ProviderRegistry::with_dev_providers()).unwrap();
        assert!(!core.flags.is_enabled(Feature::TransitionResponse));
    }
}
