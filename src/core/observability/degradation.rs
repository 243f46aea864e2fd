//! Automatic degradation driven by a sliding window of request outcomes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::flags::{Feature, FeatureFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationLevel {
    Full = 0,
    NoParallel = 1,
    NoTransition = 2,
    Basic = 3,
    SecurityOnly = 4,
}

impl DegradationLevel {
    pub fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Full,
            1 => Self::NoParallel,
            2 => Self::NoTransition,
            3 => Self::Basic,
            _ => Self::SecurityOnly,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    fn up(self) -> Self {
        Self::from_index(self.index().saturating_add(1))
    }

    fn down(self) -> Self {
        Self::from_index(self.index().saturating_sub(1))
    }

    /// Flags masked at this level.
    pub fn masked_features(self) -> &'static [Feature] {
        match self {
            Self::Full => &[],
            Self::NoParallel => &[Feature::ParallelExecution],
            Self::NoTransition => &[Feature::ParallelExecution, Feature::TransitionResponse],
            Self::Basic => &[
                Feature::ParallelExecution,
                Feature::TransitionResponse,
                Feature::SmartInterruption,
                Feature::PerformanceTracing,
            ],
            Self::SecurityOnly => &[
                Feature::ParallelExecution,
                Feature::TransitionResponse,
                Feature::SmartInterruption,
                Feature::PerformanceTracing,
                Feature::LlmCompiler,
                Feature::PriorityQueue,
                Feature::StateMachine,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub window: usize,
    pub evaluation_interval: usize,
    pub min_samples: usize,
    pub cooldown_secs: u64,
    pub error_rate_warn: f64,
    pub error_rate_high: f64,
    pub avg_latency_ms: u64,
    pub timeout_rate_warn: f64,
    pub timeout_rate_high: f64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            window: 100,
            evaluation_interval: 10,
            min_samples: 10,
            cooldown_secs: 300,
            error_rate_warn: 0.10,
            error_rate_high: 0.20,
            avg_latency_ms: 5000,
            timeout_rate_warn: 0.05,
            timeout_rate_high: 0.10,
        }
    }
}

/// One observed request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestOutcome {
    pub latency: Duration,
    pub success: bool,
    pub timed_out: bool,
}

impl RequestOutcome {
    pub fn success(latency: Duration) -> Self {
        Self {
            latency,
            success: true,
            timed_out: false,
        }
    }

    pub fn failure(latency: Duration) -> Self {
        Self {
            latency,
            success: false,
            timed_out: false,
        }
    }

    pub fn timeout(latency: Duration) -> Self {
        Self {
            latency,
            success: false,
            timed_out: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WindowMetrics {
    pub samples: usize,
    pub error_rate: f64,
    pub timeout_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelChange {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub manual: bool,
}

struct Inner {
    window: VecDeque<RequestOutcome>,
    since_evaluation: usize,
    level: DegradationLevel,
    last_degraded: Option<Instant>,
    manual: Option<DegradationLevel>,
}

pub struct DegradationManager {
    config: DegradationConfig,
    flags: Arc<FeatureFlags>,
    inner: Mutex<Inner>,
}

impl DegradationManager {
    pub fn new(config: DegradationConfig, flags: Arc<FeatureFlags>) -> Self {
        Self {
            config,
            flags,
            inner: Mutex::new(Inner {
                window: VecDeque::new(),
                since_evaluation: 0,
                level: DegradationLevel::Full,
                last_degraded: None,
                manual: None,
            }),
        }
    }

    pub fn level(&self) -> DegradationLevel {
        let inner = self.inner.lock();
        inner.manual.unwrap_or(inner.level)
    }

    pub fn metrics(&self) -> WindowMetrics {
        compute_metrics(&self.inner.lock().window)
    }

    /// Record one outcome; evaluates every `evaluation_interval` observations.
    pub fn observe(&self, outcome: RequestOutcome) -> Option<LevelChange> {
        let mut inner = self.inner.lock();
        inner.window.push_back(outcome);
        while inner.window.len() > self.config.window.max(1) {
            inner.window.pop_front();
        }
        inner.since_evaluation += 1;
        if inner.since_evaluation < self.config.evaluation_interval.max(1) {
            return None;
        }
        inner.since_evaluation = 0;
        if inner.window.len() < self.config.min_samples {
            return None;
        }
        self.evaluate(&mut inner)
    }

    fn evaluate(&self, inner: &mut Inner) -> Option<LevelChange> {
        let metrics = compute_metrics(&inner.window);
        let target = self.target_level(&metrics);
        let from = inner.level;
        let now = Instant::now();

        let to = if target > from {
            inner.last_degraded = Some(now);
            from.up()
        } else if from > DegradationLevel::Full && self.is_healthy(&metrics) && self.cooled_down(inner, now) {
            from.down()
        } else {
            return None;
        };

        inner.level = to;
        if to > from {
            warn!(
                "Degrading {:?} -> {:?} (errors {:.0}%, timeouts {:.0}%, avg {:.0} ms)",
                from,
                to,
                metrics.error_rate * 100.0,
                metrics.timeout_rate * 100.0,
                metrics.avg_latency_ms
            );
        } else {
            info!("Recovering {:?} -> {:?}", from, to);
        }
        if inner.manual.is_none() {
            self.flags.set_mask(to.masked_features());
        }
        Some(LevelChange { from, to, manual: false })
    }

    fn target_level(&self, metrics: &WindowMetrics) -> DegradationLevel {
        let c = &self.config;
        let mut level = DegradationLevel::Full;
        if metrics.error_rate > c.error_rate_warn {
            level = level.max(DegradationLevel::NoParallel);
        }
        if metrics.error_rate > c.error_rate_high || metrics.avg_latency_ms > c.avg_latency_ms as f64 {
            level = level.max(DegradationLevel::NoTransition);
        }
        if metrics.timeout_rate > c.timeout_rate_warn {
            level = level.max(DegradationLevel::Basic);
        }
        if metrics.timeout_rate > c.timeout_rate_high {
            level = DegradationLevel::SecurityOnly;
        }
        level
    }

    fn is_healthy(&self, metrics: &WindowMetrics) -> bool {
        let c = &self.config;
        metrics.error_rate < c.error_rate_warn * 0.5
            && metrics.timeout_rate < c.timeout_rate_warn * 0.5
            && metrics.avg_latency_ms < c.avg_latency_ms as f64 * 0.5
    }

    fn cooled_down(&self, inner: &Inner, now: Instant) -> bool {
        inner
            .last_degraded
            .is_none_or(|at| now.duration_since(at) >= Duration::from_secs(self.config.cooldown_secs))
    }

    /// Pin the level (or release the pin with `None`).
    pub fn set_override(&self, level: Option<DegradationLevel>) -> LevelChange {
        let mut inner = self.inner.lock();
        let from = inner.manual.unwrap_or(inner.level);
        inner.manual = level;
        let to = level.unwrap_or(inner.level);
        self.flags.set_mask(to.masked_features());
        info!("Degradation override {:?}: {:?} -> {:?}", level, from, to);
        LevelChange { from, to, manual: true }
    }
}

fn compute_metrics(window: &VecDeque<RequestOutcome>) -> WindowMetrics {
    let samples = window.len();
    if samples == 0 {
        return WindowMetrics::default();
    }
    let n = samples as f64;
    let errors = window.iter().filter(|o| !o.success).count() as f64;
    let timeouts = window.iter().filter(|o| o.timed_out).count() as f64;
    let latency: f64 = window.iter().map(|o| o.latency.as_secs_f64() * 1000.0).sum();
    WindowMetrics {
        samples,
        error_rate: errors / n,
        timeout_rate: timeouts / n,
        avg_latency_ms: latency / n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (DegradationManager, Arc<FeatureFlags>) {
        let flags = Arc::new(FeatureFlags::all_enabled());
        (
            DegradationManager::new(DegradationConfig::default(), flags.clone()),
            flags,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_escalate_one_level_per_evaluation() {
        let (manager, flags) = manager();
        let mut changes = Vec::new();
        for _ in 0..20 {
            if let Some(change) = manager.observe(RequestOutcome::timeout(Duration::from_secs(30))) {
                changes.push(change.to);
            }
        }
        assert_eq!(
            changes,
            vec![DegradationLevel::NoParallel, DegradationLevel::NoTransition]
        );
        assert!(!flags.is_enabled(Feature::ParallelExecution));
        assert!(!flags.is_enabled(Feature::TransitionResponse));
        assert!(flags.is_enabled(Feature::SecurityGuardrails));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_needs_cooldown_and_clean_window() {
        let flags = Arc::new(FeatureFlags::all_enabled());
        let manager = DegradationManager::new(
            DegradationConfig {
                window: 10,
                ..Default::default()
            },
            flags.clone(),
        );
        for _ in 0..10 {
            manager.observe(RequestOutcome::timeout(Duration::from_secs(30)));
        }
        assert_eq!(manager.level(), DegradationLevel::NoParallel);

        // the window is clean again but the cool-down has not passed
        for _ in 0..10 {
            manager.observe(RequestOutcome::success(Duration::from_millis(200)));
        }
        assert_eq!(manager.level(), DegradationLevel::NoParallel);

        tokio::time::advance(Duration::from_secs(301)).await;
        let mut recovered = None;
        for _ in 0..10 {
            recovered = recovered.or(manager.observe(RequestOutcome::success(Duration::from_millis(200))));
        }
        assert_eq!(recovered.map(|c| c.to), Some(DegradationLevel::Full));
        assert!(flags.is_enabled(Feature::ParallelExecution));
    }

    #[test]
    fn test_min_samples_gate() {
        let flags = Arc::new(FeatureFlags::all_enabled());
        let manager = DegradationManager::new(
            DegradationConfig {
                evaluation_interval: 5,
                min_samples: 10,
                ..Default::default()
            },
            flags,
        );
        for _ in 0..5 {
            assert!(manager.observe(RequestOutcome::failure(Duration::ZERO)).is_none());
        }
    }

    #[test]
    fn test_manual_override() {
        let (manager, flags) = manager();
        let change = manager.set_override(Some(DegradationLevel::SecurityOnly));
        assert!(change.manual);
        assert_eq!(manager.level(), DegradationLevel::SecurityOnly);
        assert!(!flags.is_enabled(Feature::SmartInterruption));
        assert!(flags.is_enabled(Feature::SecurityGuardrails));

        manager.set_override(None);
        assert_eq!(manager.level(), DegradationLevel::Full);
        assert!(flags.is_enabled(Feature::SmartInterruption));
    }
}
