//! Per-phase latency histograms.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::flags::{Feature, FeatureFlags};
use crate::core::types::SessionId;

/// Samples kept per phase for percentile estimation.
const SAMPLE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Total,
    IntentDetection,
    TransitionResponse,
    ToolPlanning,
    ToolExecution,
    ResponseGeneration,
    TtsSynthesis,
    AudioPlayback,
    Interruption,
    MemoryQuery,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Self::Total,
        Self::IntentDetection,
        Self::TransitionResponse,
        Self::ToolPlanning,
        Self::ToolExecution,
        Self::ResponseGeneration,
        Self::TtsSynthesis,
        Self::AudioPlayback,
        Self::Interruption,
        Self::MemoryQuery,
    ];

    pub fn default_threshold_ms(&self) -> u64 {
        match self {
            Self::Total => 3000,
            Self::IntentDetection => 500,
            Self::TransitionResponse => 100,
            Self::ToolPlanning => 100,
            Self::ToolExecution => 5000,
            Self::ResponseGeneration => 2000,
            Self::TtsSynthesis => 1000,
            Self::AudioPlayback => 60000,
            Self::Interruption => 400,
            Self::MemoryQuery => 500,
        }
    }
}

/// Per-phase warning thresholds in milliseconds; unset phases use defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TracerConfig {
    pub thresholds_ms: HashMap<Phase, u64>,
}

impl TracerConfig {
    pub fn threshold(&self, phase: Phase) -> Duration {
        Duration::from_millis(
            self.thresholds_ms
                .get(&phase)
                .copied()
                .unwrap_or_else(|| phase.default_threshold_ms()),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseStats {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub over_threshold: u64,
}

#[derive(Default)]
struct Histogram {
    count: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
    over_threshold: u64,
    samples: VecDeque<f64>,
}

impl Histogram {
    fn record(&mut self, ms: f64) {
        if self.count == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        self.count += 1;
        self.sum_ms += ms;
        if self.samples.len() == SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    fn stats(&self) -> PhaseStats {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let percentile = |p: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };
        PhaseStats {
            count: self.count,
            avg_ms: if self.count == 0 {
                0.0
            } else {
                self.sum_ms / self.count as f64
            },
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            p50_ms: percentile(50.0),
            p95_ms: percentile(95.0),
            p99_ms: percentile(99.0),
            over_threshold: self.over_threshold,
        }
    }
}

/// Process-wide latency tracer. Recording is a no-op while the
/// `performance_tracing` flag is off.
pub struct PerformanceTracer {
    config: TracerConfig,
    flags: Arc<FeatureFlags>,
    phases: Mutex<HashMap<Phase, Histogram>>,
    ttfr: Mutex<Histogram>,
}

impl PerformanceTracer {
    pub fn new(config: TracerConfig, flags: Arc<FeatureFlags>) -> Self {
        Self {
            config,
            flags,
            phases: Mutex::new(HashMap::new()),
            ttfr: Mutex::new(Histogram::default()),
        }
    }

    fn enabled(&self) -> bool {
        self.flags.is_enabled(Feature::PerformanceTracing)
    }

    pub fn record(&self, session_id: SessionId, phase: Phase, elapsed: Duration) {
        if !self.enabled() {
            return;
        }
        let ms = elapsed.as_secs_f64() * 1000.0;
        let threshold = self.config.threshold(phase);
        let mut phases = self.phases.lock();
        let histogram = phases.entry(phase).or_default();
        histogram.record(ms);
        if elapsed > threshold {
            histogram.over_threshold += 1;
            warn!(
                session_id = %session_id,
                "{:?} took {:.0} ms (threshold {} ms)",
                phase,
                ms,
                threshold.as_millis()
            );
        } else {
            debug!(session_id = %session_id, "{:?} took {:.1} ms", phase, ms);
        }
    }

    /// Start timing a phase; the span records when finished or dropped.
    pub fn span(self: &Arc<Self>, session_id: SessionId, phase: Phase) -> PhaseSpan {
        PhaseSpan {
            tracer: self.clone(),
            session_id,
            phase,
            started: Instant::now(),
            done: false,
        }
    }

    pub fn record_ttfr(&self, session_id: SessionId, elapsed: Duration) {
        if !self.enabled() {
            return;
        }
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.ttfr.lock().record(ms);
        debug!(session_id = %session_id, "TTFR {:.0} ms", ms);
    }

    pub fn stats(&self, phase: Phase) -> PhaseStats {
        self.phases
            .lock()
            .get(&phase)
            .map(Histogram::stats)
            .unwrap_or_default()
    }

    pub fn ttfr_stats(&self) -> PhaseStats {
        self.ttfr.lock().stats()
    }

    pub fn report(&self) -> BTreeMap<Phase, PhaseStats> {
        self.phases
            .lock()
            .iter()
            .map(|(phase, histogram)| (*phase, histogram.stats()))
            .collect()
    }
}

pub struct PhaseSpan {
    tracer: Arc<PerformanceTracer>,
    session_id: SessionId,
    phase: Phase,
    started: Instant,
    done: bool,
}

impl PhaseSpan {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(mut self) -> Duration {
        self.done = true;
        let elapsed = self.started.elapsed();
        self.tracer.record(self.session_id, self.phase, elapsed);
        elapsed
    }
}

impl Drop for PhaseSpan {
    fn drop(&mut self) {
        if !self.done {
            self.tracer
                .record(self.session_id, self.phase, self.started.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer() -> (Arc<PerformanceTracer>, Arc<FeatureFlags>) {
        let flags = Arc::new(FeatureFlags::all_enabled());
        (
            Arc::new(PerformanceTracer::new(TracerConfig::default(), flags.clone())),
            flags,
        )
    }

    #[test]
    fn test_percentiles() {
        let (tracer, _) = tracer();
        let id = SessionId::new();
        for ms in 1..=100 {
            tracer.record(id, Phase::ToolExecution, Duration::from_millis(ms));
        }
        let stats = tracer.stats(Phase::ToolExecution);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 100.0);
        assert!((stats.avg_ms - 50.5).abs() < 1e-9);
        assert!((stats.p50_ms - 50.0).abs() <= 1.0);
        assert!((stats.p95_ms - 95.0).abs() <= 1.0);
        assert_eq!(stats.over_threshold, 0);
    }

    #[test]
    fn test_threshold_override_counts() {
        let flags = Arc::new(FeatureFlags::all_enabled());
        let mut config = TracerConfig::default();
        config.thresholds_ms.insert(Phase::Interruption, 10);
        let tracer = PerformanceTracer::new(config, flags);
        tracer.record(SessionId::new(), Phase::Interruption, Duration::from_millis(50));
        assert_eq!(tracer.stats(Phase::Interruption).over_threshold, 1);
    }

    #[test]
    fn test_disabled_flag_skips_recording() {
        let (tracer, flags) = tracer();
        flags.disable(Feature::PerformanceTracing);
        tracer.record(SessionId::new(), Phase::Total, Duration::from_millis(5));
        assert_eq!(tracer.stats(Phase::Total).count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_span_records_on_drop() {
        let (tracer, _) = tracer();
        {
            let _span = tracer.span(SessionId::new(), Phase::MemoryQuery);
            tokio::time::advance(Duration::from_millis(30)).await;
        }
        let stats = tracer.stats(Phase::MemoryQuery);
        assert_eq!(stats.count, 1);
        assert!(stats.max_ms >= 30.0);
    }
}
