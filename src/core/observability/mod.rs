//! # Observability
//!
//! Process-wide services injected into every session:
//!
//! - [`PerformanceTracer`]: per-phase latency histograms and TTFR
//! - [`FeatureFlags`]: runtime toggles with dependency cascade
//! - [`DegradationManager`]: five-level automatic degradation that masks
//!   feature flags

mod degradation;
mod flags;
mod tracer;

pub use degradation::{
    DegradationConfig, DegradationLevel, DegradationManager, LevelChange, RequestOutcome,
    WindowMetrics,
};
pub use flags::{Feature, FeatureFlags, FlagError, FlagResult};
pub use tracer::{PerformanceTracer, Phase, PhaseSpan, PhaseStats, TracerConfig};
