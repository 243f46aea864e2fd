use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ParallelExecution,
    TransitionResponse,
    SmartInterruption,
    SecurityGuardrails,
    PerformanceTracing,
    LlmCompiler,
    PriorityQueue,
    StateMachine,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Self::ParallelExecution,
        Self::TransitionResponse,
        Self::SmartInterruption,
        Self::SecurityGuardrails,
        Self::PerformanceTracing,
        Self::LlmCompiler,
        Self::PriorityQueue,
        Self::StateMachine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParallelExecution => "parallel_execution",
            Self::TransitionResponse => "transition_response",
            Self::SmartInterruption => "smart_interruption",
            Self::SecurityGuardrails => "security_guardrails",
            Self::PerformanceTracing => "performance_tracing",
            Self::LlmCompiler => "llm_compiler",
            Self::PriorityQueue => "priority_queue",
            Self::StateMachine => "state_machine",
        }
    }

    /// Features that must be on for this one to be enabled.
    pub fn dependencies(&self) -> &'static [Feature] {
        match self {
            Self::ParallelExecution => &[Self::LlmCompiler],
            Self::TransitionResponse => &[Self::PriorityQueue],
            Self::SmartInterruption => &[Self::StateMachine],
            Self::LlmCompiler => &[Self::StateMachine],
            _ => &[],
        }
    }

    /// Features that cannot be on together with this one.
    pub fn conflicts(&self) -> &'static [Feature] {
        &[]
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = FlagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| FlagError::Unknown(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlagError {
    #[error("Unknown feature flag: {0}")]
    Unknown(String),
    #[error("Cannot enable {flag}: dependency {dependency} is disabled")]
    MissingDependency { flag: Feature, dependency: Feature },
    #[error("Cannot enable {flag}: conflicts with {other}")]
    Conflict { flag: Feature, other: Feature },
}

pub type FlagResult<T> = Result<T, FlagError>;

/// Runtime feature toggles shared by every session.
///
/// A flag is effective when it is configured on and not masked by the
/// current degradation level.
pub struct FeatureFlags {
    enabled: RwLock<HashSet<Feature>>,
    masked: RwLock<HashSet<Feature>>,
}

impl FeatureFlags {
    /// Every flag on.
    pub fn all_enabled() -> Self {
        Self {
            enabled: RwLock::new(Feature::ALL.into_iter().collect()),
            masked: RwLock::new(HashSet::new()),
        }
    }

    /// Start from all-on and apply the configured overrides.
    ///
    /// Overrides are applied in an order that respects dependencies: enables
    /// after disables, so a configuration that turns a flag and its dependency
    /// off is accepted.
    pub fn from_config(overrides: &HashMap<String, bool>) -> FlagResult<Self> {
        let flags = Self::all_enabled();
        let mut parsed = Vec::with_capacity(overrides.len());
        for (name, on) in overrides {
            parsed.push((name.parse::<Feature>()?, *on));
        }
        parsed.sort_by_key(|(feature, on)| (*on, *feature));
        for (feature, on) in parsed {
            if on {
                flags.enable(feature)?;
            } else {
                flags.disable(feature);
            }
        }
        Ok(flags)
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.enabled.read().contains(&feature) && !self.masked.read().contains(&feature)
    }

    /// Configured state, ignoring degradation masks.
    pub fn is_configured(&self, feature: Feature) -> bool {
        self.enabled.read().contains(&feature)
    }

    pub fn enable(&self, feature: Feature) -> FlagResult<()> {
        let mut enabled = self.enabled.write();
        if let Some(dependency) = feature
            .dependencies()
            .iter()
            .find(|d| !enabled.contains(*d))
        {
            return Err(FlagError::MissingDependency {
                flag: feature,
                dependency: *dependency,
            });
        }
        if let Some(other) = feature.conflicts().iter().find(|c| enabled.contains(*c)) {
            return Err(FlagError::Conflict {
                flag: feature,
                other: *other,
            });
        }
        if enabled.insert(feature) {
            info!("Feature {} enabled", feature);
        }
        Ok(())
    }

    /// Disable `feature` and, transitively, everything that depends on it.
    /// Returns every flag that was turned off.
    pub fn disable(&self, feature: Feature) -> Vec<Feature> {
        let mut enabled = self.enabled.write();
        let mut disabled = Vec::new();
        let mut pending = vec![feature];
        while let Some(next) = pending.pop() {
            if !enabled.remove(&next) {
                continue;
            }
            disabled.push(next);
            pending.extend(
                Feature::ALL
                    .into_iter()
                    .filter(|f| f.dependencies().contains(&next)),
            );
        }
        if disabled.len() > 1 {
            warn!("Disabling {} cascaded to {:?}", feature, &disabled[1..]);
        }
        disabled
    }

    /// Replace the degradation mask.
    pub fn set_mask(&self, masked: &[Feature]) {
        *self.masked.write() = masked.iter().copied().collect();
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, bool> {
        Feature::ALL
            .into_iter()
            .map(|f| (f.as_str(), self.is_enabled(f)))
            .collect()
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::all_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_cascades_to_dependents() {
        let flags = FeatureFlags::all_enabled();
        let off = flags.disable(Feature::StateMachine);
        assert_eq!(off[0], Feature::StateMachine);
        assert!(off.contains(&Feature::LlmCompiler));
        assert!(off.contains(&Feature::ParallelExecution));
        assert!(off.contains(&Feature::SmartInterruption));
        assert!(flags.is_enabled(Feature::SecurityGuardrails));
    }

    #[test]
    fn test_enable_requires_dependencies() {
        let flags = FeatureFlags::all_enabled();
        flags.disable(Feature::LlmCompiler);
        assert_eq!(
            flags.enable(Feature::ParallelExecution),
            Err(FlagError::MissingDependency {
                flag: Feature::ParallelExecution,
                dependency: Feature::LlmCompiler,
            })
        );
        flags.enable(Feature::LlmCompiler).unwrap();
        flags.enable(Feature::ParallelExecution).unwrap();
        assert!(flags.is_enabled(Feature::ParallelExecution));
    }

    #[test]
    fn test_mask_hides_configured_flag() {
        let flags = FeatureFlags::all_enabled();
        flags.set_mask(&[Feature::TransitionResponse]);
        assert!(!flags.is_enabled(Feature::TransitionResponse));
        assert!(flags.is_configured(Feature::TransitionResponse));
        assert_eq!(flags.snapshot()["transition_response"], false);
        flags.set_mask(&[]);
        assert!(flags.is_enabled(Feature::TransitionResponse));
    }

    #[test]
    fn test_from_config_rejects_unknown() {
        let mut overrides = HashMap::new();
        overrides.insert("warp_drive".to_string(), true);
        assert!(matches!(
            FeatureFlags::from_config(&overrides),
            Err(FlagError::Unknown(_))
        ));

        let mut overrides = HashMap::new();
        overrides.insert("parallel_execution".to_string(), false);
        let flags = FeatureFlags::from_config(&overrides).unwrap();
        assert!(!flags.is_enabled(Feature::ParallelExecution));
        assert!(flags.is_enabled(Feature::LlmCompiler));
    }
}
