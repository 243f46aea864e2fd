use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::core::ingress::FramingMode;
use crate::core::interruption::InterruptionConfig;
use crate::core::observability::{DegradationConfig, TracerConfig};
use crate::core::orchestrator::ExecutorConfig;
use crate::core::tools::SecurityConfig;
use crate::core::transition::TransitionConfig;

/// Complete YAML configuration structure
///
/// Every section is optional. Component sections (`interruption`,
/// `orchestrator`, `security`, `transition`, `tracing`, `degradation`) use the
/// component's own defaults for any key left out.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8000
///   auth_key: "change-me"
///
/// session:
///   close_connection_no_voice_time: 120
///   max_tool_rounds: 5
///
/// selected_module:
///   vad: energy
///   asr: "null"
///   llm: echo
///   tts: tone
///   memory: noop
///
/// vad:
///   threshold_high: 0.5
///   threshold_low: 0.2
///   min_silence_ms: 1000
///
/// audio:
///   framing: auto
///   output_format: opus
///   prebuffer_frames: 3
///
/// interruption:
///   smart: true
///   skip_backchannel: true
///
/// security:
///   strict: false
///   allowed_tools: [get_weather, play_music]
///
/// features:
///   parallel_execution: true
///   transition_response: true
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub session: Option<SessionYaml>,
    pub selected_module: Option<SelectedModuleYaml>,
    pub vad: Option<VadYaml>,
    pub audio: Option<AudioYaml>,
    pub interruption: Option<InterruptionConfig>,
    pub orchestrator: Option<ExecutorConfig>,
    pub security: Option<SecurityConfig>,
    pub transition: Option<TransitionConfig>,
    pub tracing: Option<TracerConfig>,
    pub degradation: Option<DegradationConfig>,
    pub features: Option<HashMap<String, bool>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub close_connection_no_voice_time: Option<u64>,
    pub system_prompt: Option<String>,
    pub history_token_budget: Option<usize>,
    pub max_tool_rounds: Option<usize>,
    pub device_id_header: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SelectedModuleYaml {
    pub vad: Option<String>,
    pub asr: Option<String>,
    pub llm: Option<String>,
    pub tts: Option<String>,
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VadYaml {
    pub threshold_high: Option<f32>,
    pub threshold_low: Option<f32>,
    pub window_size: Option<usize>,
    pub voiced_frames: Option<usize>,
    pub min_silence_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub framing: Option<FramingMode>,
    pub reorder_depth: Option<usize>,
    pub output_format: Option<String>,
    pub output_sample_rate: Option<u32>,
    pub pace_output: Option<bool>,
    pub prebuffer_frames: Option<usize>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or contains invalid YAML.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_str(&contents)
    }

    /// Parse YAML text. An empty document is an empty configuration.
    pub fn from_str(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: YamlConfig = serde_yaml::from_str(contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
server:
  port: 9000
vad:
  min_silence_ms: 700
interruption:
  skip_backchannel: false
features:
  parallel_execution: false
"#;
        let config = YamlConfig::from_str(yaml).unwrap();
        assert_eq!(config.server.unwrap().port, Some(9000));
        assert_eq!(config.vad.unwrap().min_silence_ms, Some(700));
        let interruption = config.interruption.unwrap();
        assert!(!interruption.skip_backchannel);
        assert!(interruption.smart);
        assert_eq!(config.features.unwrap()["parallel_execution"], false);
    }

    #[test]
    fn test_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.yaml");
        fs::write(&path, "").unwrap();
        let config = YamlConfig::from_file(&path).unwrap();
        assert!(config.server.is_none());
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(YamlConfig::from_str("server: [unclosed").is_err());
    }
}
