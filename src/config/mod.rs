//! Configuration module for the vocalis server
//!
//! Configuration comes from a YAML file and environment variables, merged
//! into a typed [`ServerConfig`]. The configuration is split into logical
//! submodules:
//!
//! - `yaml`: YAML configuration file loading
//! - `env`: environment-only loading (reads `.env` through dotenvy)
//! - `merge`: merging YAML and environment values
//! - `validation`: startup checks against the provider registry
//!
//! Priority is YAML > environment > defaults, except `AUTH_KEY`, which always
//! overrides the YAML auth secret.
//!
//! # Example
//! ```rust,no_run
//! use vocalis::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::codec::CodecTag;
use crate::core::ingress::{DEFAULT_REORDER_DEPTH, FramingMode, VadGateConfig};
use crate::core::interruption::InterruptionConfig;
use crate::core::observability::{DegradationConfig, TracerConfig};
use crate::core::orchestrator::ExecutorConfig;
use crate::core::providers::SelectedModules;
use crate::core::tools::SecurityConfig;
use crate::core::transition::TransitionConfig;

mod env;
mod merge;
mod validation;
mod yaml;

pub use validation::validate;
pub use yaml::YamlConfig;

/// Default config file looked up when neither `--config` nor `CONFIG_PATH` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Extra grace on top of `close_connection_no_voice_time` before an idle
/// session is closed.
pub const IDLE_GRACE_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Shared secret clients present as a bearer token; `None` disables auth
    pub auth_key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            auth_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    /// Seconds without voice before the idle close countdown ends
    pub close_connection_no_voice_time: u64,
    pub system_prompt: String,
    pub history_token_budget: usize,
    pub max_tool_rounds: usize,
    /// Request header carrying the device id
    pub device_id_header: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            close_connection_no_voice_time: 120,
            system_prompt: "你是一个友好的语音助手，回答要简短口语化。".to_string(),
            history_token_budget: 4000,
            max_tool_rounds: 5,
            device_id_header: "device-id".to_string(),
        }
    }
}

impl SessionSection {
    /// Idle limit enforced by the session monitor.
    pub fn idle_limit_secs(&self) -> u64 {
        self.close_connection_no_voice_time + IDLE_GRACE_SECS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSection {
    pub framing: FramingMode,
    pub reorder_depth: usize,
    /// Codec of outbound audio
    pub output_format: CodecTag,
    pub output_sample_rate: u32,
    /// Send frames in real time instead of as fast as they are produced
    pub pace_output: bool,
    /// Frames sent ahead of real time at the start of a sentence
    pub prebuffer_frames: usize,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            framing: FramingMode::Auto,
            reorder_depth: DEFAULT_REORDER_DEPTH,
            output_format: default_output_format(),
            output_sample_rate: 16000,
            pace_output: true,
            prebuffer_frames: 3,
        }
    }
}

/// Opus when it is compiled in, PCM16 otherwise.
pub fn default_output_format() -> CodecTag {
    if cfg!(feature = "opus") {
        CodecTag::Opus
    } else {
        CodecTag::Pcm16
    }
}

/// Server configuration
///
/// Every section has defaults, so an empty YAML file yields a server running
/// the development providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub session: SessionSection,
    pub selected_module: SelectedModules,
    pub vad: VadGateConfig,
    pub audio: AudioSection,
    pub interruption: InterruptionConfig,
    pub orchestrator: ExecutorConfig,
    pub security: SecurityConfig,
    pub transition: TransitionConfig,
    pub tracing: TracerConfig,
    pub degradation: DegradationConfig,
    /// Feature flag name → enabled
    pub features: HashMap<String, bool>,
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable fallbacks
    ///
    /// `.env` is deliberately not read here: the file given is the source of
    /// truth and only real environment variables fill its gaps.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or an
    /// environment variable has an invalid format.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = YamlConfig::from_file(path)?;
        merge::merge_config(Some(yaml_config))
    }

    /// Resolve the config file from `--config`, then `CONFIG_PATH`, then the
    /// default path. A missing default file falls back to environment-only
    /// configuration; an explicitly named file must exist.
    pub fn load(cli_path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(path) = cli_path {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var("CONFIG_PATH") {
            return Self::from_file(&PathBuf::from(path));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default.exists() {
            Self::from_file(&default)
        } else {
            Self::from_env()
        }
    }

    /// Socket address string for the listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn auth_enabled(&self) -> bool {
        self.server.auth_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// VAD gate settings with the idle timeout derived from the session section.
    pub fn gate_config(&self) -> VadGateConfig {
        VadGateConfig {
            idle_timeout_ms: self.session.idle_limit_secs() * 1000,
            ..self.vad
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    fn clear_env() {
        unsafe {
            for var in ["CONFIG_PATH", "AUTH_KEY", "HOST", "PORT", "SELECTED_LLM"] {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.session.idle_limit_secs(), 180);
        assert_eq!(config.session.max_tool_rounds, 5);
        assert_eq!(config.selected_module.tts, "tone");
        assert!(!config.auth_enabled());
        assert_eq!(config.gate_config().idle_timeout_ms, 180_000);
    }

    #[test]
    #[serial]
    fn test_load_prefers_cli_path_over_config_path_env() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let cli = dir.path().join("cli.yaml");
        let other = dir.path().join("other.yaml");
        fs::write(&cli, "server:\n  port: 9001\n").unwrap();
        fs::write(&other, "server:\n  port: 9002\n").unwrap();

        unsafe {
            env::set_var("CONFIG_PATH", &other);
        }
        assert_eq!(ServerConfig::load(Some(&cli)).unwrap().server.port, 9001);
        assert_eq!(ServerConfig::load(None).unwrap().server.port, 9002);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_env();
        assert!(ServerConfig::load(Some(Path::new("/nonexistent/vocalis.yaml"))).is_err());
    }
}
