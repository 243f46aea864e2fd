use std::env;

use super::env::{env_flag, env_number};
use super::yaml::YamlConfig;
use super::{AudioSection, ServerConfig, ServerSection, SessionSection};
use crate::core::codec::CodecTag;
use crate::core::providers::SelectedModules;

/// Merge YAML configuration with environment variables
///
/// Priority order (highest to lowest):
/// 1. YAML configuration values
/// 2. Environment variables
/// 3. Default values
///
/// `AUTH_KEY` is the exception: when set it always wins over the YAML
/// `server.auth_key`, so secrets can stay out of config files.
pub fn merge_config(yaml_config: Option<YamlConfig>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let yaml = yaml_config.unwrap_or_default();
    let defaults = ServerConfig::default();

    // Helper macro to get value with priority: YAML > ENV > Default
    macro_rules! get_value {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            $yaml_value
                .or_else(|| env::var($env_var).ok())
                .unwrap_or_else(|| $default.to_string())
        };
    }

    // Same priority for numbers; a malformed env value is an error
    macro_rules! get_number {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            match $yaml_value {
                Some(v) => v,
                None => env_number($env_var)?.unwrap_or($default),
            }
        };
    }

    // Server configuration
    let server_yaml = yaml.server.unwrap_or_default();
    let server = ServerSection {
        host: get_value!("HOST", server_yaml.host, defaults.server.host),
        port: get_number!("PORT", server_yaml.port, defaults.server.port),
        auth_key: env::var("AUTH_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or(server_yaml.auth_key),
    };

    // Session configuration
    let session_yaml = yaml.session.unwrap_or_default();
    let session = SessionSection {
        close_connection_no_voice_time: get_number!(
            "CLOSE_CONNECTION_NO_VOICE_TIME",
            session_yaml.close_connection_no_voice_time,
            defaults.session.close_connection_no_voice_time
        ),
        system_prompt: get_value!(
            "SYSTEM_PROMPT",
            session_yaml.system_prompt,
            defaults.session.system_prompt
        ),
        history_token_budget: session_yaml
            .history_token_budget
            .unwrap_or(defaults.session.history_token_budget),
        max_tool_rounds: session_yaml
            .max_tool_rounds
            .unwrap_or(defaults.session.max_tool_rounds),
        device_id_header: session_yaml
            .device_id_header
            .unwrap_or(defaults.session.device_id_header),
    };

    // Provider selection
    let selected_yaml = yaml.selected_module.unwrap_or_default();
    let selected = &defaults.selected_module;
    let selected_module = SelectedModules {
        vad: get_value!("SELECTED_VAD", selected_yaml.vad, selected.vad),
        asr: get_value!("SELECTED_ASR", selected_yaml.asr, selected.asr),
        llm: get_value!("SELECTED_LLM", selected_yaml.llm, selected.llm),
        tts: get_value!("SELECTED_TTS", selected_yaml.tts, selected.tts),
        memory: get_value!("SELECTED_MEMORY", selected_yaml.memory, selected.memory),
    };

    // VAD thresholds
    let mut vad = defaults.vad;
    if let Some(v) = yaml.vad {
        vad.threshold_high = v.threshold_high.unwrap_or(vad.threshold_high);
        vad.threshold_low = v.threshold_low.unwrap_or(vad.threshold_low);
        vad.window_size = v.window_size.unwrap_or(vad.window_size);
        vad.voiced_frames = v.voiced_frames.unwrap_or(vad.voiced_frames);
        vad.min_silence_ms = v.min_silence_ms.unwrap_or(vad.min_silence_ms);
    }

    // Audio configuration
    let audio_yaml = yaml.audio.unwrap_or_default();
    let output_format = match audio_yaml.output_format {
        Some(format) => {
            CodecTag::from_format(&format).ok_or_else(|| format!("Unsupported output_format: {format}"))?
        }
        None => defaults.audio.output_format,
    };
    let pace_output = match audio_yaml.pace_output {
        Some(v) => v,
        None => env_flag("PACE_OUTPUT")?.unwrap_or(defaults.audio.pace_output),
    };
    let audio = AudioSection {
        framing: audio_yaml.framing.unwrap_or(defaults.audio.framing),
        reorder_depth: audio_yaml.reorder_depth.unwrap_or(defaults.audio.reorder_depth),
        output_format,
        output_sample_rate: audio_yaml
            .output_sample_rate
            .unwrap_or(defaults.audio.output_sample_rate),
        pace_output,
        prebuffer_frames: audio_yaml.prebuffer_frames.unwrap_or(defaults.audio.prebuffer_frames),
    };

    Ok(ServerConfig {
        server,
        session,
        selected_module,
        vad,
        audio,
        interruption: yaml.interruption.unwrap_or(defaults.interruption),
        orchestrator: yaml.orchestrator.unwrap_or(defaults.orchestrator),
        security: yaml.security.unwrap_or(defaults.security),
        transition: yaml.transition.unwrap_or(defaults.transition),
        tracing: yaml.tracing.unwrap_or(defaults.tracing),
        degradation: yaml.degradation.unwrap_or(defaults.degradation),
        features: yaml.features.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_env_vars() {
        unsafe {
            for var in ["HOST", "PORT", "AUTH_KEY", "SELECTED_TTS", "PACE_OUTPUT"] {
                env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_yaml_overrides_env() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "7000");
            env::set_var("SELECTED_TTS", "env-tts");
        }
        let yaml = YamlConfig::from_str("server:\n  port: 7500\nselected_module:\n  tts: yaml-tts\n").unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        assert_eq!(config.server.port, 7500);
        assert_eq!(config.selected_module.tts, "yaml-tts");
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_env_fills_yaml_gaps() {
        cleanup_env_vars();
        unsafe {
            env::set_var("HOST", "127.0.0.1");
        }
        let config = merge_config(Some(YamlConfig::default())).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_auth_key_env_always_wins() {
        cleanup_env_vars();
        unsafe {
            env::set_var("AUTH_KEY", "from-env");
        }
        let yaml = YamlConfig::from_str("server:\n  auth_key: from-yaml\n").unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        assert_eq!(config.server.auth_key.as_deref(), Some("from-env"));
        cleanup_env_vars();

        let yaml = YamlConfig::from_str("server:\n  auth_key: from-yaml\n").unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        assert_eq!(config.server.auth_key.as_deref(), Some("from-yaml"));
    }

    #[test]
    #[serial]
    fn test_audio_and_component_sections() {
        cleanup_env_vars();
        let yaml = YamlConfig::from_str(
            r#"
audio:
  output_format: pcm16
  prebuffer_frames: 0
security:
  strict: true
  allowed_tools: [get_weather]
orchestrator:
  max_concurrency: 2
"#,
        )
        .unwrap();
        let config = merge_config(Some(yaml)).unwrap();
        assert_eq!(config.audio.output_format, CodecTag::Pcm16);
        assert_eq!(config.audio.prebuffer_frames, 0);
        assert!(config.security.strict);
        assert_eq!(config.security.confirm_timeout_secs, 30);
        assert_eq!(config.orchestrator.max_concurrency, Some(2));
        assert_eq!(config.orchestrator.task_timeout_secs, 30);
    }

    #[test]
    #[serial]
    fn test_unknown_output_format() {
        cleanup_env_vars();
        let yaml = YamlConfig::from_str("audio:\n  output_format: mp3\n").unwrap();
        assert!(merge_config(Some(yaml)).is_err());
    }
}
