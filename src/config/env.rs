use std::env;

use super::ServerConfig;
use super::merge::merge_config;

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// # Errors
    /// Returns an error if an environment variable is malformed.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();
        merge_config(None)
    }
}

/// Parse an optional numeric environment variable.
pub(super) fn env_number<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid {name} environment variable: {e}").into()),
        Err(_) => Ok(None),
    }
}

/// Parse an optional on/off environment variable (`true/false`, `1/0`,
/// `yes/no` or `on/off`).
pub(super) fn env_flag(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(format!("Invalid {name} value: {raw}").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_env_vars() {
        unsafe {
            for var in [
                "HOST",
                "PORT",
                "AUTH_KEY",
                "SELECTED_VAD",
                "SELECTED_ASR",
                "SELECTED_LLM",
                "SELECTED_TTS",
                "SELECTED_MEMORY",
                "CLOSE_CONNECTION_NO_VOICE_TIME",
                "PACE_OUTPUT",
            ] {
                env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.selected_module.llm, "echo");
        assert!(config.audio.pace_output);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "9100");
            env::set_var("AUTH_KEY", "secret");
            env::set_var("SELECTED_LLM", "openai");
            env::set_var("CLOSE_CONNECTION_NO_VOICE_TIME", "30");
            env::set_var("PACE_OUTPUT", "no");
        }
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.auth_key.as_deref(), Some("secret"));
        assert_eq!(config.selected_module.llm, "openai");
        assert_eq!(config.session.idle_limit_secs(), 90);
        assert!(!config.audio.pace_output);
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_pace_output_flag_spellings() {
        cleanup_env_vars();
        for (raw, expected) in [("ON", true), (" 1 ", true), ("off", false), ("False", false)] {
            unsafe {
                env::set_var("PACE_OUTPUT", raw);
            }
            assert_eq!(ServerConfig::from_env().unwrap().audio.pace_output, expected, "{raw}");
        }
        unsafe {
            env::set_var("PACE_OUTPUT", "sometimes");
        }
        assert!(ServerConfig::from_env().is_err());
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_port() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "not-a-port");
        }
        assert!(ServerConfig::from_env().is_err());
        cleanup_env_vars();
    }
}
