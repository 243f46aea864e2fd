use super::ServerConfig;
use crate::core::codec::CodecTag;
use crate::core::observability::FeatureFlags;
use crate::core::providers::ProviderRegistry;

/// Validate a merged configuration against the provider registry
///
/// Checks that:
/// - every `selected_module` entry names a registered provider
/// - VAD thresholds satisfy `0 <= low < high <= 1`
/// - feature flag names are known and their combination is consistent
pub fn validate(config: &ServerConfig, registry: &ProviderRegistry) -> Result<(), Box<dyn std::error::Error>> {
    validate_selected_modules(config, registry)?;
    validate_vad_thresholds(config.vad.threshold_low, config.vad.threshold_high)?;
    FeatureFlags::from_config(&config.features).map_err(|e| format!("Invalid features section: {e}"))?;

    if config.session.max_tool_rounds == 0 {
        return Err("session.max_tool_rounds must be at least 1".into());
    }
    if config.audio.output_format == CodecTag::Opus && !cfg!(feature = "opus") {
        return Err("audio.output_format is opus but the server was built without the opus feature".into());
    }
    if config.audio.output_sample_rate == 0 {
        return Err("audio.output_sample_rate must be positive".into());
    }
    Ok(())
}

fn validate_selected_modules(
    config: &ServerConfig,
    registry: &ProviderRegistry,
) -> Result<(), Box<dyn std::error::Error>> {
    let missing = registry.missing(&config.selected_module);
    if missing.is_empty() {
        return Ok(());
    }
    let listed: Vec<String> = missing
        .iter()
        .map(|(kind, name)| format!("{kind} '{name}' (available: {})", registry.names(*kind).join(", ")))
        .collect();
    Err(format!("Unknown selected_module entries: {}", listed.join("; ")).into())
}

fn validate_vad_thresholds(low: f32, high: f32) -> Result<(), Box<dyn std::error::Error>> {
    if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
        return Err(format!("VAD thresholds must satisfy 0 <= low < high <= 1 (low={low}, high={high})").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::providers::ProviderKind;

    #[test]
    fn test_default_config_is_valid() {
        let registry = ProviderRegistry::with_dev_providers();
        assert!(validate(&ServerConfig::default(), &registry).is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let registry = ProviderRegistry::with_dev_providers();
        let mut config = ServerConfig::default();
        config.selected_module.llm = "nonexistent".to_string();
        let err = validate(&config, &registry).unwrap_err().to_string();
        assert!(err.contains(ProviderKind::Llm.as_str()));
        assert!(err.contains("nonexistent"));
    }

    #[test]
    fn test_vad_thresholds() {
        assert!(validate_vad_thresholds(0.2, 0.5).is_ok());
        assert!(validate_vad_thresholds(0.5, 0.5).is_err());
        assert!(validate_vad_thresholds(-0.1, 0.5).is_err());
        assert!(validate_vad_thresholds(0.2, 1.5).is_err());
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let registry = ProviderRegistry::with_dev_providers();
        let mut config = ServerConfig::default();
        config.features.insert("warp_drive".to_string(), true);
        assert!(validate(&config, &registry).is_err());
    }
}
