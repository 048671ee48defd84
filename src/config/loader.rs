//! Reading engine configuration from TOML.
//!
//! Every path through this module ends in [`validation::validate`], so a
//! returned [`EngineConfig`] is always usable as-is. Errors carry the file
//! name (or the caller-supplied source name for in-memory input).

use std::path::Path;

use tracing::debug;

use super::validation::{self, ConfigError};
use super::EngineConfig;

/// Load and validate the engine configuration, or use the defaults when no
/// file is given.
///
/// # Errors
///
/// See [`load_from_file`].
pub fn load(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(path) => load_from_file(path),
        None => {
            debug!("no config file given, using built-in defaults");
            Ok(EngineConfig::default())
        }
    }
}

/// Load and validate a TOML config file.
///
/// # Errors
///
/// [`ConfigError::Io`] when the file is unreadable, [`ConfigError::Parse`]
/// for malformed TOML or unknown enum values, [`ConfigError::Validation`]
/// listing every out-of-range field.
pub fn load_from_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let file = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        file: file.clone(),
        source,
    })?;
    let config = load_from_str(&text, &file)?;
    debug!(file = %file, mode = ?config.engine.mode, "engine config loaded");
    Ok(config)
}

/// Parse and validate TOML held in memory. `source_name` labels errors.
pub fn load_from_str(text: &str, source_name: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
        file: source_name.to_string(),
        source,
    })?;

    if let Err(problems) = validation::validate(&config) {
        let lines: Vec<String> = problems.iter().map(ToString::to_string).collect();
        return Err(ConfigError::Validation(lines.join("\n")));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatingMode;

    const HYBRID_DEPLOYMENT: &str = r#"
[engine]
name = "comments-eu"
mode = "hybrid"

[models.local]
name = "qwen2.5:3b-instruct"
base_url = "http://localhost:11434/v1"

[models.cloud]
name = "gpt-4o-mini"
base_url = "https://api.openai.com/v1"
timeout_ms = 20000

[escalation]
confidence_threshold = 0.55
min_length = 50

[budget]
per_subject_max_calls = 100
global_daily_calls = 10000

[queue]
workers = 4
"#;

    #[test]
    fn test_hybrid_deployment_parses() {
        let config = load_from_str(HYBRID_DEPLOYMENT, "inline").expect("test: parses");
        assert_eq!(config.engine.name, "comments-eu");
        assert_eq!(config.engine.mode, OperatingMode::Hybrid);
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.budget.global_daily_calls, Some(10000));
    }

    #[test]
    fn test_blank_input_means_defaults() {
        assert_eq!(load_from_str("", "blank").expect("test: blank"), EngineConfig::default());
        assert_eq!(load(None).expect("test: none"), EngineConfig::default());
    }

    #[test]
    fn test_unknown_mode_is_a_parse_error() {
        let err = load_from_str("[engine]\nmode = \"sometimes\"\n", "mode.toml")
            .expect_err("test: rejected");
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("mode.toml"));
    }

    #[test]
    fn test_semantic_ttl_longer_than_exact_is_rejected() {
        let err = load_from_str("[cache]\nexact_ttl_s = 100\nsemantic_ttl_s = 200\n", "ttl")
            .expect_err("test: rejected");
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("cache.semantic_ttl_s"));
    }

    #[test]
    fn test_file_on_disk_round_trips_through_load() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, HYBRID_DEPLOYMENT).expect("test: write");

        let config = load(Some(&path)).expect("test: load");
        assert_eq!(config.budget.per_subject_max_calls, Some(100));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = load_from_file(Path::new("/nonexistent/moderation/engine.toml"))
            .expect_err("test: missing");
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_out_of_range_temperature_is_rejected_from_disk() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("hot.toml");
        std::fs::write(&path, "[models]\ntemperature = 5.0\n").expect("test: write");

        let err = load_from_file(&path).expect_err("test: rejected");
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
