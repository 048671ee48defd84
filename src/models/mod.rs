//! # Stage: Model Registry
//!
//! ## Responsibility
//! Turn the `[models]` section and the operating mode into one
//! [`ModelConfig`] per backend class, and answer which backends may be
//! called, in which order.
//!
//! ## Guarantees
//! - Immutable after construction
//! - `text_model_priority()` only lists enabled backends whose required
//!   fields are present
//! - Hybrid mode always orders local before cloud
//!
//! ## NOT Responsible For
//! - Making HTTP calls (that belongs to `invoker`)
//! - Escalation policy (that belongs to the orchestrator)

pub mod extract;
pub mod invoker;
pub mod prompts;

pub use invoker::{ChatInvoker, InvokeRequest, ModelInvoker, ModelVerdict};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{BackendConfig, EngineConfig, OperatingMode};

/// Backend class. Closed set: local (self-hosted) and cloud (paid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    /// Self-hosted model, free per call but weaker.
    #[serde(rename = "local_text")]
    Local,
    /// Paid hosted model, metered by the budget governor.
    #[serde(rename = "cloud_text")]
    Cloud,
}

impl ModelKind {
    /// Both kinds, in hybrid call order.
    pub const ALL: [ModelKind; 2] = [ModelKind::Local, ModelKind::Cloud];

    /// Short label used as the `backend` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Local => "local",
            ModelKind::Cloud => "cloud",
        }
    }

    fn index(self) -> usize {
        match self {
            ModelKind::Local => 0,
            ModelKind::Cloud => 1,
        }
    }

    fn default_timeout(self) -> Duration {
        match self {
            ModelKind::Local => Duration::from_secs(8),
            ModelKind::Cloud => Duration::from_secs(20),
        }
    }

    fn default_concurrency(self) -> usize {
        match self {
            ModelKind::Local => 1,
            ModelKind::Cloud => 8,
        }
    }

    fn api_key_env(self) -> &'static str {
        match self {
            ModelKind::Local => "MODERATION_LOCAL_API_KEY",
            ModelKind::Cloud => "MODERATION_CLOUD_API_KEY",
        }
    }
}

/// Which backends a scoring run may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    /// Registry priority order, first success wins.
    #[default]
    Auto,
    /// Local backend only.
    Local,
    /// Cloud backend only.
    Cloud,
}

impl ModelSource {
    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::Auto => "auto",
            ModelSource::Local => "local",
            ModelSource::Cloud => "cloud",
        }
    }

    /// Whether this selection allows calling `kind`.
    pub fn admits(&self, kind: ModelKind) -> bool {
        match self {
            ModelSource::Auto => true,
            ModelSource::Local => kind == ModelKind::Local,
            ModelSource::Cloud => kind == ModelKind::Cloud,
        }
    }

    /// Kinds to try, in order, out of `available`.
    pub fn candidates(&self, available: &[ModelKind]) -> Vec<ModelKind> {
        available
            .iter()
            .copied()
            .filter(|k| self.admits(*k))
            .collect()
    }
}

impl std::str::FromStr for ModelSource {
    type Err = crate::ModerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ModelSource::Auto),
            "local" => Ok(ModelSource::Local),
            "cloud" => Ok(ModelSource::Cloud),
            other => Err(crate::ModerationError::Other(format!(
                "unknown model source '{other}'"
            ))),
        }
    }
}

/// Resolved settings for one backend.
#[derive(Clone, PartialEq)]
pub struct ModelConfig {
    /// Backend class.
    pub kind: ModelKind,
    /// Model identifier sent in requests.
    pub name: String,
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Bearer token, if any.
    pub api_key: Option<String>,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Maximum in-flight calls.
    pub max_concurrency: usize,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl ModelConfig {
    /// Resolve a `[models.*]` section, applying per-kind defaults.
    ///
    /// `api_key` falls back to `env_key` when the section leaves it unset.
    pub fn resolve(kind: ModelKind, section: &BackendConfig, env_key: Option<String>) -> Self {
        Self {
            kind,
            name: section.name.trim().to_string(),
            base_url: section.base_url.trim().trim_end_matches('/').to_string(),
            api_key: section
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .or(env_key.filter(|k| !k.trim().is_empty())),
            timeout: section
                .timeout_ms
                .map_or_else(|| kind.default_timeout(), Duration::from_millis),
            max_concurrency: section
                .max_concurrency
                .unwrap_or_else(|| kind.default_concurrency())
                .max(1),
        }
    }

    /// Required fields are present: name and base URL, plus an API key for
    /// the cloud backend.
    pub fn is_complete(&self) -> bool {
        let base = !self.name.is_empty() && !self.base_url.is_empty();
        match self.kind {
            ModelKind::Local => base,
            ModelKind::Cloud => base && self.api_key.is_some(),
        }
    }
}

/// Catalog of backends, indexed by [`ModelKind`].
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    mode: OperatingMode,
    models: [ModelConfig; 2],
}

impl ModelRegistry {
    /// Registry over explicit configs.
    pub fn new(mode: OperatingMode, local: ModelConfig, cloud: ModelConfig) -> Self {
        Self {
            mode,
            models: [
                ModelConfig {
                    kind: ModelKind::Local,
                    ..local
                },
                ModelConfig {
                    kind: ModelKind::Cloud,
                    ..cloud
                },
            ],
        }
    }

    /// Registry from the engine config, reading API key fallbacks from the
    /// environment.
    pub fn from_config(config: &EngineConfig) -> Self {
        let local = ModelConfig::resolve(
            ModelKind::Local,
            &config.models.local,
            std::env::var(ModelKind::Local.api_key_env()).ok(),
        );
        let cloud = ModelConfig::resolve(
            ModelKind::Cloud,
            &config.models.cloud,
            std::env::var(ModelKind::Cloud.api_key_env()).ok(),
        );
        Self::new(config.engine.mode, local, cloud)
    }

    /// Operating mode.
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Settings for `kind`.
    pub fn config(&self, kind: ModelKind) -> &ModelConfig {
        &self.models[kind.index()]
    }

    /// Whether the operating mode allows `kind` at all.
    pub fn is_enabled(&self, kind: ModelKind) -> bool {
        match self.mode {
            OperatingMode::Off => false,
            OperatingMode::LocalOnly => kind == ModelKind::Local,
            OperatingMode::CloudOnly => kind == ModelKind::Cloud,
            OperatingMode::Hybrid => true,
        }
    }

    /// Enabled and fully configured.
    pub fn is_available(&self, kind: ModelKind) -> bool {
        self.is_enabled(kind) && self.config(kind).is_complete()
    }

    /// Available kinds in call order.
    pub fn text_model_priority(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|k| self.is_available(*k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, url: &str, key: Option<&str>) -> BackendConfig {
        BackendConfig {
            name: name.into(),
            base_url: url.into(),
            api_key: key.map(String::from),
            ..BackendConfig::default()
        }
    }

    fn registry(mode: OperatingMode, cloud_key: Option<&str>) -> ModelRegistry {
        ModelRegistry::new(
            mode,
            ModelConfig::resolve(ModelKind::Local, &backend("qwen", "http://l/v1", None), None),
            ModelConfig::resolve(
                ModelKind::Cloud,
                &backend("gpt", "http://c/v1", cloud_key),
                None,
            ),
        )
    }

    #[test]
    fn test_resolve_applies_kind_defaults() {
        let local = ModelConfig::resolve(ModelKind::Local, &backend("m", "u", None), None);
        assert_eq!(local.timeout, Duration::from_secs(8));
        assert_eq!(local.max_concurrency, 1);
        let cloud = ModelConfig::resolve(ModelKind::Cloud, &backend("m", "u", None), None);
        assert_eq!(cloud.timeout, Duration::from_secs(20));
        assert_eq!(cloud.max_concurrency, 8);
    }

    #[test]
    fn test_resolve_env_key_fallback_and_precedence() {
        let from_env = ModelConfig::resolve(
            ModelKind::Cloud,
            &backend("m", "u", None),
            Some("env-key".into()),
        );
        assert_eq!(from_env.api_key.as_deref(), Some("env-key"));

        let from_file = ModelConfig::resolve(
            ModelKind::Cloud,
            &backend("m", "u", Some("file-key")),
            Some("env-key".into()),
        );
        assert_eq!(from_file.api_key.as_deref(), Some("file-key"));
    }

    #[test]
    fn test_resolve_strips_trailing_slash() {
        let c = ModelConfig::resolve(ModelKind::Local, &backend("m", "http://x/v1/", None), None);
        assert_eq!(c.base_url, "http://x/v1");
    }

    #[test]
    fn test_hybrid_orders_local_first() {
        let r = registry(OperatingMode::Hybrid, Some("k"));
        assert_eq!(r.text_model_priority(), vec![ModelKind::Local, ModelKind::Cloud]);
    }

    #[test]
    fn test_cloud_without_key_is_unavailable() {
        let r = registry(OperatingMode::Hybrid, None);
        assert!(!r.is_available(ModelKind::Cloud));
        assert_eq!(r.text_model_priority(), vec![ModelKind::Local]);
    }

    #[test]
    fn test_mode_filters_kinds() {
        assert_eq!(
            registry(OperatingMode::LocalOnly, Some("k")).text_model_priority(),
            vec![ModelKind::Local]
        );
        assert_eq!(
            registry(OperatingMode::CloudOnly, Some("k")).text_model_priority(),
            vec![ModelKind::Cloud]
        );
        assert!(registry(OperatingMode::Off, Some("k"))
            .text_model_priority()
            .is_empty());
    }

    #[test]
    fn test_model_source_candidates() {
        let available = registry(OperatingMode::Hybrid, Some("k")).text_model_priority();
        assert_eq!(
            ModelSource::Auto.candidates(&available),
            vec![ModelKind::Local, ModelKind::Cloud]
        );
        assert_eq!(ModelSource::Cloud.candidates(&available), vec![ModelKind::Cloud]);
        let no_key = registry(OperatingMode::Hybrid, None).text_model_priority();
        assert!(ModelSource::Cloud.candidates(&no_key).is_empty());
        assert!(ModelSource::Local.candidates(&[ModelKind::Cloud]).is_empty());
        assert_eq!("LOCAL".parse::<ModelSource>().ok(), Some(ModelSource::Local));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let r = registry(OperatingMode::Hybrid, Some("secret-token"));
        let dbg = format!("{:?}", r.config(ModelKind::Cloud));
        assert!(!dbg.contains("secret-token"));
    }

    #[test]
    fn test_kind_serializes_with_text_suffix() {
        let json = serde_json::to_string(&ModelKind::Cloud).expect("test: serialize");
        assert_eq!(json, "\"cloud_text\"");
    }
}
