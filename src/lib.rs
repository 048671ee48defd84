//! # tokio-moderation-orchestrator
//!
//! A cost-aware content moderation cascade over Tokio.
//!
//! ## Architecture
//!
//! Tiers run cheapest first and the first one to produce a verdict wins:
//! ```text
//! ContentItem → RuleFilter → ExactCache → SemanticCache → Local [→ Cloud] → (Jury) → Default
//!                                                              ↑
//!                                                       BudgetGovernor
//! ```
//! Bursty traffic goes through the [`queue::BatchQueue`], which groups
//! duplicates so they share one [`DecisionOrchestrator::analyze`] call.
//! New prompt versions are validated offline by the [`shadow::ShadowHarness`]
//! before they are published.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod budget;
pub mod cache;
pub mod config;
pub mod jury;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod queue;
pub mod rules;
pub mod shadow;
pub mod types;

// Re-exports for convenience
pub use budget::{BudgetGovernor, UsageSnapshot};
pub use config::EngineConfig;
pub use models::{ChatInvoker, ModelInvoker, ModelKind, ModelRegistry, ModelVerdict};
pub use orchestrator::{AnalyzeRequest, DecisionOrchestrator};
pub use queue::{BatchQueue, ContentStore, EnqueueOutcome, MemoryContentStore, QueueSupervisor};
pub use shadow::{ModelSource, Recommendation, ShadowHarness};
pub use types::{
    AnalysisResult, ContentItem, ContentType, DecisionTrace, Priority, ResultSource, Tier,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`ModerationError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use tokio_moderation_orchestrator::{init_tracing, ModerationError};
/// # fn example() -> Result<(), ModerationError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), ModerationError> {
    init_tracing_with(config::LogFormat::Pretty)
}

/// Like [`init_tracing`], falling back to `default_format` (usually
/// `observability.log_format`) when `LOG_FORMAT` is unset.
///
/// # Errors
///
/// Returns [`ModerationError::Other`] if the global subscriber has already
/// been set.
pub fn init_tracing_with(default_format: config::LogFormat) -> Result<(), ModerationError> {
    let format = std::env::var("LOG_FORMAT")
        .unwrap_or_else(|_| default_format.as_env_value().to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| ModerationError::Other(format!("tracing init failed: {e}")))
}

/// Top-level engine errors.
///
/// Inference, cache and budget problems never surface here: those tiers
/// abstain instead. Only startup misconfiguration, storage write-back and
/// prompt-harness lookups return an error.
#[derive(Error, Debug)]
pub enum ModerationError {
    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first analysis call.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The content store failed to read or update an item.
    #[error("storage error: {0}")]
    Storage(String),

    /// No prompt version exists with the given id.
    #[error("prompt version {0} not found")]
    PromptNotFound(i64),

    /// A content type has no active prompt version to compare against.
    #[error("no active prompt version for content type '{0}'")]
    NoActivePrompt(types::ContentType),

    /// A labeled dataset could not be read or parsed.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl From<config::validation::ConfigError> for ModerationError {
    fn from(e: config::validation::ConfigError) -> Self {
        ModerationError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_includes_message() {
        let err = ModerationError::ConfigError("cloud api_key not set".to_string());
        assert!(err.to_string().contains("cloud api_key not set"));
    }

    #[test]
    fn test_no_active_prompt_names_content_type() {
        let err = ModerationError::NoActivePrompt(ContentType::Danmaku);
        assert!(err.to_string().contains("danmaku"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: ModerationError =
            config::validation::ConfigError::Validation("bad ttl".into()).into();
        assert!(matches!(err, ModerationError::ConfigError(ref m) if m.contains("bad ttl")));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order.
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
