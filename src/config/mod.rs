//! # Stage: Declarative Engine Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that drives the whole cascade: operating
//! mode, tier thresholds, cache TTLs, backend endpoints, budget caps, queue
//! sizing, jury weights and shadow-test margins.
//! ```text
//! moderation-engine --config engine.toml analyze "some text"
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EngineConfig`
//! - Complete: every field has a documented default, so an empty file is valid
//! - Validated: semantic constraints are checked before a config is accepted
//! - Read once at start; there is no hot reload
//!
//! ## NOT Responsible For
//! - Building backends from config (that belongs to `models`)
//! - Enforcing budgets (that belongs to `budget`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── Default value functions ──────────────────────────────────────────────

fn default_engine_name() -> String {
    "moderation".to_string()
}

fn default_rule_min_length() -> usize {
    2
}

fn default_rule_score() -> u8 {
    10
}

fn default_low_value_keywords() -> Vec<String> {
    ["first", "1st", "沙发", "前排", "打卡", "来了", "+1", "顶"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cache_max_entries() -> usize {
    100_000
}

/// 30 days.
fn default_exact_ttl_s() -> u64 {
    30 * 24 * 3600
}

/// 7 days.
fn default_semantic_ttl_s() -> u64 {
    7 * 24 * 3600
}

fn default_semantic_min_length() -> usize {
    6
}

fn default_semantic_dims() -> usize {
    16
}

fn default_semantic_precision() -> u32 {
    2
}

fn default_semantic_thresholds() -> Vec<f64> {
    vec![0.95, 0.90, 0.85]
}

fn default_embedding_dim() -> usize {
    64
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    256
}

fn default_confidence_threshold() -> f64 {
    0.55
}

fn default_escalation_min_length() -> usize {
    50
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_queue_workers() -> usize {
    2
}

fn default_batch_window_ms() -> u64 {
    200
}

fn default_max_batch() -> usize {
    32
}

fn default_conflict_threshold() -> f64 {
    0.2
}

fn default_expert_timeout_ms() -> u64 {
    15_000
}

fn default_judge_timeout_ms() -> u64 {
    20_000
}

fn default_highlight_threshold() -> u8 {
    80
}

fn default_inappropriate_threshold() -> u8 {
    20
}

fn default_sample_limit() -> usize {
    50
}

fn default_publish_margin() -> f64 {
    0.02
}

fn default_mae_margin() -> f64 {
    1.0
}

fn default_monitor_band() -> f64 {
    0.02
}

fn default_monitor_mae_band() -> f64 {
    2.0
}

fn default_consistency_tolerance() -> u8 {
    10
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an engine instance.
///
/// # Example
///
/// ```toml
/// [engine]
/// mode = "hybrid"
///
/// [models.cloud]
/// name = "gpt-4o-mini"
/// base_url = "https://api.openai.com/v1"
///
/// [budget]
/// per_subject_max_calls = 200
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity and operating mode.
    pub engine: EngineSection,
    /// Rule filter settings.
    pub rules: RulesConfig,
    /// Exact and semantic cache settings.
    pub cache: CacheConfig,
    /// Backend endpoints.
    pub models: ModelsConfig,
    /// Local → cloud escalation policy.
    pub escalation: EscalationConfig,
    /// Paid-inference caps.
    pub budget: BudgetConfig,
    /// Batch queue sizing.
    pub queue: QueueConfig,
    /// Multi-agent jury settings.
    pub jury: JuryConfig,
    /// Score thresholds for the highlight / inappropriate flags.
    pub verdict: VerdictConfig,
    /// Prompt shadow-test margins.
    pub shadow: ShadowConfig,
    /// Decision-trace retention.
    pub trace: TraceConfig,
    /// Prompt store bootstrap.
    pub prompts: PromptsConfig,
    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Which backends the cascade may call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// No model tier; anything past the caches gets an `llm_off` default.
    Off,
    /// Local backend only.
    LocalOnly,
    /// Cloud backend only.
    CloudOnly,
    /// Local first, cloud as fallback and escalation target.
    #[default]
    Hybrid,
}

/// Engine identity and operating mode.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    /// Human-readable instance name, used in logs.
    pub name: String,
    /// Operating mode.
    pub mode: OperatingMode,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            mode: OperatingMode::default(),
        }
    }
}

/// Rule filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RulesConfig {
    /// Texts with fewer characters than this are filtered.
    pub min_length: usize,
    /// Score assigned to rule-filtered texts.
    pub score: u8,
    /// Low-value phrases, compared after normalization.
    pub low_value_keywords: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            min_length: default_rule_min_length(),
            score: default_rule_score(),
            low_value_keywords: default_low_value_keywords(),
        }
    }
}

/// Source of embeddings for the semantic cache.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingKind {
    /// No embedder; the semantic tier is skipped.
    None,
    /// Built-in deterministic hashing embedder.
    #[default]
    Hashing,
}

/// Cache tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity of the in-memory store (0 = unbounded). The entry closest
    /// to expiry is evicted first.
    pub max_entries: usize,
    /// Redis URL; requires the `caching` feature. `None` uses memory.
    pub redis_url: Option<String>,
    /// Exact-cache TTL in seconds.
    pub exact_ttl_s: u64,
    /// Whether the semantic tier is consulted at all.
    pub semantic_enabled: bool,
    /// Semantic-cache TTL in seconds. Should not exceed `exact_ttl_s`.
    pub semantic_ttl_s: u64,
    /// Texts shorter than this (in chars) skip the semantic tier.
    pub semantic_min_length: usize,
    /// Number of leading embedding dimensions used in the bucket key.
    pub semantic_dims: usize,
    /// Decimal places kept for the primary (tightest) bucket.
    pub semantic_precision: u32,
    /// Probe thresholds, tightest first. Each maps to one bucket.
    pub semantic_thresholds: Vec<f64>,
    /// Also write results into the looser buckets.
    pub semantic_write_all_buckets: bool,
    /// Embedding source.
    pub embedding: EmbeddingKind,
    /// Dimension of the built-in hashing embedder.
    pub embedding_dim: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            redis_url: None,
            exact_ttl_s: default_exact_ttl_s(),
            semantic_enabled: true,
            semantic_ttl_s: default_semantic_ttl_s(),
            semantic_min_length: default_semantic_min_length(),
            semantic_dims: default_semantic_dims(),
            semantic_precision: default_semantic_precision(),
            semantic_thresholds: default_semantic_thresholds(),
            semantic_write_all_buckets: false,
            embedding: EmbeddingKind::default(),
            embedding_dim: default_embedding_dim(),
        }
    }
}

/// Endpoint settings for one backend.
///
/// Unset `timeout_ms` and `max_concurrency` fall back to per-backend
/// defaults (local: 8 s / 1, cloud: 20 s / 8).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Model identifier sent in the request body.
    pub name: String,
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    /// Bearer token. Falls back to `MODERATION_{LOCAL,CLOUD}_API_KEY`.
    pub api_key: Option<String>,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Maximum in-flight calls to this backend.
    pub max_concurrency: Option<usize>,
}

/// Both backends plus shared generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    /// Local (self-hosted) backend.
    pub local: BackendConfig,
    /// Cloud (paid) backend.
    pub cloud: BackendConfig,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            local: BackendConfig {
                name: "qwen2.5:3b-instruct".to_string(),
                base_url: "http://localhost:11434/v1".to_string(),
                ..BackendConfig::default()
            },
            cloud: BackendConfig {
                name: "gpt-4o-mini".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                ..BackendConfig::default()
            },
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Local → cloud escalation policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EscalationConfig {
    /// Whether low-confidence local verdicts are re-run on the cloud.
    pub enabled: bool,
    /// Local confidence strictly below this triggers escalation.
    pub confidence_threshold: f64,
    /// Minimum content length (chars) for escalation.
    pub min_length: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_confidence_threshold(),
            min_length: default_escalation_min_length(),
        }
    }
}

/// Paid-inference caps. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Lifetime cloud calls per subject.
    pub per_subject_max_calls: Option<u64>,
    /// Lifetime cloud chars per subject.
    pub per_subject_max_chars: Option<u64>,
    /// Cloud calls per UTC hour, all subjects.
    pub global_hourly_calls: Option<u64>,
    /// Cloud chars per UTC hour, all subjects.
    pub global_hourly_chars: Option<u64>,
    /// Cloud calls per UTC day, all subjects.
    pub global_daily_calls: Option<u64>,
    /// Cloud chars per UTC day, all subjects.
    pub global_daily_chars: Option<u64>,
}

/// Batch queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued items; enqueue sheds beyond this.
    pub capacity: usize,
    /// Number of worker loops.
    pub workers: usize,
    /// How long a worker keeps collecting after the first item.
    pub batch_window_ms: u64,
    /// Maximum items per batch.
    pub max_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            workers: default_queue_workers(),
            batch_window_ms: default_batch_window_ms(),
            max_batch: default_max_batch(),
        }
    }
}

/// Relative weight of each jury expert.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct JuryWeights {
    /// Content quality expert.
    pub quality: f64,
    /// Safety / compliance expert.
    pub safety: f64,
    /// Community engagement expert.
    pub engagement: f64,
}

impl Default for JuryWeights {
    fn default() -> Self {
        Self {
            quality: 0.40,
            safety: 0.35,
            engagement: 0.25,
        }
    }
}

/// Multi-agent jury settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct JuryConfig {
    /// Whether the jury can run at all.
    pub enabled: bool,
    /// Run the jury automatically for `high` priority requests.
    pub auto_for_high_priority: bool,
    /// Score spread, as a fraction of the 0–100 range, above which experts conflict.
    pub conflict_threshold: f64,
    /// Per-expert timeout.
    pub expert_timeout_ms: u64,
    /// Judge timeout.
    pub judge_timeout_ms: u64,
    /// Expert weights.
    pub weights: JuryWeights,
}

impl Default for JuryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_for_high_priority: false,
            conflict_threshold: default_conflict_threshold(),
            expert_timeout_ms: default_expert_timeout_ms(),
            judge_timeout_ms: default_judge_timeout_ms(),
            weights: JuryWeights::default(),
        }
    }
}

/// Thresholds turning a score into flags.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct VerdictConfig {
    /// Scores at or above this are highlights.
    pub highlight_threshold: u8,
    /// Scores at or below this are inappropriate.
    pub inappropriate_threshold: u8,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            highlight_threshold: default_highlight_threshold(),
            inappropriate_threshold: default_inappropriate_threshold(),
        }
    }
}

/// Prompt shadow-test margins.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ShadowConfig {
    /// Sample limit when the caller passes 0.
    pub default_sample_limit: usize,
    /// Match-rate gain required to recommend publishing.
    pub publish_margin: f64,
    /// MAE reduction (score points) required to recommend publishing.
    pub mae_margin: f64,
    /// Match-rate delta considered "no change".
    pub monitor_band: f64,
    /// MAE delta considered "no change".
    pub monitor_mae_band: f64,
    /// Max score difference for candidate and active to count as agreeing.
    pub consistency_tolerance: u8,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            default_sample_limit: default_sample_limit(),
            publish_margin: default_publish_margin(),
            mae_margin: default_mae_margin(),
            monitor_band: default_monitor_band(),
            monitor_mae_band: default_monitor_mae_band(),
            consistency_tolerance: default_consistency_tolerance(),
        }
    }
}

/// Which results keep their decision trace.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceRetention {
    /// Every result keeps its trace.
    #[default]
    All,
    /// Rule and cache results drop their trace; model, jury and default results keep it.
    ModelTiers,
}

/// Decision-trace settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct TraceConfig {
    /// Retention policy.
    pub retention: TraceRetention,
}

/// Prompt store bootstrap and persistence.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PromptsConfig {
    /// Seed one active version per content type from the built-in cloud prompts.
    pub seed_builtin: bool,
    /// JSON file holding prompt versions and experiments across restarts.
    /// Unset keeps them in memory only.
    pub store_path: Option<PathBuf>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            seed_builtin: default_true(),
            store_path: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Value understood by the `LOG_FORMAT` environment variable.
    pub fn as_env_value(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

/// Export the JSON Schema for `EngineConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EngineConfig);
    serde_json::to_string_pretty(&schema)
}
