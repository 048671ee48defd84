//! Core data model shared by every tier of the cascade.
//!
//! Results, traces and queue items are plain serde types so they can be
//! cached as JSON and handed to the storage layer without translation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ModerationError;

/// Kind of user-generated content being scored.
///
/// Each kind has its own prompt family and its own active prompt version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Long-lived comment under a post or video.
    Comment,
    /// Short time-synchronised overlay comment ("danmaku").
    Danmaku,
}

impl ContentType {
    /// All content types, in a stable order.
    pub const ALL: [ContentType; 2] = [ContentType::Comment, ContentType::Danmaku];

    /// Stable lowercase identifier used in cache keys, metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Comment => "comment",
            ContentType::Danmaku => "danmaku",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = ModerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "comment" => Ok(ContentType::Comment),
            "danmaku" => Ok(ContentType::Danmaku),
            other => Err(ModerationError::Other(format!(
                "unknown content type '{other}'"
            ))),
        }
    }
}

/// Request priority levels for queued analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work, drained last.
    Low = 0,
    /// Standard priority for most items.
    #[default]
    Normal = 1,
    /// Drained before `Normal` and `Low`.
    High = 2,
}

impl Priority {
    /// Parse a priority level from a name string (`"low"`, `"normal"`, `"high"`).
    ///
    /// Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }

    /// Lowercase label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// A single item handed over by the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Storage-layer identifier.
    pub id: String,
    /// Kind of content.
    pub content_type: ContentType,
    /// Raw user text.
    pub text: String,
}

/// Which tier produced an [`AnalysisResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Deterministic rule filter.
    Rule,
    /// Exact-content cache hit.
    CacheExact,
    /// Embedding-bucket cache hit.
    CacheSemantic,
    /// Local model backend.
    LocalModel,
    /// Cloud LLM backend.
    CloudLlm,
    /// Multi-agent jury.
    MultiAgent,
    /// No tier produced a verdict.
    Default,
}

impl ResultSource {
    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Rule => "rule",
            ResultSource::CacheExact => "cache_exact",
            ResultSource::CacheSemantic => "cache_semantic",
            ResultSource::LocalModel => "local_model",
            ResultSource::CloudLlm => "cloud_llm",
            ResultSource::MultiAgent => "multi_agent",
            ResultSource::Default => "default",
        }
    }
}

/// One stage of the decision cascade, as recorded in a [`DecisionTrace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Rule filter evaluation.
    RuleFilter,
    /// Exact cache lookup.
    ExactCache,
    /// Semantic cache lookup.
    SemanticCache,
    /// Local model invocation.
    LocalModel,
    /// Decision to re-run a low-confidence local verdict on the cloud.
    Escalation,
    /// Cloud model invocation.
    CloudModel,
    /// Budget governor decision.
    Budget,
    /// Multi-agent jury.
    Jury,
    /// Fallback default result.
    Default,
}

impl Tier {
    /// Stable snake_case label, used as the `tier` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::RuleFilter => "rule_filter",
            Tier::ExactCache => "exact_cache",
            Tier::SemanticCache => "semantic_cache",
            Tier::LocalModel => "local_model",
            Tier::Escalation => "escalation",
            Tier::CloudModel => "cloud_model",
            Tier::Budget => "budget",
            Tier::Jury => "jury",
            Tier::Default => "default",
        }
    }
}

/// A single entry in a [`DecisionTrace`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    /// Tier that was visited.
    pub step: Tier,
    /// Tier-specific attributes (hit/miss, model name, confidence, ...).
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

/// Append-only audit log of the tiers visited during one analysis call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Correlation id for this call.
    pub trace_id: String,
    /// Steps in visiting order.
    #[serde(default)]
    pub steps: Vec<TraceStep>,
}

impl DecisionTrace {
    /// Start an empty trace with a fresh correlation id.
    pub fn new() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            steps: Vec::new(),
        }
    }

    /// Append a step with the given attributes.
    pub fn record<'a, I>(&mut self, step: Tier, attrs: I)
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        self.steps.push(TraceStep {
            step,
            attrs: attrs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
    }

    /// Whether the given tier was visited at least once.
    pub fn visited(&self, tier: Tier) -> bool {
        self.steps.iter().any(|s| s.step == tier)
    }

    /// Number of times the given tier was visited.
    pub fn count(&self, tier: Tier) -> usize {
        self.steps.iter().filter(|s| s.step == tier).count()
    }

    /// Tiers in visiting order.
    pub fn tiers(&self) -> Vec<Tier> {
        self.steps.iter().map(|s| s.step).collect()
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// `true` if no step has been recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Why the cascade fell through to a default result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultTag {
    /// Operating mode is `off` or no backend is configured.
    LlmOff,
    /// Every configured backend abstained.
    AllModelsFailed,
}

impl DefaultTag {
    /// Stable label stored in `reason` and the `reason` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultTag::LlmOff => "llm_off",
            DefaultTag::AllModelsFailed => "all_models_failed",
        }
    }
}

/// Neutral score used for defaults and failed jury experts.
pub const NEUTRAL_SCORE: u8 = 50;

/// Final verdict for one piece of content.
///
/// `score` is always present and within `0..=100`; `confidence` is within
/// `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Quality score, 0 (worst) to 100 (best).
    pub score: u8,
    /// Category label.
    pub category: String,
    /// Short human-readable reason.
    pub reason: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Content worth promoting.
    pub is_highlight: bool,
    /// Content that should be hidden or reviewed.
    pub is_inappropriate: bool,
    /// Tier that produced the verdict.
    pub source: ResultSource,
    /// Model that produced the verdict, empty for non-model tiers.
    #[serde(default)]
    pub model_name: String,
    /// Stored prompt version the verdict was produced under. `None` when
    /// the model ran a built-in prompt, as the local model always does.
    #[serde(default)]
    pub prompt_version_id: Option<i64>,
    /// Tiers visited while producing this result.
    #[serde(default)]
    pub decision_trace: DecisionTrace,
}

impl AnalysisResult {
    /// Build the clearly-tagged fallback result returned when every tier
    /// abstains.
    pub fn default_tagged(tag: DefaultTag, prompt_version_id: Option<i64>) -> Self {
        Self {
            score: NEUTRAL_SCORE,
            category: "unknown".to_string(),
            reason: tag.as_str().to_string(),
            confidence: 0.0,
            is_highlight: false,
            is_inappropriate: false,
            source: ResultSource::Default,
            model_name: String::new(),
            prompt_version_id,
            decision_trace: DecisionTrace::default(),
        }
    }

    /// `true` if this is a fallback default result.
    pub fn is_default(&self) -> bool {
        self.source == ResultSource::Default
    }
}

/// Clamp an arbitrary numeric score into `0..=100`, rounding to nearest.
///
/// Non-finite input maps to the neutral score.
pub fn clamp_score(raw: f64) -> u8 {
    if !raw.is_finite() {
        return NEUTRAL_SCORE;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

/// Confidence derived from a score when a model omits it.
pub fn confidence_from_score(score: u8) -> f64 {
    (f64::from(score) / 100.0).clamp(0.0, 1.0)
}

/// Clamp a reported confidence into `[0, 1]`; non-finite values become 0.
pub fn clamp_confidence(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_parses_case_insensitively() {
        assert_eq!("COMMENT".parse::<ContentType>().ok(), Some(ContentType::Comment));
        assert_eq!(" danmaku ".parse::<ContentType>().ok(), Some(ContentType::Danmaku));
        assert!("video".parse::<ContentType>().is_err());
    }

    #[test]
    fn test_priority_orders_high_above_low() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::from_name("HIGH"), Some(Priority::High));
        assert_eq!(Priority::from_name("urgent"), None);
    }

    #[test]
    fn test_clamp_score_bounds() {
        assert_eq!(clamp_score(-5.0), 0);
        assert_eq!(clamp_score(150.0), 100);
        assert_eq!(clamp_score(72.6), 73);
        assert_eq!(clamp_score(f64::NAN), NEUTRAL_SCORE);
    }

    #[test]
    fn test_confidence_from_score_is_fraction() {
        assert!((confidence_from_score(80) - 0.8).abs() < f64::EPSILON);
        assert!((confidence_from_score(0)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clamp_confidence_handles_out_of_range() {
        assert!((clamp_confidence(1.7) - 1.0).abs() < f64::EPSILON);
        assert!(clamp_confidence(-0.2).abs() < f64::EPSILON);
        assert!(clamp_confidence(f64::INFINITY).abs() < f64::EPSILON);
    }

    #[test]
    fn test_trace_records_in_order() {
        let mut trace = DecisionTrace::new();
        trace.record(Tier::RuleFilter, [("matched", Value::Bool(false))]);
        trace.record(Tier::ExactCache, [("hit", Value::Bool(false))]);
        assert_eq!(trace.tiers(), vec![Tier::RuleFilter, Tier::ExactCache]);
        assert!(trace.visited(Tier::ExactCache));
        assert!(!trace.visited(Tier::Jury));
        assert_eq!(trace.steps[0].attrs.get("matched"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_default_result_is_tagged() {
        let r = AnalysisResult::default_tagged(DefaultTag::LlmOff, Some(3));
        assert!(r.is_default());
        assert_eq!(r.reason, "llm_off");
        assert_eq!(r.score, NEUTRAL_SCORE);
        assert_eq!(r.prompt_version_id, Some(3));
    }

    #[test]
    fn test_result_json_roundtrip_keeps_source() {
        let mut r = AnalysisResult::default_tagged(DefaultTag::AllModelsFailed, None);
        r.source = ResultSource::CloudLlm;
        let json = serde_json::to_string(&r).expect("test: serialize");
        assert!(json.contains("\"cloud_llm\""));
        let back: AnalysisResult = serde_json::from_str(&json).expect("test: deserialize");
        assert_eq!(back, r);
    }
}
