//! # Stage: Rule Filter
//!
//! ## Responsibility
//! Catch obviously low-value text before any cache or model is touched:
//! blank input, pure numbers, strings with no letters/digits/CJK, very short
//! strings and configured low-value keywords.
//!
//! ## Guarantees
//! - Deterministic: the same text always yields the same decision
//! - Pure: no I/O, no allocation beyond the returned result
//! - A match means zero model calls for that text
//!
//! ## NOT Responsible For
//! - Toxicity or policy judgement (that belongs to the model tiers)

use std::collections::HashSet;

use crate::config::RulesConfig;
use crate::normalize::{is_cjk, is_punctuation, normalize};
use crate::types::{AnalysisResult, DecisionTrace, ResultSource};

/// Which rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleHit {
    /// Empty or whitespace-only text.
    Empty,
    /// Digits (and separators) only.
    NumericOnly,
    /// No alphanumeric or CJK character at all.
    NoMeaningfulChars,
    /// Fewer characters than the configured minimum.
    TooShort,
    /// Normalized text is on the low-value keyword list.
    LowValueKeyword,
}

impl RuleHit {
    /// Stable label stored as the result reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleHit::Empty => "empty",
            RuleHit::NumericOnly => "numeric_only",
            RuleHit::NoMeaningfulChars => "no_meaningful_chars",
            RuleHit::TooShort => "too_short",
            RuleHit::LowValueKeyword => "low_value_keyword",
        }
    }
}

/// Deterministic first tier of the cascade.
#[derive(Debug, Clone)]
pub struct RuleFilter {
    min_length: usize,
    score: u8,
    keywords: HashSet<String>,
}

impl RuleFilter {
    /// Build a filter from the `[rules]` config section.
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            min_length: config.min_length,
            score: config.score.min(100),
            keywords: config
                .low_value_keywords
                .iter()
                .map(|k| keyword_key(k))
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Return the first matching rule, if any.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn check(&self, text: &str) -> Option<RuleHit> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Some(RuleHit::Empty);
        }
        if trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_whitespace() || matches!(c, '.' | ',' | '-' | '+'))
            && trimmed.chars().any(|c| c.is_ascii_digit())
        {
            return Some(RuleHit::NumericOnly);
        }
        if !trimmed.chars().any(|c| c.is_alphanumeric() || is_cjk(c)) {
            return Some(RuleHit::NoMeaningfulChars);
        }
        if trimmed.chars().count() < self.min_length {
            return Some(RuleHit::TooShort);
        }
        if !self.keywords.is_empty() && self.keywords.contains(&keyword_key(trimmed)) {
            return Some(RuleHit::LowValueKeyword);
        }
        None
    }

    /// Run the filter and build a `source=rule` result on a match.
    pub fn filter(&self, text: &str) -> Option<AnalysisResult> {
        let hit = self.check(text)?;
        Some(AnalysisResult {
            score: self.score,
            category: "low_value".to_string(),
            reason: hit.as_str().to_string(),
            confidence: 1.0,
            is_highlight: false,
            is_inappropriate: false,
            source: ResultSource::Rule,
            model_name: String::new(),
            prompt_version_id: None,
            decision_trace: DecisionTrace::default(),
        })
    }
}

/// Normalized text with punctuation removed, used for keyword comparison.
fn keyword_key(text: &str) -> String {
    normalize(text)
        .chars()
        .filter(|c| !is_punctuation(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> RuleFilter {
        RuleFilter::new(&RulesConfig {
            min_length: 2,
            score: 10,
            low_value_keywords: vec!["first".into(), "沙发".into(), "666".into()],
        })
    }

    #[test]
    fn test_empty_and_whitespace_match() {
        assert_eq!(filter().check(""), Some(RuleHit::Empty));
        assert_eq!(filter().check("   \n\t"), Some(RuleHit::Empty));
    }

    #[test]
    fn test_pure_numeric_matches() {
        assert_eq!(filter().check("12345"), Some(RuleHit::NumericOnly));
        assert_eq!(filter().check("3.14"), Some(RuleHit::NumericOnly));
    }

    #[test]
    fn test_symbols_only_match() {
        assert_eq!(filter().check("?!?!"), Some(RuleHit::NoMeaningfulChars));
        assert_eq!(filter().check("……"), Some(RuleHit::NoMeaningfulChars));
    }

    #[test]
    fn test_too_short_matches() {
        assert_eq!(filter().check("a"), Some(RuleHit::TooShort));
        assert_eq!(filter().check("好"), Some(RuleHit::TooShort));
    }

    #[test]
    fn test_keyword_matches_after_normalization() {
        assert_eq!(filter().check("FIRST!!!"), Some(RuleHit::LowValueKeyword));
        assert_eq!(filter().check("沙发"), Some(RuleHit::LowValueKeyword));
    }

    #[test]
    fn test_ordinary_text_passes() {
        assert_eq!(filter().check("this explanation really helped me"), None);
        assert_eq!(filter().check("讲得很清楚"), None);
        assert_eq!(filter().check("ok"), None);
    }

    #[test]
    fn test_filter_builds_rule_result() {
        let r = filter().filter("   ").expect("test: rule must match");
        assert_eq!(r.source, ResultSource::Rule);
        assert_eq!(r.reason, "empty");
        assert_eq!(r.score, 10);
        assert!((r.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_numeric_keyword_hits_numeric_rule_first() {
        assert_eq!(filter().check("666"), Some(RuleHit::NumericOnly));
    }
}
