//! JSON extraction from free-form model output.
//!
//! Models are asked for a JSON object but often wrap it in prose or code
//! fences. Strategies are tried in order and the first one yielding a JSON
//! object wins:
//!
//! 1. the body of the first fenced code block
//! 2. the whole text after stripping a leading/trailing fence
//! 3. the substring between the first `{` and the last `}`
//!
//! Inherently heuristic; every accepted shape has a test below.

use serde_json::{Map, Value};

use super::ModelVerdict;
use crate::types::clamp_score;

type Strategy = fn(&str) -> Option<Value>;

const STRATEGIES: [Strategy; 3] = [fenced_block, stripped_whole, outer_braces];

/// Extract the first JSON object found by the ordered strategies.
pub fn extract_json(text: &str) -> Option<Value> {
    STRATEGIES
        .iter()
        .find_map(|strategy| strategy(text).filter(Value::is_object))
}

fn fenced_block(text: &str) -> Option<Value> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an optional language tag on the opening fence line.
    let body_start = after.find('\n').map_or(0, |i| i + 1);
    let body = &after[body_start..];
    let end = body.find("```")?;
    serde_json::from_str(body[..end].trim()).ok()
}

fn stripped_whole(text: &str) -> Option<Value> {
    let mut t = text.trim();
    if let Some(rest) = t.strip_prefix("```") {
        t = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    }
    if let Some(rest) = t.strip_suffix("```") {
        t = rest;
    }
    serde_json::from_str(t.trim()).ok()
}

fn outer_braces(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn number(map: &Map<String, Value>, key: &str) -> Option<f64> {
    match map.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

fn boolean(map: &Map<String, Value>, key: &str) -> Option<bool> {
    match map.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a [`ModelVerdict`] out of raw model text.
///
/// `None` when no JSON object is found or it carries no numeric `score`.
/// A confidence above 1 is read as a percentage.
pub fn parse_verdict(raw: &str) -> Option<ModelVerdict> {
    let value = extract_json(raw)?;
    let map = value.as_object()?;
    let score = clamp_score(number(map, "score")?);
    let confidence = number(map, "confidence").map(|c| if c > 1.0 { c / 100.0 } else { c });
    Some(ModelVerdict {
        score,
        category: text_field(map, "category").unwrap_or_else(|| "general".to_string()),
        reason: text_field(map, "reason").unwrap_or_default(),
        confidence,
        is_highlight: boolean(map, "is_highlight"),
        is_inappropriate: boolean(map, "is_inappropriate"),
        raw: raw.to_string(),
    })
}
