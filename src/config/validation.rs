//! Range and cross-field checks on a parsed [`EngineConfig`].
//!
//! [`validate`] walks every section and reports all violations at once, each
//! naming its dotted field path, so an operator can fix a file in one pass.
//! TOML syntax and I/O problems surface earlier, in `loader`.

use super::{EngineConfig, OperatingMode};

/// Why an engine configuration could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file is not valid TOML or does not match the schema.
    #[error("cannot parse {file}: {source}")]
    Parse {
        /// File (or source label) being parsed.
        file: String,
        #[source]
        source: toml::de::Error,
    },

    /// Every failed check, one per line.
    #[error("invalid engine config:\n{0}")]
    Validation(String),

    /// One failed check.
    #[error("{field} = {value}: {reason}")]
    InvalidField {
        /// Dotted path, e.g. `cache.semantic_dims`.
        field: String,
        /// Offending value as written.
        value: String,
        /// Constraint that was broken.
        reason: String,
    },

    /// The file could not be read.
    #[error("cannot read {file}: {source}")]
    Io {
        /// Path that was opened.
        file: String,
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn check_fraction(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(invalid(field, value, "must be between 0.0 and 1.0"));
    }
}

/// Check every section of `config`.
///
/// # Errors
///
/// One [`ConfigError::InvalidField`] per violated constraint.
pub fn validate(config: &EngineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors: Vec<ConfigError> = Vec::new();

    if config.engine.name.trim().is_empty() {
        errors.push(invalid("engine.name", "", "engine name must not be empty"));
    }

    // ── Rules ────────────────────────────────────────────────────────
    if config.rules.score > 100 {
        errors.push(invalid("rules.score", config.rules.score, "must be at most 100"));
    }

    // ── Cache ────────────────────────────────────────────────────────
    let cache = &config.cache;
    if cache.exact_ttl_s == 0 {
        errors.push(invalid("cache.exact_ttl_s", 0, "must be at least 1 second"));
    }
    if cache.semantic_enabled {
        if cache.semantic_ttl_s == 0 {
            errors.push(invalid("cache.semantic_ttl_s", 0, "must be at least 1 second"));
        }
        if cache.semantic_ttl_s > cache.exact_ttl_s {
            errors.push(invalid(
                "cache.semantic_ttl_s",
                cache.semantic_ttl_s,
                "must not exceed cache.exact_ttl_s",
            ));
        }
        if cache.semantic_dims == 0 {
            errors.push(invalid("cache.semantic_dims", 0, "must be at least 1"));
        }
        if cache.semantic_dims > cache.embedding_dim {
            errors.push(invalid(
                "cache.semantic_dims",
                cache.semantic_dims,
                "must not exceed cache.embedding_dim",
            ));
        }
        if cache.semantic_precision > 6 {
            errors.push(invalid(
                "cache.semantic_precision",
                cache.semantic_precision,
                "must be at most 6 decimals",
            ));
        }
        if cache.semantic_thresholds.is_empty() {
            errors.push(invalid(
                "cache.semantic_thresholds",
                "[]",
                "at least one threshold is required",
            ));
        }
        for t in &cache.semantic_thresholds {
            check_fraction(&mut errors, "cache.semantic_thresholds", *t);
        }
        if cache
            .semantic_thresholds
            .windows(2)
            .any(|w| w[1] >= w[0])
        {
            errors.push(invalid(
                "cache.semantic_thresholds",
                format!("{:?}", cache.semantic_thresholds),
                "thresholds must be strictly descending",
            ));
        }
    }

    // ── Models ───────────────────────────────────────────────────────
    if !(0.0..=2.0).contains(&config.models.temperature) {
        errors.push(invalid(
            "models.temperature",
            config.models.temperature,
            "must be between 0.0 and 2.0",
        ));
    }
    if config.models.max_tokens == 0 {
        errors.push(invalid("models.max_tokens", 0, "must be at least 1"));
    }
    for (field, backend) in [
        ("models.local", &config.models.local),
        ("models.cloud", &config.models.cloud),
    ] {
        if backend.timeout_ms == Some(0) {
            errors.push(invalid(&format!("{field}.timeout_ms"), 0, "must be at least 1ms"));
        }
        if backend.max_concurrency == Some(0) {
            errors.push(invalid(
                &format!("{field}.max_concurrency"),
                0,
                "must be at least 1",
            ));
        }
    }
    if config.engine.mode == OperatingMode::LocalOnly
        && config.models.local.base_url.trim().is_empty()
    {
        errors.push(invalid(
            "models.local.base_url",
            "",
            "local_only mode requires a local base_url",
        ));
    }

    // ── Escalation ───────────────────────────────────────────────────
    check_fraction(
        &mut errors,
        "escalation.confidence_threshold",
        config.escalation.confidence_threshold,
    );

    // ── Queue ────────────────────────────────────────────────────────
    if config.queue.capacity == 0 {
        errors.push(invalid("queue.capacity", 0, "must be at least 1"));
    }
    if config.queue.workers == 0 {
        errors.push(invalid("queue.workers", 0, "must be at least 1"));
    }
    if config.queue.max_batch == 0 {
        errors.push(invalid("queue.max_batch", 0, "must be at least 1"));
    }

    // ── Jury ─────────────────────────────────────────────────────────
    check_fraction(&mut errors, "jury.conflict_threshold", config.jury.conflict_threshold);
    let w = &config.jury.weights;
    for (field, value) in [
        ("jury.weights.quality", w.quality),
        ("jury.weights.safety", w.safety),
        ("jury.weights.engagement", w.engagement),
    ] {
        if value < 0.0 || !value.is_finite() {
            errors.push(invalid(field, value, "must be a non-negative number"));
        }
    }
    if w.quality + w.safety + w.engagement <= 0.0 {
        errors.push(invalid("jury.weights", "0", "at least one weight must be positive"));
    }
    if config.jury.expert_timeout_ms == 0 {
        errors.push(invalid("jury.expert_timeout_ms", 0, "must be at least 1ms"));
    }

    // ── Verdict ──────────────────────────────────────────────────────
    let v = &config.verdict;
    if v.highlight_threshold > 100 {
        errors.push(invalid("verdict.highlight_threshold", v.highlight_threshold, "must be at most 100"));
    }
    if v.inappropriate_threshold >= v.highlight_threshold {
        errors.push(invalid(
            "verdict.inappropriate_threshold",
            v.inappropriate_threshold,
            "must be below verdict.highlight_threshold",
        ));
    }

    // ── Shadow ───────────────────────────────────────────────────────
    let s = &config.shadow;
    check_fraction(&mut errors, "shadow.publish_margin", s.publish_margin);
    check_fraction(&mut errors, "shadow.monitor_band", s.monitor_band);
    if s.mae_margin < 0.0 {
        errors.push(invalid("shadow.mae_margin", s.mae_margin, "must be non-negative"));
    }
    if s.monitor_mae_band < 0.0 {
        errors.push(invalid("shadow.monitor_mae_band", s.monitor_mae_band, "must be non-negative"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
