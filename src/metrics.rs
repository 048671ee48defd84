//! Prometheus metrics for the moderation cascade.
//!
//! [`init_metrics`] installs a process-wide registry. Every recording helper
//! is a silent no-op before that, so library users who never initialise
//! metrics pay nothing.
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `moderation_tier_hits_total` | Counter | `tier` |
//! | `moderation_model_failures_total` | Counter | `backend`, `kind` |
//! | `moderation_tier_duration_seconds` | Histogram | `tier` |
//! | `moderation_requests_shed_total` | Counter | `stage` |
//! | `moderation_queue_depth` | Gauge | `queue` |
//! | `moderation_budget_denials_total` | Counter | `scope` |
//! | `moderation_defaults_total` | Counter | `reason` |
//! | `moderation_jury_conflicts_total` | Counter | `outcome` |

use prometheus::core::Collector;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use crate::ModerationError;

/// Tier latencies are dominated by model calls; buckets run 1 ms to 30 s.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

struct Metrics {
    registry: Registry,
    tier_hits: CounterVec,
    model_failures: CounterVec,
    tier_duration: HistogramVec,
    requests_shed: CounterVec,
    queue_depth: IntGaugeVec,
    budget_denials: CounterVec,
    defaults_total: CounterVec,
    jury_outcomes: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, built: prometheus::Result<C>) -> Result<C, ModerationError>
where
    C: Collector + Clone + 'static,
{
    let collector = built.map_err(|e| ModerationError::Other(format!("metric definition: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| ModerationError::Other(format!("metric registration: {e}")))?;
    Ok(collector)
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<CounterVec, ModerationError> {
    register(registry, CounterVec::new(Opts::new(name, help), labels))
}

impl Metrics {
    fn build() -> Result<Self, ModerationError> {
        let registry = Registry::new();
        let tier_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("moderation_tier_duration_seconds", "Time spent per tier")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["tier"],
            ),
        )?;
        let queue_depth = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("moderation_queue_depth", "Items waiting in the batch queue"),
                &["queue"],
            ),
        )?;
        Ok(Self {
            tier_hits: counter(
                &registry,
                "moderation_tier_hits_total",
                "Verdicts produced per tier",
                &["tier"],
            )?,
            model_failures: counter(
                &registry,
                "moderation_model_failures_total",
                "Model calls that produced no verdict",
                &["backend", "kind"],
            )?,
            requests_shed: counter(
                &registry,
                "moderation_requests_shed_total",
                "Items dropped because the queue was full",
                &["stage"],
            )?,
            budget_denials: counter(
                &registry,
                "moderation_budget_denials_total",
                "Paid calls refused by the budget governor",
                &["scope"],
            )?,
            defaults_total: counter(
                &registry,
                "moderation_defaults_total",
                "Default verdicts by reason",
                &["reason"],
            )?,
            jury_outcomes: counter(
                &registry,
                "moderation_jury_conflicts_total",
                "Jury outcomes",
                &["outcome"],
            )?,
            tier_duration,
            queue_depth,
            registry,
        })
    }
}

/// Install the process-wide registry. Later calls are no-ops.
///
/// # Errors
///
/// [`ModerationError::Other`] when a metric cannot be defined or registered.
pub fn init_metrics() -> Result<(), ModerationError> {
    if METRICS.get().is_none() {
        let _ = METRICS.set(Metrics::build()?);
    }
    Ok(())
}

fn bump(pick: fn(&Metrics) -> &CounterVec, labels: &[&str]) {
    if let Some(c) = METRICS
        .get()
        .and_then(|m| pick(m).get_metric_with_label_values(labels).ok())
    {
        c.inc();
    }
}

/// Count a verdict produced by `tier`.
pub fn inc_tier_hit(tier: &str) {
    bump(|m| &m.tier_hits, &[tier]);
}

/// Count a failed model call. `kind` is one of `client_error`,
/// `server_error`, `rate_limited`, `exception`, `timeout`, `parse_error`.
pub fn inc_model_failure(backend: &str, kind: &str) {
    bump(|m| &m.model_failures, &[backend, kind]);
}

/// Count an item shed at `stage`.
pub fn inc_shed(stage: &str) {
    bump(|m| &m.requests_shed, &[stage]);
}

/// Count a budget denial; `scope` is `subject`, `hourly` or `daily`.
pub fn inc_budget_denial(scope: &str) {
    bump(|m| &m.budget_denials, &[scope]);
}

/// Count a default verdict tagged `reason`.
pub fn inc_default(reason: &str) {
    bump(|m| &m.defaults_total, &[reason]);
}

/// Count a jury outcome.
pub fn inc_jury_outcome(outcome: &str) {
    bump(|m| &m.jury_outcomes, &[outcome]);
}

/// Observe time spent in `tier`.
pub fn record_tier_latency(tier: &str, elapsed: Duration) {
    if let Some(h) = METRICS
        .get()
        .and_then(|m| m.tier_duration.get_metric_with_label_values(&[tier]).ok())
    {
        h.observe(elapsed.as_secs_f64());
    }
}

/// Set the depth gauge for `queue`.
pub fn set_queue_depth(queue: &str, depth: i64) {
    if let Some(g) = METRICS
        .get()
        .and_then(|m| m.queue_depth.get_metric_with_label_values(&[queue]).ok())
    {
        g.set(depth);
    }
}

/// Text exposition of every metric; empty before [`init_metrics`].
pub fn gather_metrics() -> String {
    let Some(m) = METRICS.get() else {
        return String::new();
    };
    let mut out = Vec::new();
    match TextEncoder::new().encode(&m.registry.gather(), &mut out) {
        Ok(()) => String::from_utf8(out).unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// Verdicts produced so far, keyed by tier label.
pub fn tier_hit_counts() -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    let Some(m) = METRICS.get() else {
        return counts;
    };
    for family in m.tier_hits.collect() {
        for sample in family.get_metric() {
            let tier = sample
                .get_label()
                .iter()
                .find(|l| l.get_name() == "tier")
                .map_or("unknown", |l| l.get_value());
            counts.insert(tier.to_string(), sample.get_counter().get_value() as u64);
        }
    }
    counts
}
