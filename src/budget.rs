//! # Stage: Budget Governor
//!
//! ## Responsibility
//! Meter paid (cloud) inference against per-subject and global caps, and
//! keep usage counters for both backend classes.
//!
//! ## Guarantees
//! - `try_acquire` checks every cap and commits in one critical section, so
//!   concurrent callers can never overshoot a cap together
//! - Per-subject counters are lifetime counters; they only reset through
//!   [`BudgetGovernor::reset_subject`]
//! - Global counters roll over on UTC hour and day boundaries
//! - A cap of `None` is unlimited
//!
//! ## NOT Responsible For
//! - Deciding which backend to call (that belongs to the orchestrator)
//! - Pricing in currency (calls and characters only)

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::config::BudgetConfig;
use crate::metrics;

/// Which cap refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// Per-subject lifetime cap.
    Subject,
    /// Global hourly cap.
    Hourly,
    /// Global daily cap.
    Daily,
}

impl BudgetScope {
    /// Metric and trace label.
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetScope::Subject => "subject",
            BudgetScope::Hourly => "hourly",
            BudgetScope::Daily => "daily",
        }
    }
}

#[derive(Debug, Default)]
struct Counter {
    calls: AtomicU64,
    chars: AtomicU64,
}

impl Counter {
    fn add(&self, calls: u64, chars: u64) {
        self.calls.fetch_add(calls, Ordering::Relaxed);
        self.chars.fetch_add(chars, Ordering::Relaxed);
    }

    fn get(&self) -> (u64, u64) {
        (
            self.calls.load(Ordering::Relaxed),
            self.chars.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Default)]
struct Window {
    key: String,
    calls: u64,
    chars: u64,
}

impl Window {
    fn roll(&mut self, key: String) {
        if self.key != key {
            self.key = key;
            self.calls = 0;
            self.chars = 0;
        }
    }
}

#[derive(Debug, Default)]
struct GlobalWindows {
    hour: Window,
    day: Window,
}

fn within(cap: Option<u64>, used: u64, add: u64) -> bool {
    cap.map_or(true, |cap| used.saturating_add(add) <= cap)
}

/// Point-in-time usage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    /// Local calls recorded.
    pub local_calls: u64,
    /// Characters sent to the local backend.
    pub local_chars: u64,
    /// Cloud calls committed.
    pub cloud_calls: u64,
    /// Characters sent to the cloud backend.
    pub cloud_chars: u64,
    /// Cloud calls refused.
    pub denials: u64,
    /// Cloud calls in the current UTC hour.
    pub hourly_calls: u64,
    /// Cloud calls in the current UTC day.
    pub daily_calls: u64,
}

/// Call and character budget for paid inference.
///
/// ## Example
///
/// ```rust
/// use tokio_moderation_orchestrator::BudgetGovernor;
/// use tokio_moderation_orchestrator::config::BudgetConfig;
///
/// let budget = BudgetGovernor::new(BudgetConfig {
///     per_subject_max_calls: Some(1),
///     ..BudgetConfig::default()
/// });
/// assert!(budget.try_acquire(Some("video-7"), 1, 120).is_ok());
/// assert!(budget.try_acquire(Some("video-7"), 1, 120).is_err());
/// ```
#[derive(Debug)]
pub struct BudgetGovernor {
    caps: BudgetConfig,
    subjects: DashMap<String, Counter>,
    windows: Mutex<GlobalWindows>,
    local: Counter,
    cloud: Counter,
    denials: AtomicU64,
}

impl BudgetGovernor {
    /// Governor enforcing `caps`.
    pub fn new(caps: BudgetConfig) -> Self {
        Self {
            caps,
            subjects: DashMap::new(),
            windows: Mutex::new(GlobalWindows::default()),
            local: Counter::default(),
            cloud: Counter::default(),
            denials: AtomicU64::new(0),
        }
    }

    fn hour_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%dT%H").to_string()
    }

    fn day_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    fn first_violation(
        &self,
        windows: &GlobalWindows,
        subject: Option<(u64, u64)>,
        calls: u64,
        chars: u64,
    ) -> Option<BudgetScope> {
        if let Some((s_calls, s_chars)) = subject {
            if !within(self.caps.per_subject_max_calls, s_calls, calls)
                || !within(self.caps.per_subject_max_chars, s_chars, chars)
            {
                return Some(BudgetScope::Subject);
            }
        }
        if !within(self.caps.global_hourly_calls, windows.hour.calls, calls)
            || !within(self.caps.global_hourly_chars, windows.hour.chars, chars)
        {
            return Some(BudgetScope::Hourly);
        }
        if !within(self.caps.global_daily_calls, windows.day.calls, calls)
            || !within(self.caps.global_daily_chars, windows.day.chars, chars)
        {
            return Some(BudgetScope::Daily);
        }
        None
    }

    /// Would one more call of `projected_chars` fit every cap? Does not
    /// commit anything.
    pub fn check(&self, subject: Option<&str>, projected_chars: u64) -> bool {
        self.check_at(subject, projected_chars, Utc::now())
    }

    fn check_at(&self, subject: Option<&str>, projected_chars: u64, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock();
        windows.hour.roll(Self::hour_key(now));
        windows.day.roll(Self::day_key(now));
        let used = subject.and_then(|s| self.subjects.get(s).map(|c| c.value().get()));
        let used = subject.map(|_| used.unwrap_or((0, 0)));
        self.first_violation(&windows, used, 1, projected_chars)
            .is_none()
    }

    /// Record one cloud call of `chars` unconditionally.
    pub fn commit(&self, subject: Option<&str>, chars: u64) {
        self.commit_at(subject, 1, chars, Utc::now());
    }

    fn commit_at(&self, subject: Option<&str>, calls: u64, chars: u64, now: DateTime<Utc>) {
        let mut windows = self.windows.lock();
        windows.hour.roll(Self::hour_key(now));
        windows.day.roll(Self::day_key(now));
        Self::apply(&mut windows, calls, chars);
        if let Some(s) = subject {
            self.subjects.entry(s.to_string()).or_default().add(calls, chars);
        }
        self.cloud.add(calls, chars);
    }

    fn apply(windows: &mut GlobalWindows, calls: u64, chars: u64) {
        windows.hour.calls += calls;
        windows.hour.chars += chars;
        windows.day.calls += calls;
        windows.day.chars += chars;
    }

    /// Atomically check every cap and, if all fit, commit `calls` and
    /// `chars`.
    ///
    /// # Errors
    ///
    /// Returns the first refusing [`BudgetScope`]; nothing is committed.
    pub fn try_acquire(
        &self,
        subject: Option<&str>,
        calls: u64,
        chars: u64,
    ) -> Result<(), BudgetScope> {
        self.try_acquire_at(subject, calls, chars, Utc::now())
    }

    fn try_acquire_at(
        &self,
        subject: Option<&str>,
        calls: u64,
        chars: u64,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetScope> {
        // Lock order: global windows, then the subject's shard.
        let mut windows = self.windows.lock();
        windows.hour.roll(Self::hour_key(now));
        windows.day.roll(Self::day_key(now));

        let entry = subject.map(|s| self.subjects.entry(s.to_string()).or_default());
        let used = entry.as_ref().map(|c| c.value().get());

        if let Some(scope) = self.first_violation(&windows, used, calls, chars) {
            drop(entry);
            drop(windows);
            self.denials.fetch_add(1, Ordering::Relaxed);
            metrics::inc_budget_denial(scope.as_str());
            debug!(scope = scope.as_str(), "budget denied cloud call");
            return Err(scope);
        }

        Self::apply(&mut windows, calls, chars);
        if let Some(counter) = &entry {
            counter.value().add(calls, chars);
        }
        self.cloud.add(calls, chars);
        Ok(())
    }

    /// Record a local call for usage reporting. Never refused.
    pub fn record_local(&self, chars: u64) {
        self.local.add(1, chars);
    }

    /// Clear a subject's lifetime counters.
    pub fn reset_subject(&self, subject: &str) {
        self.subjects.remove(subject);
    }

    /// `(calls, chars)` committed for `subject`.
    pub fn subject_usage(&self, subject: &str) -> (u64, u64) {
        self.subjects.get(subject).map_or((0, 0), |c| c.value().get())
    }

    /// Current usage counters.
    pub fn snapshot(&self) -> UsageSnapshot {
        let (local_calls, local_chars) = self.local.get();
        let (cloud_calls, cloud_chars) = self.cloud.get();
        let now = Utc::now();
        let mut windows = self.windows.lock();
        windows.hour.roll(Self::hour_key(now));
        windows.day.roll(Self::day_key(now));
        UsageSnapshot {
            local_calls,
            local_chars,
            cloud_calls,
            cloud_chars,
            denials: self.denials.load(Ordering::Relaxed),
            hourly_calls: windows.hour.calls,
            daily_calls: windows.day.calls,
        }
    }
}
