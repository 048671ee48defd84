//! # Stage: Prompt Shadow Tests
//!
//! ## Responsibility
//! Compare a candidate prompt version against the active one for the same
//! content type on labeled samples, recommend whether to publish it, and
//! publish on request.
//!
//! ## Guarantees
//! - Both variants see the same samples and the same backend selection
//! - Experiments are immutable once stored
//! - Publishing switches the active version of one content type atomically
//! - With a repository attached, every created version, stored experiment
//!   and publish is saved before the call returns
//! - Only lookups (unknown prompt, no active prompt, unreadable dataset)
//!   return errors; model failures are counted per variant
//!
//! ## NOT Responsible For
//! - Choosing which candidates to test
//! - Scheduling tests

pub mod dataset;
pub mod repository;
pub mod store;

pub use crate::models::ModelSource;
pub use dataset::{JsonlSampleSource, LabeledSample, MemorySampleSource, SampleSource};
pub use repository::{JsonFilePromptRepository, PromptRepository, PromptSnapshot};
pub use store::{Experiment, ExperimentStore, PromptStore, PromptVersion, Recommendation};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ShadowConfig;
use crate::orchestrator::DecisionOrchestrator;
use crate::types::{AnalysisResult, ContentType};
use crate::ModerationError;

/// Accuracy of one prompt variant against ground truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantMetrics {
    /// Samples that produced a verdict.
    pub evaluated: usize,
    /// Samples where every backend abstained.
    pub failed: usize,
    /// Share of evaluated samples whose category matched.
    pub match_rate: f64,
    /// Mean absolute score error over evaluated samples.
    pub mae: f64,
}

/// Metrics stored with an [`Experiment`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMetrics {
    /// Candidate variant.
    pub candidate: VariantMetrics,
    /// Active variant.
    pub active: VariantMetrics,
    /// Share of jointly scored samples where both variants agree.
    pub consistency_rate: f64,
    /// Samples scored by both variants.
    pub compared: usize,
    /// `candidate.match_rate - active.match_rate`.
    pub match_rate_delta: f64,
    /// `candidate.mae - active.mae`; negative is better.
    pub mae_delta: f64,
}

fn same_category(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn variant_metrics(samples: &[LabeledSample], verdicts: &[Option<AnalysisResult>]) -> VariantMetrics {
    let mut m = VariantMetrics::default();
    let mut matched = 0usize;
    let mut abs_error = 0.0;
    for (sample, verdict) in samples.iter().zip(verdicts) {
        match verdict {
            Some(r) => {
                m.evaluated += 1;
                if same_category(&r.category, &sample.expected_category) {
                    matched += 1;
                }
                abs_error += (f64::from(r.score) - f64::from(sample.expected_score)).abs();
            }
            None => m.failed += 1,
        }
    }
    if m.evaluated > 0 {
        m.match_rate = matched as f64 / m.evaluated as f64;
        m.mae = abs_error / m.evaluated as f64;
    }
    m
}

/// Compute experiment metrics from paired verdicts.
pub fn compute_metrics(
    samples: &[LabeledSample],
    candidate: &[Option<AnalysisResult>],
    active: &[Option<AnalysisResult>],
    tolerance: u8,
) -> ExperimentMetrics {
    let c = variant_metrics(samples, candidate);
    let a = variant_metrics(samples, active);

    let mut compared = 0usize;
    let mut agreeing = 0usize;
    for (cv, av) in candidate.iter().zip(active) {
        if let (Some(cv), Some(av)) = (cv, av) {
            compared += 1;
            if same_category(&cv.category, &av.category) && cv.score.abs_diff(av.score) <= tolerance {
                agreeing += 1;
            }
        }
    }

    ExperimentMetrics {
        consistency_rate: if compared > 0 {
            agreeing as f64 / compared as f64
        } else {
            0.0
        },
        compared,
        match_rate_delta: c.match_rate - a.match_rate,
        mae_delta: c.mae - a.mae,
        candidate: c,
        active: a,
    }
}

/// Publish if the candidate is clearly better on both axes, monitor if it
/// is indistinguishable, refine otherwise. A variant with no verdicts at
/// all always yields `refine`.
pub fn recommend(metrics: &ExperimentMetrics, config: &ShadowConfig) -> Recommendation {
    if metrics.candidate.evaluated == 0 || metrics.active.evaluated == 0 {
        return Recommendation::Refine;
    }
    let match_gain = metrics.match_rate_delta;
    let mae_gain = -metrics.mae_delta;
    if match_gain > config.publish_margin && mae_gain > config.mae_margin {
        Recommendation::Publish
    } else if match_gain.abs() <= config.monitor_band && mae_gain.abs() <= config.monitor_mae_band {
        Recommendation::Monitor
    } else {
        Recommendation::Refine
    }
}

/// Runs prompt shadow tests through an orchestrator's backends.
pub struct ShadowHarness {
    orchestrator: Arc<DecisionOrchestrator>,
    prompts: Arc<PromptStore>,
    experiments: ExperimentStore,
    repository: Option<Arc<dyn PromptRepository>>,
    // Serializes snapshot-then-save so the last write carries the newest state.
    save_lock: Mutex<()>,
    config: ShadowConfig,
}

impl ShadowHarness {
    /// Harness sharing the orchestrator's prompt store and repository, with
    /// an empty experiment log.
    pub fn new(orchestrator: Arc<DecisionOrchestrator>) -> Self {
        let prompts = Arc::clone(orchestrator.prompts());
        let repository = orchestrator.prompt_repository().cloned();
        let config = orchestrator.config().shadow.clone();
        Self {
            orchestrator,
            prompts,
            experiments: ExperimentStore::new(),
            repository,
            save_lock: Mutex::new(()),
            config,
        }
    }

    /// Like [`ShadowHarness::new`], with earlier experiments restored from
    /// the orchestrator's repository.
    ///
    /// # Errors
    ///
    /// [`ModerationError::Storage`] if the repository cannot be read.
    pub async fn open(orchestrator: Arc<DecisionOrchestrator>) -> Result<Self, ModerationError> {
        let harness = Self::new(orchestrator);
        if let Some(repository) = &harness.repository {
            let snapshot = repository.load().await?;
            harness.experiments.restore(snapshot.experiments);
        }
        Ok(harness)
    }

    async fn persist(&self) -> Result<(), ModerationError> {
        let Some(repository) = &self.repository else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let snapshot = PromptSnapshot {
            versions: self.prompts.snapshot(),
            experiments: self.experiments.list(),
        };
        repository.save(&snapshot).await
    }

    /// Add an inactive prompt version and save it.
    ///
    /// # Errors
    ///
    /// [`ModerationError::Storage`] if the repository write fails. The
    /// version stays in memory either way.
    pub async fn create_prompt(
        &self,
        content_type: ContentType,
        content: impl Into<String>,
    ) -> Result<PromptVersion, ModerationError> {
        let version = self.prompts.create(content_type, content);
        self.persist().await?;
        Ok(version)
    }

    /// Prompt store.
    pub fn prompts(&self) -> &Arc<PromptStore> {
        &self.prompts
    }

    /// Stored experiments.
    pub fn experiments(&self) -> &ExperimentStore {
        &self.experiments
    }

    /// Compare version `candidate_id` against the active version of its
    /// content type on up to `sample_limit` samples (0 = configured
    /// default), store the experiment and return it.
    ///
    /// # Errors
    ///
    /// - [`ModerationError::PromptNotFound`] for an unknown candidate
    /// - [`ModerationError::NoActivePrompt`] if its type has no active version
    /// - [`ModerationError::Dataset`] if the source fails or has no samples
    /// - [`ModerationError::Storage`] if the experiment cannot be saved
    pub async fn run_prompt_test(
        &self,
        candidate_id: i64,
        sample_limit: usize,
        model_source: ModelSource,
        dataset: &dyn SampleSource,
    ) -> Result<Experiment, ModerationError> {
        let candidate = self
            .prompts
            .get(candidate_id)
            .ok_or(ModerationError::PromptNotFound(candidate_id))?;
        let content_type = candidate.content_type;
        let active = self
            .prompts
            .active(content_type)
            .ok_or(ModerationError::NoActivePrompt(content_type))?;

        let limit = if sample_limit == 0 {
            self.config.default_sample_limit
        } else {
            sample_limit
        };
        let samples = dataset.samples(content_type, limit).await?;
        if samples.is_empty() {
            return Err(ModerationError::Dataset(format!(
                "no labeled samples for content type '{content_type}'"
            )));
        }

        info!(
            candidate = candidate.id,
            active = active.id,
            content_type = %content_type,
            samples = samples.len(),
            model_source = model_source.as_str(),
            "prompt shadow test started"
        );

        let (candidate_verdicts, active_verdicts) = tokio::join!(
            self.score_all(&samples, content_type, model_source, &candidate.content),
            self.score_all(&samples, content_type, model_source, &active.content),
        );

        let metrics = compute_metrics(
            &samples,
            &candidate_verdicts,
            &active_verdicts,
            self.config.consistency_tolerance,
        );
        let recommendation = recommend(&metrics, &self.config);

        let experiment = self.experiments.insert(Experiment {
            id: 0,
            content_type,
            candidate_version_id: candidate.id,
            active_version_id: active.id,
            model_source,
            sample_count: samples.len(),
            metrics,
            recommendation,
            created_at: Utc::now(),
        });

        info!(
            experiment = experiment.id,
            recommendation = recommendation.as_str(),
            consistency = experiment.metrics.consistency_rate,
            match_rate_delta = experiment.metrics.match_rate_delta,
            mae_delta = experiment.metrics.mae_delta,
            "prompt shadow test finished"
        );
        self.persist().await?;
        Ok(experiment)
    }

    async fn score_all(
        &self,
        samples: &[LabeledSample],
        content_type: ContentType,
        source: ModelSource,
        prompt: &str,
    ) -> Vec<Option<AnalysisResult>> {
        join_all(samples.iter().map(|s| {
            self.orchestrator
                .score_with_prompt(source, content_type, &s.text, prompt)
        }))
        .await
    }

    /// Make `version_id` the active prompt of its content type and save.
    ///
    /// # Errors
    ///
    /// - [`ModerationError::PromptNotFound`] for an unknown id
    /// - [`ModerationError::Storage`] if the repository write fails
    pub async fn publish_prompt(&self, version_id: i64) -> Result<PromptVersion, ModerationError> {
        let version = self.prompts.activate(version_id)?;
        self.persist().await?;
        info!(
            version = version.id,
            content_type = %version.content_type,
            "prompt version published"
        );
        Ok(version)
    }
}
