//! # Stage: Decision Orchestrator
//!
//! ## Responsibility
//! Drive one piece of content through the tier cascade and return exactly
//! one [`AnalysisResult`]:
//!
//! ```text
//! rule_filter → exact_cache → semantic_cache → local_model
//!     [→ escalation → cloud_model] → cloud_model (local missing or failed)
//!     → jury (optional) → default
//! ```
//!
//! ## Guarantees
//! - Tiers run strictly in order; the first verdict short-circuits
//! - Every result carries the trace of every tier visited (subject to
//!   `trace.retention`)
//! - Model and jury verdicts are written back to both cache tiers
//! - Cloud calls are admitted by the budget governor before they are made
//! - Never fails: exhaustion yields a tagged default result
//!
//! ## NOT Responsible For
//! - Queueing and deduplication across items (that belongs to `queue`)
//! - Prompt experiments (that belongs to `shadow`)

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, Instrument};

use crate::budget::BudgetGovernor;
use crate::cache::{CacheLayer, Embedder, ExactCache, HashingEmbedder, SemanticCache};
use crate::config::{EmbeddingKind, EngineConfig, TraceRetention};
use crate::jury::Jury;
use crate::metrics;
use crate::models::prompts::{builtin_prompt, with_output_contract};
use crate::models::{ChatInvoker, InvokeRequest, ModelInvoker, ModelKind, ModelRegistry, ModelSource};
use crate::normalize::normalize;
use crate::rules::RuleFilter;
use crate::shadow::{JsonFilePromptRepository, PromptRepository, PromptStore};
use crate::types::{
    AnalysisResult, ContentType, DecisionTrace, DefaultTag, Priority, ResultSource, Tier,
};
use crate::ModerationError;

/// One analysis call.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeRequest {
    /// Raw text.
    pub content: String,
    /// Kind of content.
    pub content_type: ContentType,
    /// Queue priority; `high` may convene the jury.
    pub priority: Priority,
    /// Skip the cache read tiers and convene the jury.
    pub force_jury: bool,
    /// Budget subject (user, channel, tenant).
    pub subject_id: Option<String>,
}

impl AnalyzeRequest {
    /// Request with normal priority and no subject.
    pub fn new(content: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            content: content.into(),
            content_type,
            priority: Priority::Normal,
            force_jury: false,
            subject_id: None,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Force the jury.
    pub fn with_jury(mut self, force: bool) -> Self {
        self.force_jury = force;
        self
    }

    /// Meter cloud calls against `subject`.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject_id = Some(subject.into());
        self
    }
}

/// Builder for [`DecisionOrchestrator`].
///
/// Anything not supplied is derived from the config: an in-memory cache,
/// an empty (optionally seeded) prompt store, a fresh budget governor and a
/// registry read from `[engine]` and `[models]`. No invokers are created;
/// use [`DecisionOrchestrator::from_config`] for HTTP backends.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    local: Option<Arc<dyn ModelInvoker>>,
    cloud: Option<Arc<dyn ModelInvoker>>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Option<CacheLayer>,
    prompts: Option<Arc<PromptStore>>,
    prompt_repository: Option<Arc<dyn PromptRepository>>,
    budget: Option<Arc<BudgetGovernor>>,
    registry: Option<ModelRegistry>,
}

impl OrchestratorBuilder {
    /// Local backend.
    pub fn with_local(mut self, invoker: Arc<dyn ModelInvoker>) -> Self {
        self.local = Some(invoker);
        self
    }

    /// Cloud backend.
    pub fn with_cloud(mut self, invoker: Arc<dyn ModelInvoker>) -> Self {
        self.cloud = Some(invoker);
        self
    }

    /// Embedding source for the semantic tier.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Shared cache store.
    pub fn with_cache(mut self, cache: CacheLayer) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Shared prompt store.
    pub fn with_prompts(mut self, prompts: Arc<PromptStore>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    /// Where prompt changes are persisted. The prompt store is not loaded
    /// from it here; see [`DecisionOrchestrator::from_config`].
    pub fn with_prompt_repository(mut self, repository: Arc<dyn PromptRepository>) -> Self {
        self.prompt_repository = Some(repository);
        self
    }

    /// Shared budget governor.
    pub fn with_budget(mut self, budget: Arc<BudgetGovernor>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Explicit registry instead of one read from the config.
    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Assemble the orchestrator.
    pub fn build(self) -> DecisionOrchestrator {
        let config = self.config;
        let registry = self
            .registry
            .unwrap_or_else(|| ModelRegistry::from_config(&config));
        let cache = self
            .cache
            .unwrap_or_else(|| CacheLayer::new_memory(config.cache.max_entries));
        let prompts = self.prompts.unwrap_or_else(|| {
            let store = PromptStore::new();
            if config.prompts.seed_builtin {
                store.seed_builtin();
            }
            Arc::new(store)
        });
        let budget = self
            .budget
            .unwrap_or_else(|| Arc::new(BudgetGovernor::new(config.budget.clone())));

        // Modes gate installed invokers.
        let local = self.local.filter(|_| registry.is_enabled(ModelKind::Local));
        let cloud = self.cloud.filter(|_| registry.is_enabled(ModelKind::Cloud));

        let jury = if config.jury.enabled {
            cloud.clone().or_else(|| local.clone()).map(|invoker| {
                Jury::new(invoker, config.jury.clone(), config.verdict.clone())
                    .with_budget(Arc::clone(&budget))
            })
        } else {
            None
        };

        let semantic = config
            .cache
            .semantic_enabled
            .then(|| SemanticCache::new(cache.clone(), &config.cache));

        DecisionOrchestrator {
            rules: RuleFilter::new(&config.rules),
            exact: ExactCache::new(cache.clone(), config.cache.exact_ttl_s),
            semantic,
            embedder: self.embedder,
            cache,
            registry,
            local,
            cloud,
            jury,
            prompts,
            prompt_repository: self.prompt_repository,
            budget,
            config,
        }
    }
}

/// Tier cascade for moderation decisions.
///
/// ## Example
///
/// ```no_run
/// use tokio_moderation_orchestrator::{AnalyzeRequest, ContentType, DecisionOrchestrator, EngineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), tokio_moderation_orchestrator::ModerationError> {
/// let engine = DecisionOrchestrator::from_config(EngineConfig::default()).await?;
/// let result = engine
///     .analyze(AnalyzeRequest::new("great explanation, thanks", ContentType::Comment))
///     .await;
/// println!("{} {}", result.score, result.source.as_str());
/// # Ok(())
/// # }
/// ```
pub struct DecisionOrchestrator {
    config: EngineConfig,
    rules: RuleFilter,
    cache: CacheLayer,
    exact: ExactCache,
    semantic: Option<SemanticCache>,
    embedder: Option<Arc<dyn Embedder>>,
    registry: ModelRegistry,
    local: Option<Arc<dyn ModelInvoker>>,
    cloud: Option<Arc<dyn ModelInvoker>>,
    jury: Option<Jury>,
    prompts: Arc<PromptStore>,
    prompt_repository: Option<Arc<dyn PromptRepository>>,
    budget: Arc<BudgetGovernor>,
}

impl DecisionOrchestrator {
    /// Start a builder over `config`.
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            local: None,
            cloud: None,
            embedder: None,
            cache: None,
            prompts: None,
            prompt_repository: None,
            budget: None,
            registry: None,
        }
    }

    /// Fully wired engine: HTTP invokers for every available backend, the
    /// configured cache store and embedder, and the prompt store loaded from
    /// `prompts.store_path` when set.
    ///
    /// # Errors
    ///
    /// - [`ModerationError::ConfigError`] if an HTTP client cannot be built
    /// - [`ModerationError::Storage`] if the prompt store file is unreadable
    pub async fn from_config(config: EngineConfig) -> Result<Self, ModerationError> {
        let registry = ModelRegistry::from_config(&config);
        let cache = CacheLayer::from_config(&config.cache).await;

        let mut builder = Self::builder(config.clone())
            .with_cache(cache)
            .with_registry(registry.clone());

        if let Some(path) = &config.prompts.store_path {
            let repository = JsonFilePromptRepository::new(path);
            let snapshot = repository.load().await?;
            let prompts = PromptStore::new();
            info!(
                path = %path.display(),
                versions = snapshot.versions.len(),
                "prompt store loaded"
            );
            prompts.restore(snapshot.versions);
            if config.prompts.seed_builtin {
                prompts.seed_builtin();
            }
            builder = builder
                .with_prompts(Arc::new(prompts))
                .with_prompt_repository(Arc::new(repository));
        }

        for kind in registry.text_model_priority() {
            let invoker: Arc<dyn ModelInvoker> = Arc::new(
                ChatInvoker::new(registry.config(kind).clone())?
                    .with_temperature(config.models.temperature)
                    .with_max_tokens(config.models.max_tokens),
            );
            builder = match kind {
                ModelKind::Local => builder.with_local(invoker),
                ModelKind::Cloud => builder.with_cloud(invoker),
            };
        }

        if config.cache.embedding == EmbeddingKind::Hashing {
            builder = builder.with_embedder(Arc::new(HashingEmbedder::new(config.cache.embedding_dim)));
        }

        info!(
            engine = %config.engine.name,
            mode = ?registry.mode(),
            backends = ?registry.text_model_priority(),
            "decision orchestrator ready"
        );
        Ok(builder.build())
    }

    /// Engine config.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prompt store.
    pub fn prompts(&self) -> &Arc<PromptStore> {
        &self.prompts
    }

    /// Where prompt changes are persisted, if anywhere.
    pub fn prompt_repository(&self) -> Option<&Arc<dyn PromptRepository>> {
        self.prompt_repository.as_ref()
    }

    /// Budget governor.
    pub fn budget(&self) -> &Arc<BudgetGovernor> {
        &self.budget
    }

    /// Model registry.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Shared cache store.
    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    fn invoker(&self, kind: ModelKind) -> Option<&Arc<dyn ModelInvoker>> {
        match kind {
            ModelKind::Local => self.local.as_ref(),
            ModelKind::Cloud => self.cloud.as_ref(),
        }
    }

    /// Installed and enabled backends, in call order.
    pub fn callable_kinds(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|k| self.invoker(*k).is_some())
            .collect()
    }

    /// Run the cascade for one request. Never fails.
    pub async fn analyze(&self, request: AnalyzeRequest) -> AnalysisResult {
        let started = Instant::now();
        let trace = DecisionTrace::new();
        let span = tracing::info_span!(
            "moderation.analyze",
            trace_id = %trace.trace_id,
            content_type = request.content_type.as_str(),
            source = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        let result = self.cascade(&request, trace).instrument(span.clone()).await;

        let elapsed = started.elapsed();
        span.record("source", result.source.as_str());
        span.record("duration_ms", duration_ms(elapsed));
        metrics::record_tier_latency("total", elapsed);
        result
    }

    async fn cascade(&self, request: &AnalyzeRequest, mut trace: DecisionTrace) -> AnalysisResult {
        let text = request.content.as_str();
        let content_type = request.content_type;
        let subject = request.subject_id.as_deref();

        if let Some(result) = self.rules.filter(text) {
            trace.record(
                Tier::RuleFilter,
                [("hit", json!(true)), ("rule", json!(result.reason))],
            );
            return self.finish(result, trace);
        }
        trace.record(Tier::RuleFilter, [("hit", json!(false))]);

        let active = self.prompts.active(content_type);
        let prompt_version_id = active.as_ref().map(|v| v.id);
        let cloud_prompt = active.map_or_else(
            || builtin_prompt(ModelKind::Cloud, content_type),
            |v| with_output_contract(&v.content),
        );

        let exact_key = ExactCache::key(text, content_type, prompt_version_id);
        if request.force_jury {
            trace.record(Tier::ExactCache, [("skipped", json!("force_jury"))]);
        } else {
            let t = Instant::now();
            let hit = self.exact.get(&exact_key).await;
            metrics::record_tier_latency(Tier::ExactCache.as_str(), t.elapsed());
            trace.record(Tier::ExactCache, [("hit", json!(hit.is_some()))]);
            if let Some(mut result) = hit {
                result.source = ResultSource::CacheExact;
                return self.finish(result, trace);
            }
        }

        let normalized = normalize(text);
        let embedding = self.embed(&normalized).await;
        match (&self.semantic, &embedding) {
            (Some(semantic), Some(vector)) if !request.force_jury => {
                let t = Instant::now();
                let hit = semantic.lookup(vector, content_type, prompt_version_id).await;
                metrics::record_tier_latency(Tier::SemanticCache.as_str(), t.elapsed());
                match hit {
                    Some((mut result, threshold)) => {
                        trace.record(
                            Tier::SemanticCache,
                            [("hit", json!(true)), ("threshold", json!(threshold))],
                        );
                        result.source = ResultSource::CacheSemantic;
                        return self.finish(result, trace);
                    }
                    None => trace.record(Tier::SemanticCache, [("hit", json!(false))]),
                }
            }
            (Some(_), Some(_)) => {
                trace.record(Tier::SemanticCache, [("skipped", json!("force_jury"))]);
            }
            (Some(_), None) => {
                trace.record(Tier::SemanticCache, [("skipped", json!("no_embedding"))]);
            }
            (None, _) => {}
        }

        let mut verdict = self
            .model_tiers(text, content_type, &cloud_prompt, prompt_version_id, subject, &mut trace)
            .await;

        let convene = request.force_jury
            || (self.config.jury.auto_for_high_priority && request.priority == Priority::High);
        if convene {
            match &self.jury {
                Some(jury) => {
                    if let Some(result) = jury
                        .deliberate(content_type, text, prompt_version_id, subject, &mut trace)
                        .await
                    {
                        verdict = Some(result);
                    }
                }
                None => trace.record(Tier::Jury, [("skipped", json!("unavailable"))]),
            }
        }

        match verdict {
            Some(result) => {
                self.write_back(&exact_key, embedding.as_deref(), content_type, prompt_version_id, &result)
                    .await;
                self.finish(result, trace)
            }
            None => {
                let tag = if self.callable_kinds().is_empty() {
                    DefaultTag::LlmOff
                } else {
                    DefaultTag::AllModelsFailed
                };
                trace.record(Tier::Default, [("reason", json!(tag.as_str()))]);
                metrics::inc_default(tag.as_str());
                self.finish(AnalysisResult::default_tagged(tag, prompt_version_id), trace)
            }
        }
    }

    async fn embed(&self, normalized: &str) -> Option<Vec<f32>> {
        let semantic = self.semantic.as_ref()?;
        if !semantic.applies_to(normalized) {
            return None;
        }
        self.embedder.as_ref()?.embed(normalized).await
    }

    async fn model_tiers(
        &self,
        text: &str,
        content_type: ContentType,
        cloud_prompt: &str,
        prompt_version_id: Option<i64>,
        subject: Option<&str>,
        trace: &mut DecisionTrace,
    ) -> Option<AnalysisResult> {
        let length = text.chars().count();

        let local = match self.invoker(ModelKind::Local) {
            Some(invoker) => {
                // The local model always runs its built-in prompt, so its
                // verdict carries no stored version.
                let prompt = builtin_prompt(ModelKind::Local, content_type);
                self.budget.record_local(length as u64);
                self.call(invoker, &prompt, content_type, text, None, trace)
                    .await
            }
            None => None,
        };

        let Some(local) = local else {
            // Local missing or failed: cloud is the fallback.
            return self
                .call_cloud(text, content_type, cloud_prompt, prompt_version_id, subject, trace)
                .await;
        };

        let escalation = &self.config.escalation;
        let wants_escalation = escalation.enabled
            && local.confidence < escalation.confidence_threshold
            && length >= escalation.min_length;
        if !wants_escalation || self.cloud.is_none() {
            return Some(local);
        }

        trace.record(
            Tier::Escalation,
            [
                ("confidence", json!(local.confidence)),
                ("threshold", json!(escalation.confidence_threshold)),
                ("length", json!(length)),
            ],
        );
        debug!(confidence = local.confidence, "escalating low-confidence local verdict");
        match self
            .call_cloud(text, content_type, cloud_prompt, prompt_version_id, subject, trace)
            .await
        {
            Some(cloud) => Some(cloud),
            None => Some(local),
        }
    }

    async fn call_cloud(
        &self,
        text: &str,
        content_type: ContentType,
        prompt: &str,
        prompt_version_id: Option<i64>,
        subject: Option<&str>,
        trace: &mut DecisionTrace,
    ) -> Option<AnalysisResult> {
        let invoker = self.invoker(ModelKind::Cloud)?;
        let chars = text.chars().count() as u64;
        if let Err(scope) = self.budget.try_acquire(subject, 1, chars) {
            trace.record(
                Tier::Budget,
                [("allowed", json!(false)), ("scope", json!(scope.as_str()))],
            );
            return None;
        }
        trace.record(Tier::Budget, [("allowed", json!(true))]);
        self.call(invoker, prompt, content_type, text, prompt_version_id, trace)
            .await
    }

    async fn call(
        &self,
        invoker: &Arc<dyn ModelInvoker>,
        system_prompt: &str,
        content_type: ContentType,
        text: &str,
        prompt_version_id: Option<i64>,
        trace: &mut DecisionTrace,
    ) -> Option<AnalysisResult> {
        let (tier, source) = match invoker.kind() {
            ModelKind::Local => (Tier::LocalModel, ResultSource::LocalModel),
            ModelKind::Cloud => (Tier::CloudModel, ResultSource::CloudLlm),
        };
        let request = InvokeRequest::for_content(system_prompt, content_type, text);

        let t = Instant::now();
        let verdict = invoker.invoke(&request).await;
        let elapsed = t.elapsed();
        metrics::record_tier_latency(tier.as_str(), elapsed);

        let result = verdict.map(|v| {
            v.into_result(source, invoker.model_name(), prompt_version_id, &self.config.verdict)
        });
        trace.record(
            tier,
            [
                ("model", json!(invoker.model_name())),
                ("ok", json!(result.is_some())),
                ("score", json!(result.as_ref().map(|r| r.score))),
                ("confidence", json!(result.as_ref().map(|r| r.confidence))),
                ("latency_ms", json!(duration_ms(elapsed))),
            ],
        );
        result
    }

    async fn write_back(
        &self,
        exact_key: &str,
        embedding: Option<&[f32]>,
        content_type: ContentType,
        prompt_version_id: Option<i64>,
        result: &AnalysisResult,
    ) {
        let mut stored = result.clone();
        stored.decision_trace = DecisionTrace::default();
        self.exact.put(exact_key, &stored).await;
        if let (Some(semantic), Some(vector)) = (&self.semantic, embedding) {
            semantic
                .store(vector, content_type, prompt_version_id, &stored)
                .await;
        }
    }

    fn finish(&self, mut result: AnalysisResult, trace: DecisionTrace) -> AnalysisResult {
        metrics::inc_tier_hit(result.source.as_str());
        let drop_steps = self.config.trace.retention == TraceRetention::ModelTiers
            && matches!(
                result.source,
                ResultSource::Rule | ResultSource::CacheExact | ResultSource::CacheSemantic
            );
        result.decision_trace = if drop_steps {
            DecisionTrace {
                trace_id: trace.trace_id,
                steps: Vec::new(),
            }
        } else {
            trace
        };
        result
    }

    /// Score `text` with an explicit system prompt, bypassing rules, caches
    /// and the jury. Used by prompt shadow tests.
    ///
    /// `source` selects the backends; with `auto` they are tried in call
    /// order and the first verdict wins. Cloud calls are metered without a
    /// subject.
    pub async fn score_with_prompt(
        &self,
        source: ModelSource,
        content_type: ContentType,
        text: &str,
        system_prompt: &str,
    ) -> Option<AnalysisResult> {
        let prompt = with_output_contract(system_prompt);
        let mut trace = DecisionTrace::new();
        for kind in source.candidates(&self.callable_kinds()) {
            let Some(invoker) = self.invoker(kind) else {
                continue;
            };
            let chars = text.chars().count() as u64;
            match kind {
                ModelKind::Local => self.budget.record_local(chars),
                ModelKind::Cloud => {
                    if self.budget.try_acquire(None, 1, chars).is_err() {
                        continue;
                    }
                }
            }
            if let Some(result) = self
                .call(invoker, &prompt, content_type, text, None, &mut trace)
                .await
            {
                return Some(result);
            }
        }
        None
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
