//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_moderation_orchestrator::config::OperatingMode;
use tokio_moderation_orchestrator::models::InvokeRequest;
use tokio_moderation_orchestrator::{EngineConfig, ModelInvoker, ModelKind, ModelVerdict};

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub score: u8,
    pub category: &'static str,
    pub confidence: Option<f64>,
}

impl Reply {
    pub fn new(score: u8, category: &'static str) -> Self {
        Self {
            score,
            category,
            confidence: None,
        }
    }

    pub fn confident(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Invoker answering from a script keyed by system-prompt substrings.
/// The first matching rule wins; no match uses the fallback.
pub struct ScriptedInvoker {
    kind: ModelKind,
    name: String,
    rules: Vec<(&'static str, Option<Reply>)>,
    fallback: Option<Reply>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new(kind: ModelKind, fallback: Option<Reply>) -> Self {
        Self {
            kind,
            name: format!("mock-{}", kind.as_str()),
            rules: Vec::new(),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on(mut self, needle: &'static str, reply: Option<Reply>) -> Self {
        self.rules.push((needle, reply));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvokeRequest) -> Option<ModelVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| request.system_prompt.contains(needle))
            .map_or_else(|| self.fallback.clone(), |(_, r)| r.clone())?;
        Some(ModelVerdict {
            score: reply.score,
            category: reply.category.to_string(),
            reason: "scripted".to_string(),
            confidence: reply.confidence,
            is_highlight: None,
            is_inappropriate: None,
            raw: format!("{{\"score\": {}}}", reply.score),
        })
    }
}

/// Default config in the given mode.
pub fn config(mode: OperatingMode) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.mode = mode;
    config
}
