//! Model invokers.
//!
//! [`ModelInvoker`] is the seam between the orchestrator and a backend.
//! [`ChatInvoker`] implements it for any OpenAI-compatible
//! `/chat/completions` endpoint and serves both the local and the cloud
//! class; only its [`ModelConfig`] differs.
//!
//! Invokers never return errors. Every failure is logged, counted in
//! `moderation_model_failures_total{backend,kind}` and reported as `None`
//! so the caller can fall through to the next tier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::extract::parse_verdict;
use super::prompts::user_message;
use super::{ModelConfig, ModelKind};
use crate::config::VerdictConfig;
use crate::metrics;
use crate::types::{
    clamp_confidence, confidence_from_score, AnalysisResult, ContentType, DecisionTrace,
    ResultSource,
};
use crate::ModerationError;

/// One chat call: a system prompt and a user message.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    /// System prompt.
    pub system_prompt: String,
    /// User message.
    pub user_message: String,
}

impl InvokeRequest {
    /// Request with an explicit user message.
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
        }
    }

    /// Request scoring `text` of the given type.
    pub fn for_content(
        system_prompt: impl Into<String>,
        content_type: ContentType,
        text: &str,
    ) -> Self {
        Self::new(system_prompt, user_message(content_type, text))
    }
}

/// Structured verdict parsed from model output.
///
/// Optional fields are filled in by [`ModelVerdict::into_result`]:
/// confidence from the score, flags from the verdict thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVerdict {
    /// Score, already clamped to `0..=100`.
    pub score: u8,
    /// Category label.
    pub category: String,
    /// Short reason.
    pub reason: String,
    /// Reported confidence, if any.
    pub confidence: Option<f64>,
    /// Reported highlight flag, if any.
    pub is_highlight: Option<bool>,
    /// Reported inappropriate flag, if any.
    pub is_inappropriate: Option<bool>,
    /// Raw model text the verdict was parsed from.
    pub raw: String,
}

impl ModelVerdict {
    /// Effective confidence: the reported one clamped, or `score / 100`.
    pub fn effective_confidence(&self) -> f64 {
        self.confidence
            .map_or_else(|| confidence_from_score(self.score), clamp_confidence)
    }

    /// Build an [`AnalysisResult`] from this verdict.
    pub fn into_result(
        self,
        source: ResultSource,
        model_name: &str,
        prompt_version_id: Option<i64>,
        thresholds: &VerdictConfig,
    ) -> AnalysisResult {
        let confidence = self.effective_confidence();
        AnalysisResult {
            score: self.score,
            category: self.category,
            reason: self.reason,
            confidence,
            is_highlight: self
                .is_highlight
                .unwrap_or(self.score >= thresholds.highlight_threshold),
            is_inappropriate: self
                .is_inappropriate
                .unwrap_or(self.score <= thresholds.inappropriate_threshold),
            source,
            model_name: model_name.to_string(),
            prompt_version_id,
            decision_trace: DecisionTrace::default(),
        }
    }
}

/// A backend able to score content.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn ModelInvoker>`.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Backend class.
    fn kind(&self) -> ModelKind;

    /// Model identifier, recorded on results.
    fn model_name(&self) -> &str;

    /// Run one chat call. `None` on any failure.
    async fn invoke(&self, request: &InvokeRequest) -> Option<ModelVerdict>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Failure classes reported in metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 4xx other than 429.
    ClientError,
    /// 5xx.
    ServerError,
    /// 429.
    RateLimited,
    /// Transport error other than a timeout.
    Exception,
    /// Request exceeded the backend timeout.
    Timeout,
    /// Response body or verdict could not be parsed.
    ParseError,
}

impl FailureKind {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ClientError => "client_error",
            FailureKind::ServerError => "server_error",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Exception => "exception",
            FailureKind::Timeout => "timeout",
            FailureKind::ParseError => "parse_error",
        }
    }

    fn from_status(status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            FailureKind::RateLimited
        } else if status.is_server_error() {
            FailureKind::ServerError
        } else {
            FailureKind::ClientError
        }
    }
}

/// OpenAI-compatible chat invoker with its own concurrency limit.
///
/// ## Example
///
/// ```no_run
/// use tokio_moderation_orchestrator::{ChatInvoker, ModelRegistry, ModelKind, EngineConfig};
///
/// let registry = ModelRegistry::from_config(&EngineConfig::default());
/// let local = ChatInvoker::new(registry.config(ModelKind::Local).clone())?
///     .with_temperature(0.0)
///     .with_max_tokens(128);
/// # Ok::<(), tokio_moderation_orchestrator::ModerationError>(())
/// ```
pub struct ChatInvoker {
    client: reqwest::Client,
    config: ModelConfig,
    permits: Arc<Semaphore>,
    temperature: f32,
    max_tokens: u32,
}

impl ChatInvoker {
    /// Create an invoker for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::ConfigError`] if the HTTP client cannot be
    /// built.
    pub fn new(config: ModelConfig) -> Result<Self, ModerationError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ModerationError::ConfigError(format!("http client: {e}")))?;
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Ok(Self {
            client,
            config,
            permits,
            temperature: 0.1,
            max_tokens: 256,
        })
    }

    /// Set temperature (0.0 - 2.0).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn fail(&self, kind: FailureKind, detail: &str) -> Option<ModelVerdict> {
        warn!(
            backend = self.config.kind.as_str(),
            model = %self.config.name,
            failure = kind.as_str(),
            detail = detail,
            "model call failed"
        );
        metrics::inc_model_failure(self.config.kind.as_str(), kind.as_str());
        None
    }

    async fn call(&self, request: &InvokeRequest) -> Result<String, (FailureKind, String)> {
        let body = ChatRequest {
            model: &self.config.name,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_message,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Content-Type", "application/json")
            .timeout(self.config.timeout)
            .json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                FailureKind::Timeout
            } else {
                FailureKind::Exception
            };
            (kind, e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err((FailureKind::from_status(status), format!("HTTP {status}")));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            let kind = if e.is_timeout() {
                FailureKind::Timeout
            } else {
                FailureKind::ParseError
            };
            (kind, e.to_string())
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| (FailureKind::ParseError, "no message content".to_string()))
    }
}

#[async_trait]
impl ModelInvoker for ChatInvoker {
    fn kind(&self) -> ModelKind {
        self.config.kind
    }

    fn model_name(&self) -> &str {
        &self.config.name
    }

    async fn invoke(&self, request: &InvokeRequest) -> Option<ModelVerdict> {
        // The deadline covers the wait for a permit as well as the request.
        let attempt = tokio::time::timeout(self.config.timeout, async {
            match self.permits.acquire().await {
                Ok(_permit) => self.call(request).await,
                Err(_) => Err((FailureKind::Exception, "semaphore closed".to_string())),
            }
        })
        .await;

        let content = match attempt {
            Ok(Ok(content)) => content,
            Ok(Err((kind, detail))) => return self.fail(kind, &detail),
            Err(_) => return self.fail(FailureKind::Timeout, "deadline elapsed"),
        };

        match parse_verdict(&content) {
            Some(verdict) => {
                debug!(
                    backend = self.config.kind.as_str(),
                    score = verdict.score,
                    "model verdict parsed"
                );
                Some(verdict)
            }
            None => self.fail(FailureKind::ParseError, "no verdict in model output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(score: u8) -> ModelVerdict {
        ModelVerdict {
            score,
            category: "general".into(),
            reason: String::new(),
            confidence: None,
            is_highlight: None,
            is_inappropriate: None,
            raw: String::new(),
        }
    }

    #[test]
    fn test_confidence_defaults_to_score_fraction() {
        assert!((verdict(65).effective_confidence() - 0.65).abs() < 1e-9);
        let mut v = verdict(65);
        v.confidence = Some(3.0);
        assert!((v.effective_confidence() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_flags_follow_thresholds_when_missing() {
        let t = VerdictConfig::default();
        let high = verdict(85).into_result(ResultSource::CloudLlm, "m", None, &t);
        assert!(high.is_highlight && !high.is_inappropriate);
        let low = verdict(10).into_result(ResultSource::CloudLlm, "m", None, &t);
        assert!(!low.is_highlight && low.is_inappropriate);
    }

    #[test]
    fn test_reported_flags_win() {
        let mut v = verdict(85);
        v.is_highlight = Some(false);
        let r = v.into_result(ResultSource::LocalModel, "qwen", Some(3), &VerdictConfig::default());
        assert!(!r.is_highlight);
        assert_eq!(r.model_name, "qwen");
        assert_eq!(r.prompt_version_id, Some(3));
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert_eq!(
            FailureKind::from_status(StatusCode::TOO_MANY_REQUESTS),
            FailureKind::RateLimited
        );
        assert_eq!(
            FailureKind::from_status(StatusCode::BAD_GATEWAY),
            FailureKind::ServerError
        );
        assert_eq!(
            FailureKind::from_status(StatusCode::UNAUTHORIZED),
            FailureKind::ClientError
        );
    }
}
