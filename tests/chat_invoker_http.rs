//! [`ChatInvoker`] against a mock OpenAI-compatible server.
//!
//! Every failure mode must come back as `None`, never as a panic or error.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tokio_moderation_orchestrator::config::OperatingMode;
use tokio_moderation_orchestrator::models::{InvokeRequest, ModelConfig};
use tokio_moderation_orchestrator::{
    AnalyzeRequest, ChatInvoker, ContentType, DecisionOrchestrator, EngineConfig, ModelInvoker,
    ModelKind, ResultSource,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn model_config(kind: ModelKind, base_url: &str, timeout: Duration) -> ModelConfig {
    ModelConfig {
        kind,
        name: "test-model".to_string(),
        base_url: base_url.to_string(),
        api_key: Some("sk-test".to_string()),
        timeout,
        max_concurrency: 2,
    }
}

fn invoker_at(server: &MockServer) -> ChatInvoker {
    ChatInvoker::new(model_config(ModelKind::Cloud, &server.uri(), Duration::from_secs(5)))
        .expect("test: invoker")
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    })
}

fn request() -> InvokeRequest {
    InvokeRequest::for_content("score it", ContentType::Comment, "a decent comment")
}

async fn mount_status(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Fenced JSON in the reply is parsed; the key and model name are sent.
#[tokio::test]
async fn fenced_json_reply_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({ "model": "test-model" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            "Sure:\n```json\n{\"score\": 73, \"category\": \"insightful\", \"confidence\": 88}\n```",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let verdict = invoker_at(&server)
        .invoke(&request())
        .await
        .expect("test: verdict");

    assert_eq!(verdict.score, 73);
    assert_eq!(verdict.category, "insightful");
    assert_eq!(verdict.confidence, Some(0.88));
}

#[tokio::test]
async fn rate_limited_reply_abstains() {
    let server = MockServer::start().await;
    mount_status(&server, 429).await;
    assert!(invoker_at(&server).invoke(&request()).await.is_none());
}

#[tokio::test]
async fn server_error_abstains() {
    let server = MockServer::start().await;
    mount_status(&server, 500).await;
    assert!(invoker_at(&server).invoke(&request()).await.is_none());
}

#[tokio::test]
async fn unauthorized_abstains() {
    let server = MockServer::start().await;
    mount_status(&server, 401).await;
    assert!(invoker_at(&server).invoke(&request()).await.is_none());
}

#[tokio::test]
async fn reply_without_score_abstains() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion("I cannot rate this comment.")),
        )
        .mount(&server)
        .await;
    assert!(invoker_at(&server).invoke(&request()).await.is_none());
}

#[tokio::test]
async fn slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("{\"score\": 50}"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let invoker = ChatInvoker::new(model_config(
        ModelKind::Local,
        &server.uri(),
        Duration::from_millis(100),
    ))
    .expect("test: invoker");
    assert!(invoker.invoke(&request()).await.is_none());
}

/// A failing cloud backend ends the cascade in a tagged default.
#[tokio::test]
async fn orchestrator_defaults_when_cloud_is_rate_limited() {
    let server = MockServer::start().await;
    mount_status(&server, 429).await;

    let mut config = EngineConfig::default();
    config.engine.mode = OperatingMode::CloudOnly;
    let engine = DecisionOrchestrator::builder(config)
        .with_cloud(std::sync::Arc::new(invoker_at(&server)))
        .build();

    let r = engine
        .analyze(AnalyzeRequest::new("an ordinary remark", ContentType::Comment))
        .await;
    assert_eq!(r.source, ResultSource::Default);
    assert_eq!(r.reason, "all_models_failed");
}

/// A caller queued behind a slow request gives up within its own deadline.
#[tokio::test]
async fn queued_call_counts_permit_wait_against_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("{\"score\": 50}"))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let mut config = model_config(ModelKind::Local, &server.uri(), Duration::from_millis(300));
    config.max_concurrency = 1;
    let invoker = std::sync::Arc::new(ChatInvoker::new(config).expect("test: invoker"));

    let first = {
        let invoker = std::sync::Arc::clone(&invoker);
        tokio::spawn(async move { invoker.invoke(&request()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    let second = invoker.invoke(&request()).await;
    let waited = started.elapsed();

    assert!(second.is_none());
    assert!(
        waited < Duration::from_millis(450),
        "queued call waited {waited:?}"
    );
    assert!(first.await.expect("test: first call").is_none());
}
