//! Prompt shadow tests and publishing.

mod common;

use common::{config, Reply, ScriptedInvoker};
use std::sync::Arc;
use tokio_moderation_orchestrator::config::OperatingMode;
use tokio_moderation_orchestrator::shadow::{LabeledSample, MemorySampleSource};
use tokio_moderation_orchestrator::{
    ContentType, DecisionOrchestrator, EngineConfig, ModelKind, ModelSource, ModerationError,
    Recommendation, ShadowHarness,
};

fn samples(n: usize, score: u8, category: &str) -> MemorySampleSource {
    MemorySampleSource::new(
        (0..n)
            .map(|i| LabeledSample {
                content_type: ContentType::Comment,
                text: format!("labeled comment {i}"),
                expected_score: score,
                expected_category: category.to_string(),
            })
            .collect(),
    )
}

fn harness(invoker: Arc<ScriptedInvoker>) -> ShadowHarness {
    let engine = DecisionOrchestrator::builder(config(OperatingMode::CloudOnly))
        .with_cloud(invoker)
        .build();
    ShadowHarness::new(Arc::new(engine))
}

#[tokio::test]
async fn identical_candidate_is_consistent_and_monitored() {
    let cloud = ScriptedInvoker::new(ModelKind::Cloud, Some(Reply::new(70, "insightful"))).arc();
    let harness = harness(cloud.clone());
    let active = harness
        .prompts()
        .active(ContentType::Comment)
        .expect("test: seeded prompt");
    let candidate = harness.prompts().create(ContentType::Comment, active.content.clone());

    let experiment = harness
        .run_prompt_test(candidate.id, 20, ModelSource::Cloud, &samples(20, 70, "insightful"))
        .await
        .expect("test: experiment");

    assert_eq!(experiment.sample_count, 20);
    assert!((experiment.metrics.consistency_rate - 1.0).abs() < 1e-9);
    assert_eq!(experiment.metrics.compared, 20);
    assert_eq!(experiment.recommendation, Recommendation::Monitor);
    assert_eq!(cloud.calls(), 40);
    assert_eq!(harness.experiments().list().len(), 1);
}

#[tokio::test]
async fn better_candidate_is_recommended_for_publish() {
    let cloud = ScriptedInvoker::new(ModelKind::Cloud, Some(Reply::new(40, "general")))
        .on("CANDIDATE", Some(Reply::new(88, "insightful")))
        .arc();
    let harness = harness(cloud);
    let candidate = harness
        .prompts()
        .create(ContentType::Comment, "CANDIDATE: score the comment carefully");

    let experiment = harness
        .run_prompt_test(candidate.id, 0, ModelSource::Auto, &samples(10, 90, "insightful"))
        .await
        .expect("test: experiment");

    assert_eq!(experiment.recommendation, Recommendation::Publish);
    assert!(experiment.metrics.mae_delta < 0.0);
    assert!(experiment.metrics.match_rate_delta > 0.0);
}

#[tokio::test]
async fn local_source_without_local_backend_refines() {
    let cloud = ScriptedInvoker::new(ModelKind::Cloud, Some(Reply::new(70, "insightful"))).arc();
    let harness = harness(cloud.clone());
    let candidate = harness.prompts().create(ContentType::Comment, "another prompt");

    let experiment = harness
        .run_prompt_test(candidate.id, 5, ModelSource::Local, &samples(5, 70, "insightful"))
        .await
        .expect("test: experiment");

    assert_eq!(cloud.calls(), 0);
    assert_eq!(experiment.metrics.candidate.failed, 5);
    assert_eq!(experiment.recommendation, Recommendation::Refine);
}

#[tokio::test]
async fn lookup_failures_are_errors() {
    let cloud = ScriptedInvoker::new(ModelKind::Cloud, Some(Reply::new(70, "x"))).arc();
    let harness = harness(cloud);

    let missing = harness
        .run_prompt_test(999, 5, ModelSource::Auto, &samples(5, 70, "x"))
        .await;
    assert!(matches!(missing, Err(ModerationError::PromptNotFound(999))));

    let candidate = harness.prompts().create(ContentType::Comment, "p");
    let empty = harness
        .run_prompt_test(candidate.id, 5, ModelSource::Auto, &MemorySampleSource::default())
        .await;
    assert!(matches!(empty, Err(ModerationError::Dataset(_))));
}

#[tokio::test]
async fn publishing_switches_only_its_content_type() {
    let cloud = ScriptedInvoker::new(ModelKind::Cloud, Some(Reply::new(70, "x"))).arc();
    let harness = harness(cloud);
    let danmaku_before = harness
        .prompts()
        .active(ContentType::Danmaku)
        .expect("test: seeded danmaku");

    let b = harness.prompts().create(ContentType::Comment, "version b");
    let c = harness.prompts().create(ContentType::Comment, "version c");
    harness.publish_prompt(b.id).await.expect("test: publish");

    let comments = harness.prompts().list(ContentType::Comment);
    let active: Vec<i64> = comments.iter().filter(|v| v.is_active).map(|v| v.id).collect();
    assert_eq!(active, vec![b.id]);
    assert!(!harness.prompts().get(c.id).expect("test: c").is_active);
    assert_eq!(
        harness.prompts().active(ContentType::Danmaku),
        Some(danmaku_before)
    );

    assert!(matches!(
        harness.publish_prompt(12345).await,
        Err(ModerationError::PromptNotFound(12345))
    ));
}

#[tokio::test]
async fn published_prompt_drives_cloud_analysis() {
    let cloud = ScriptedInvoker::new(ModelKind::Cloud, Some(Reply::new(50, "general")))
        .on("STRICT", Some(Reply::new(12, "spam")))
        .arc();
    let engine = Arc::new(
        DecisionOrchestrator::builder(config(OperatingMode::CloudOnly))
            .with_cloud(cloud)
            .build(),
    );
    let harness = ShadowHarness::new(Arc::clone(&engine));
    let strict = harness.prompts().create(ContentType::Comment, "STRICT reviewer");
    harness.publish_prompt(strict.id).await.expect("test: publish");

    let r = engine
        .analyze(tokio_moderation_orchestrator::AnalyzeRequest::new(
            "buy followers now",
            ContentType::Comment,
        ))
        .await;
    assert_eq!(r.score, 12);
    assert_eq!(r.prompt_version_id, Some(strict.id));
}

fn persisted_config(path: &std::path::Path) -> EngineConfig {
    let mut config = config(OperatingMode::Off);
    config.prompts.store_path = Some(path.to_path_buf());
    config
}

/// A published prompt is still active after the engine is rebuilt from the
/// same store file, and earlier experiments come back with it.
#[tokio::test]
async fn published_prompt_survives_reopen() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let path = dir.path().join("prompts.json");

    let engine = Arc::new(
        DecisionOrchestrator::from_config(persisted_config(&path))
            .await
            .expect("test: engine"),
    );
    let harness = ShadowHarness::open(engine).await.expect("test: harness");
    let seeded = harness
        .prompts()
        .active(ContentType::Comment)
        .expect("test: seeded");
    let strict = harness
        .create_prompt(ContentType::Comment, "STRICT reviewer")
        .await
        .expect("test: create");
    let refused = harness
        .run_prompt_test(strict.id, 3, ModelSource::Auto, &samples(3, 40, "general"))
        .await
        .expect("test: experiment");
    assert_eq!(refused.recommendation, Recommendation::Refine);
    harness.publish_prompt(strict.id).await.expect("test: publish");
    drop(harness);

    let reopened = Arc::new(
        DecisionOrchestrator::from_config(persisted_config(&path))
            .await
            .expect("test: reopened engine"),
    );
    let active = reopened
        .prompts()
        .active(ContentType::Comment)
        .expect("test: active after reopen");
    assert_eq!(active.id, strict.id);
    assert_eq!(active.content, "STRICT reviewer");
    assert!(!reopened.prompts().get(seeded.id).expect("test: seeded").is_active);
    // Seeding leaves content types that already have versions alone.
    assert_eq!(reopened.prompts().list(ContentType::Comment).len(), 2);

    let harness = ShadowHarness::open(reopened).await.expect("test: harness");
    assert_eq!(harness.experiments().list(), vec![refused]);
    let next = harness
        .create_prompt(ContentType::Comment, "later")
        .await
        .expect("test: create");
    assert!(next.id > strict.id);
}

#[tokio::test]
async fn unreadable_store_fails_engine_construction() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let path = dir.path().join("prompts.json");
    std::fs::write(&path, "[broken").expect("test: write");

    let built = DecisionOrchestrator::from_config(persisted_config(&path)).await;
    assert!(matches!(built, Err(ModerationError::Storage(_))));
}
