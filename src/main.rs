//! `moderation-engine`: command-line front end for the moderation cascade.
//!
//! ## Environment Variables
//!
//! - `MODERATION_CONFIG`: path to the engine TOML (same as `--config`)
//! - `MODERATION_LOCAL_API_KEY` / `MODERATION_CLOUD_API_KEY`: backend keys
//! - `LOG_FORMAT=json`: structured JSON logs
//! - `RUST_LOG=info`: log level filter
//!
//! Logs go to stderr; results are printed to stdout as JSON lines.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_moderation_orchestrator::config::{export_schema, loader};
use tokio_moderation_orchestrator::shadow::{JsonlSampleSource, ShadowHarness};
use tokio_moderation_orchestrator::{
    init_tracing_with, metrics, AnalyzeRequest, BatchQueue, ContentItem, ContentType,
    DecisionOrchestrator, EnqueueOutcome, MemoryContentStore, ModelSource,
    ModerationError, Priority, QueueSupervisor, Recommendation,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "moderation-engine",
    version,
    about = "Cost-aware content moderation: rules, caches, local/cloud models and jury"
)]
struct Cli {
    /// Engine configuration file (TOML). Defaults are used when omitted.
    #[arg(long, short, global = true, env = "MODERATION_CONFIG")]
    config: Option<PathBuf>,

    /// Print Prometheus metrics to stderr before exiting.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score texts given as arguments, or one per stdin line
    Analyze(AnalyzeArgs),
    /// Run a JSONL file of items through the batch queue
    Batch(BatchArgs),
    /// Shadow-test a candidate prompt against the active one
    PromptTest(PromptTestArgs),
    /// Print the configuration JSON Schema
    Schema,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Content type: comment or danmaku.
    #[arg(long = "type", short = 't', default_value = "comment")]
    content_type: ContentType,

    /// Convene the jury and skip cache reads.
    #[arg(long)]
    jury: bool,

    /// Priority: low, normal or high.
    #[arg(long, default_value = "normal", value_parser = parse_priority)]
    priority: Priority,

    /// Budget subject for cloud calls.
    #[arg(long)]
    subject: Option<String>,

    /// Texts to score. Reads stdin when empty.
    texts: Vec<String>,
}

#[derive(Args)]
struct BatchArgs {
    /// JSONL file of `{"content_type", "id", "text", "priority"?, "subject"?}`.
    input: PathBuf,
}

#[derive(Args)]
struct PromptTestArgs {
    /// Content type the candidate applies to.
    #[arg(long = "type", short = 't', default_value = "comment")]
    content_type: ContentType,

    /// File holding the candidate prompt text.
    #[arg(long)]
    candidate: PathBuf,

    /// JSONL file of labeled samples.
    #[arg(long)]
    dataset: PathBuf,

    /// Maximum samples; 0 uses `shadow.default_sample_limit`.
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Backend selection: auto, local or cloud.
    #[arg(long, default_value = "auto")]
    source: ModelSource,

    /// Publish the candidate when the recommendation is `publish`.
    #[arg(long)]
    publish: bool,
}

#[derive(Debug, Deserialize)]
struct BatchLine {
    #[serde(flatten)]
    item: ContentItem,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    subject: Option<String>,
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    Priority::from_name(s).ok_or_else(|| format!("unknown priority '{s}'"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), ModerationError> {
    let line = serde_json::to_string(value).map_err(|e| ModerationError::Other(e.to_string()))?;
    println!("{line}");
    Ok(())
}

async fn analyze(engine: &DecisionOrchestrator, args: AnalyzeArgs) -> Result<(), ModerationError> {
    let texts = if args.texts.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ModerationError::Other(format!("stdin: {e}")))?
    } else {
        args.texts
    };

    for text in texts {
        let mut request = AnalyzeRequest::new(text, args.content_type)
            .with_priority(args.priority)
            .with_jury(args.jury);
        if let Some(subject) = &args.subject {
            request = request.with_subject(subject.clone());
        }
        let result = engine.analyze(request).await;
        print_json(&result)?;
    }
    Ok(())
}

async fn batch(engine: Arc<DecisionOrchestrator>, args: BatchArgs) -> Result<(), ModerationError> {
    let raw = tokio::fs::read_to_string(&args.input)
        .await
        .map_err(|e| ModerationError::Storage(format!("{}: {e}", args.input.display())))?;

    let store = Arc::new(MemoryContentStore::new());
    let queue = Arc::new(BatchQueue::new(engine.config().queue.clone()));
    let supervisor = QueueSupervisor::spawn(Arc::clone(&queue), engine, store.clone());

    let mut shed = 0usize;
    for (n, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line: BatchLine = serde_json::from_str(line).map_err(|e| {
            ModerationError::Storage(format!("{}:{}: {e}", args.input.display(), n + 1))
        })?;
        let ContentItem {
            id,
            content_type,
            text,
        } = line.item;
        store.insert(content_type, id.clone(), text);
        match queue
            .enqueue_with_subject(content_type, id.clone(), line.priority, line.subject)
            .await
        {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Shed => shed += 1,
            other => warn!(id = %id, outcome = ?other, "item not queued"),
        }
    }

    supervisor.shutdown().await;
    info!(
        results = store.results().len(),
        shed = shed,
        tiers = ?metrics::tier_hit_counts(),
        "batch complete"
    );

    let mut results = store.results();
    results.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    for (content_type, id, result) in results {
        print_json(&serde_json::json!({
            "content_type": content_type,
            "id": id,
            "result": result,
        }))?;
    }
    Ok(())
}

async fn prompt_test(
    engine: Arc<DecisionOrchestrator>,
    args: PromptTestArgs,
) -> Result<(), ModerationError> {
    let content = tokio::fs::read_to_string(&args.candidate)
        .await
        .map_err(|e| ModerationError::Other(format!("{}: {e}", args.candidate.display())))?;

    let harness = ShadowHarness::open(engine).await?;
    let candidate = harness.create_prompt(args.content_type, content).await?;
    let dataset = JsonlSampleSource::new(&args.dataset);

    let experiment = harness
        .run_prompt_test(candidate.id, args.limit, args.source, &dataset)
        .await?;
    print_json(&experiment)?;

    if args.publish {
        if experiment.recommendation == Recommendation::Publish {
            harness.publish_prompt(candidate.id).await?;
        } else {
            warn!(
                recommendation = experiment.recommendation.as_str(),
                "candidate not published"
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::Schema = cli.cmd {
        println!("{}", export_schema()?);
        return Ok(());
    }

    let config = loader::load(cli.config.as_deref())?;
    let _ = init_tracing_with(config.observability.log_format);
    metrics::init_metrics()?;

    let engine = Arc::new(DecisionOrchestrator::from_config(config).await?);

    match cli.cmd {
        Command::Analyze(args) => analyze(&engine, args).await?,
        Command::Batch(args) => batch(Arc::clone(&engine), args).await?,
        Command::PromptTest(args) => prompt_test(Arc::clone(&engine), args).await?,
        Command::Schema => {}
    }

    if cli.metrics {
        eprintln!("{}", metrics::gather_metrics());
    }
    Ok(())
}
