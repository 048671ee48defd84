//! Labeled sample sources for shadow tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::{AnalysisResult, ContentType};
use crate::ModerationError;

/// Text with its ground-truth verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    /// Kind of content.
    pub content_type: ContentType,
    /// Raw text.
    pub text: String,
    /// Expected score.
    #[serde(alias = "score")]
    pub expected_score: u8,
    /// Expected category.
    #[serde(alias = "category")]
    pub expected_category: String,
}

/// Where shadow tests draw samples from.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Up to `limit` samples of `content_type`, in source order.
    async fn samples(
        &self,
        content_type: ContentType,
        limit: usize,
    ) -> Result<Vec<LabeledSample>, ModerationError>;
}

/// One JSON-encoded [`LabeledSample`] per line. Blank lines and lines
/// starting with `#` are skipped.
#[derive(Debug, Clone)]
pub struct JsonlSampleSource {
    path: PathBuf,
}

impl JsonlSampleSource {
    /// Source reading `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SampleSource for JsonlSampleSource {
    async fn samples(
        &self,
        content_type: ContentType,
        limit: usize,
    ) -> Result<Vec<LabeledSample>, ModerationError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ModerationError::Dataset(format!("{}: {e}", self.path.display()))
        })?;

        let mut out = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let sample: LabeledSample = serde_json::from_str(line).map_err(|e| {
                ModerationError::Dataset(format!("{}:{}: {e}", self.path.display(), n + 1))
            })?;
            if sample.content_type != content_type {
                continue;
            }
            out.push(sample);
            if out.len() >= limit {
                break;
            }
        }
        debug!(path = %self.path.display(), samples = out.len(), "loaded labeled samples");
        Ok(out)
    }
}

/// In-memory samples, e.g. built from reviewed moderation history.
#[derive(Debug, Clone, Default)]
pub struct MemorySampleSource {
    samples: Vec<LabeledSample>,
}

impl MemorySampleSource {
    /// Source over `samples`.
    pub fn new(samples: Vec<LabeledSample>) -> Self {
        Self { samples }
    }

    /// Treat past verdicts as ground truth.
    pub fn from_history<'a, I>(history: I) -> Self
    where
        I: IntoIterator<Item = (ContentType, &'a str, &'a AnalysisResult)>,
    {
        Self::new(
            history
                .into_iter()
                .map(|(content_type, text, result)| LabeledSample {
                    content_type,
                    text: text.to_string(),
                    expected_score: result.score,
                    expected_category: result.category.clone(),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl SampleSource for MemorySampleSource {
    async fn samples(
        &self,
        content_type: ContentType,
        limit: usize,
    ) -> Result<Vec<LabeledSample>, ModerationError> {
        Ok(self
            .samples
            .iter()
            .filter(|s| s.content_type == content_type)
            .take(limit)
            .cloned()
            .collect())
    }
}
