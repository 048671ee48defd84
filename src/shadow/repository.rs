//! Durable storage for prompt versions and experiments.
//!
//! [`PromptRepository`] is the persistence seam. [`JsonFilePromptRepository`]
//! keeps the whole state in one JSON document that is rewritten on every
//! change, via a temp file and a rename so a crash never leaves a torn file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::store::{Experiment, PromptVersion};
use crate::ModerationError;

/// Everything a repository stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptSnapshot {
    /// Every prompt version, oldest first.
    #[serde(default)]
    pub versions: Vec<PromptVersion>,
    /// Every experiment, oldest first.
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

/// Loads and saves prompt state across restarts.
#[async_trait]
pub trait PromptRepository: Send + Sync {
    /// Stored state. A repository that has never been written is empty.
    ///
    /// # Errors
    ///
    /// [`ModerationError::Storage`] when the state exists but cannot be read.
    async fn load(&self) -> Result<PromptSnapshot, ModerationError>;

    /// Replace the stored state with `snapshot`.
    ///
    /// # Errors
    ///
    /// [`ModerationError::Storage`] when the state cannot be written.
    async fn save(&self, snapshot: &PromptSnapshot) -> Result<(), ModerationError>;
}

/// [`PromptRepository`] backed by one JSON file.
#[derive(Debug, Clone)]
pub struct JsonFilePromptRepository {
    path: PathBuf,
}

impl JsonFilePromptRepository {
    /// Repository at `path`. Nothing is touched until the first load or save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File backing this repository.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn storage_error(path: &Path, what: &str, e: impl std::fmt::Display) -> ModerationError {
    ModerationError::Storage(format!("{what} {}: {e}", path.display()))
}

#[async_trait]
impl PromptRepository for JsonFilePromptRepository {
    async fn load(&self) -> Result<PromptSnapshot, ModerationError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no prompt store yet");
                return Ok(PromptSnapshot::default());
            }
            Err(e) => return Err(storage_error(&self.path, "failed to read", e)),
        };
        serde_json::from_str(&raw).map_err(|e| storage_error(&self.path, "failed to parse", e))
    }

    async fn save(&self, snapshot: &PromptSnapshot) -> Result<(), ModerationError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(parent, "failed to create", e))?;
        }
        let body = serde_json::to_string_pretty(snapshot)
            .map_err(|e| storage_error(&self.path, "failed to encode", e))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, body)
            .await
            .map_err(|e| storage_error(&temp_path, "failed to write", e))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| storage_error(&self.path, "failed to replace", e))?;

        debug!(
            path = %self.path.display(),
            versions = snapshot.versions.len(),
            experiments = snapshot.experiments.len(),
            "prompt store saved"
        );
        Ok(())
    }
}
