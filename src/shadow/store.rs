//! Prompt version and experiment stores.
//!
//! Both live in memory and can be snapshotted to, or restored from, a
//! [`PromptRepository`](super::repository::PromptRepository). Prompt
//! versions are mutable only through [`PromptStore::activate`]; experiments
//! are append-only and handed out as clones.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::ExperimentMetrics;
use crate::models::prompts::builtin_prompt;
use crate::models::{ModelKind, ModelSource};
use crate::types::ContentType;
use crate::ModerationError;

/// A stored system prompt for one content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    /// Store-assigned id, increasing from 1.
    pub id: i64,
    /// Content type the prompt applies to.
    pub content_type: ContentType,
    /// Prompt text.
    pub content: String,
    /// At most one active version per content type.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PromptTable {
    next_id: i64,
    versions: Vec<PromptVersion>,
}

/// Versioned prompt store.
#[derive(Debug, Default)]
pub struct PromptStore {
    table: RwLock<PromptTable>,
}

impl PromptStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with one active built-in cloud prompt per content type.
    pub fn with_builtin() -> Self {
        let store = Self::new();
        store.seed_builtin();
        store
    }

    /// For every content type with no versions at all, create and activate
    /// the built-in cloud prompt.
    pub fn seed_builtin(&self) {
        let mut table = self.table.write();
        for ct in ContentType::ALL {
            if table.versions.iter().any(|v| v.content_type == ct) {
                continue;
            }
            table.next_id += 1;
            let id = table.next_id;
            table.versions.push(PromptVersion {
                id,
                content_type: ct,
                content: builtin_prompt(ModelKind::Cloud, ct),
                is_active: true,
                created_at: Utc::now(),
            });
            info!(content_type = %ct, version_id = id, "seeded built-in prompt");
        }
    }

    /// Add an inactive version.
    pub fn create(&self, content_type: ContentType, content: impl Into<String>) -> PromptVersion {
        let mut table = self.table.write();
        table.next_id += 1;
        let version = PromptVersion {
            id: table.next_id,
            content_type,
            content: content.into(),
            is_active: false,
            created_at: Utc::now(),
        };
        table.versions.push(version.clone());
        version
    }

    /// Activate `id` and deactivate every other version of its content type,
    /// under one write lock.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::PromptNotFound`] for an unknown id.
    pub fn activate(&self, id: i64) -> Result<PromptVersion, ModerationError> {
        let mut table = self.table.write();
        let content_type = table
            .versions
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.content_type)
            .ok_or(ModerationError::PromptNotFound(id))?;

        let mut activated = None;
        for v in table
            .versions
            .iter_mut()
            .filter(|v| v.content_type == content_type)
        {
            v.is_active = v.id == id;
            if v.is_active {
                activated = Some(v.clone());
            }
        }
        activated.ok_or(ModerationError::PromptNotFound(id))
    }

    /// Active version for a content type.
    pub fn active(&self, content_type: ContentType) -> Option<PromptVersion> {
        self.table
            .read()
            .versions
            .iter()
            .find(|v| v.content_type == content_type && v.is_active)
            .cloned()
    }

    /// Version by id.
    pub fn get(&self, id: i64) -> Option<PromptVersion> {
        self.table.read().versions.iter().find(|v| v.id == id).cloned()
    }

    /// Every version, oldest first.
    pub fn snapshot(&self) -> Vec<PromptVersion> {
        self.table.read().versions.clone()
    }

    /// Replace the contents with `versions`. New ids continue after the
    /// highest restored one.
    pub fn restore(&self, mut versions: Vec<PromptVersion>) {
        versions.sort_by_key(|v| v.id);
        let mut table = self.table.write();
        table.next_id = versions.last().map_or(0, |v| v.id);
        table.versions = versions;
    }

    /// All versions of a content type, oldest first.
    pub fn list(&self, content_type: ContentType) -> Vec<PromptVersion> {
        self.table
            .read()
            .versions
            .iter()
            .filter(|v| v.content_type == content_type)
            .cloned()
            .collect()
    }
}

/// Shadow-test outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Candidate is clearly better.
    Publish,
    /// No meaningful difference.
    Monitor,
    /// Candidate is worse, mixed, or could not be evaluated.
    Refine,
}

impl Recommendation {
    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Publish => "publish",
            Recommendation::Monitor => "monitor",
            Recommendation::Refine => "refine",
        }
    }
}

/// Persisted record of one shadow test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Store-assigned id.
    pub id: i64,
    /// Content type under test.
    pub content_type: ContentType,
    /// Version under test.
    pub candidate_version_id: i64,
    /// Version it was compared against.
    pub active_version_id: i64,
    /// Backend selection used for both variants.
    pub model_source: ModelSource,
    /// Samples drawn from the dataset.
    pub sample_count: usize,
    /// Computed metrics.
    pub metrics: ExperimentMetrics,
    /// Outcome.
    pub recommendation: Recommendation,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Append-only experiment log.
#[derive(Debug, Default)]
pub struct ExperimentStore {
    records: RwLock<Vec<Experiment>>,
}

impl ExperimentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist `experiment`, assigning its id. Returns the stored copy.
    pub fn insert(&self, mut experiment: Experiment) -> Experiment {
        let mut records = self.records.write();
        experiment.id = records.last().map_or(0, |e| e.id) + 1;
        records.push(experiment.clone());
        experiment
    }

    /// Experiment by id.
    pub fn get(&self, id: i64) -> Option<Experiment> {
        self.records.read().iter().find(|e| e.id == id).cloned()
    }

    /// Every experiment, oldest first.
    pub fn list(&self) -> Vec<Experiment> {
        self.records.read().clone()
    }

    /// Replace the log with `experiments`.
    pub fn restore(&self, mut experiments: Vec<Experiment>) {
        experiments.sort_by_key(|e| e.id);
        *self.records.write() = experiments;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_builtin_activates_one_per_type() {
        let store = PromptStore::with_builtin();
        for ct in ContentType::ALL {
            let versions = store.list(ct);
            assert_eq!(versions.len(), 1);
            assert!(versions[0].is_active);
        }
        // Seeding again adds nothing.
        store.seed_builtin();
        assert_eq!(store.list(ContentType::Comment).len(), 1);
    }

    #[test]
    fn test_create_is_inactive_with_increasing_ids() {
        let store = PromptStore::new();
        let a = store.create(ContentType::Comment, "a");
        let b = store.create(ContentType::Comment, "b");
        assert!(!a.is_active && !b.is_active);
        assert!(b.id > a.id);
        assert!(store.active(ContentType::Comment).is_none());
    }

    #[test]
    fn test_activate_switches_within_type_only() {
        let store = PromptStore::with_builtin();
        let danmaku_before = store.active(ContentType::Danmaku).expect("test: seeded");
        let b = store.create(ContentType::Comment, "new comment prompt");

        store.activate(b.id).expect("test: activate");

        let comments = store.list(ContentType::Comment);
        assert_eq!(comments.iter().filter(|v| v.is_active).count(), 1);
        assert_eq!(store.active(ContentType::Comment).map(|v| v.id), Some(b.id));
        assert_eq!(store.active(ContentType::Danmaku), Some(danmaku_before));
    }

    #[test]
    fn test_restore_keeps_active_flags_and_continues_ids() {
        let original = PromptStore::with_builtin();
        let draft = original.create(ContentType::Comment, "draft");
        original.activate(draft.id).expect("test: activate");

        let restored = PromptStore::new();
        restored.restore(original.snapshot());
        assert_eq!(restored.active(ContentType::Comment).map(|v| v.id), Some(draft.id));

        let next = restored.create(ContentType::Danmaku, "later");
        assert_eq!(next.id, draft.id + 1);
    }

    #[test]
    fn test_activate_unknown_id_fails() {
        let store = PromptStore::new();
        assert!(matches!(
            store.activate(99),
            Err(ModerationError::PromptNotFound(99))
        ));
    }
}
