//! # Stage: Batch Queue
//!
//! ## Responsibility
//! Accept `(content_type, item_id, priority)` references, group what
//! arrives within a short window, and run each group of identical
//! (normalized) texts through the orchestrator once.
//!
//! ## Guarantees
//! - An item already pending cannot be enqueued again until its batch ends
//! - Enqueue never blocks: a full queue sheds the item (`Shed`) and
//!   increments `moderation_requests_shed_total{stage="enqueue"}`
//! - Higher priority drains first; FIFO within a priority
//! - Every item of a group receives the same result
//! - Shutdown drains the items already queued before workers exit
//!
//! ## NOT Responsible For
//! - Persisting results (delegated to [`ContentStore`])
//! - Retrying failed writes

pub mod priority;

pub use priority::PriorityQueue;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::metrics;
use crate::normalize::normalize;
use crate::orchestrator::{AnalyzeRequest, DecisionOrchestrator};
use crate::types::{AnalysisResult, ContentType, Priority};
use crate::ModerationError;

/// Storage layer the queue reads content from and writes verdicts to.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Text of an item, `None` if it no longer exists.
    async fn get_content(
        &self,
        content_type: ContentType,
        item_id: &str,
    ) -> Result<Option<String>, ModerationError>;

    /// Persist the verdict for an item.
    async fn apply_result(
        &self,
        content_type: ContentType,
        item_id: &str,
        result: &AnalysisResult,
    ) -> Result<(), ModerationError>;
}

/// In-memory [`ContentStore`].
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    contents: DashMap<(ContentType, String), String>,
    results: DashMap<(ContentType, String), AnalysisResult>,
}

impl MemoryContentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an item's text.
    pub fn insert(&self, content_type: ContentType, item_id: impl Into<String>, text: impl Into<String>) {
        self.contents.insert((content_type, item_id.into()), text.into());
    }

    /// Stored verdict for an item.
    pub fn result(&self, content_type: ContentType, item_id: &str) -> Option<AnalysisResult> {
        self.results
            .get(&(content_type, item_id.to_string()))
            .map(|r| r.value().clone())
    }

    /// Every stored verdict.
    pub fn results(&self) -> Vec<(ContentType, String, AnalysisResult)> {
        self.results
            .iter()
            .map(|e| (e.key().0, e.key().1.clone(), e.value().clone()))
            .collect()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get_content(
        &self,
        content_type: ContentType,
        item_id: &str,
    ) -> Result<Option<String>, ModerationError> {
        Ok(self
            .contents
            .get(&(content_type, item_id.to_string()))
            .map(|t| t.value().clone()))
    }

    async fn apply_result(
        &self,
        content_type: ContentType,
        item_id: &str,
        result: &AnalysisResult,
    ) -> Result<(), ModerationError> {
        self.results
            .insert((content_type, item_id.to_string()), result.clone());
        Ok(())
    }
}

/// A queued reference to stored content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Kind of content.
    pub content_type: ContentType,
    /// Storage-layer id.
    pub item_id: String,
    /// Drain priority.
    pub priority: Priority,
    /// Budget subject.
    pub subject_id: Option<String>,
}

/// Result of [`BatchQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted.
    Queued,
    /// Already pending.
    Duplicate,
    /// Queue full; dropped.
    Shed,
    /// Queue is shutting down.
    Closed,
}

const QUEUE_LABEL: &str = "batch";

/// Deduplicating, prioritized batch queue.
pub struct BatchQueue {
    heap: PriorityQueue<QueueItem>,
    pending: DashMap<(ContentType, String), ()>,
    notify: Notify,
    closed: AtomicBool,
    config: QueueConfig,
}

impl BatchQueue {
    /// Queue sized by `config.capacity`.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            heap: PriorityQueue::with_capacity(config.capacity.max(1)),
            pending: DashMap::new(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Queue settings.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue an item without a budget subject.
    pub async fn enqueue(
        &self,
        content_type: ContentType,
        item_id: impl Into<String>,
        priority: Priority,
    ) -> EnqueueOutcome {
        self.enqueue_with_subject(content_type, item_id, priority, None)
            .await
    }

    /// Enqueue an item whose cloud calls are metered against `subject_id`.
    pub async fn enqueue_with_subject(
        &self,
        content_type: ContentType,
        item_id: impl Into<String>,
        priority: Priority,
        subject_id: Option<String>,
    ) -> EnqueueOutcome {
        if self.closed.load(Ordering::Acquire) {
            return EnqueueOutcome::Closed;
        }

        let item_id = item_id.into();
        let key = (content_type, item_id.clone());
        match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(content_type = %content_type, item_id = %item_id, "already pending");
                return EnqueueOutcome::Duplicate;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let item = QueueItem {
            content_type,
            item_id,
            priority,
            subject_id,
        };
        let depth = match self.heap.push(priority, item) {
            Ok(depth) => depth,
            Err(_) => {
                self.pending.remove(&key);
                metrics::inc_shed("enqueue");
                warn!(
                    content_type = %content_type,
                    capacity = self.config.capacity,
                    "queue full, item shed"
                );
                return EnqueueOutcome::Shed;
            }
        };

        metrics::set_queue_depth(QUEUE_LABEL, depth as i64);
        self.notify.notify_one();
        EnqueueOutcome::Queued
    }

    /// Items waiting in the heap.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Items enqueued and not yet finished.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Refuse further enqueues and wake idle workers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Block for one item, then gather more until the batch window elapses
    /// or the batch is full. `None` once closed (or signalled) and empty.
    pub async fn next_batch(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Vec<QueueItem>> {
        let first = loop {
            let notified = self.notify.notified();
            if let Some(item) = self.heap.pop() {
                break item;
            }
            if self.is_closed() || *shutdown.borrow() {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        };

        let max_batch = self.config.max_batch.max(1);
        let deadline = Instant::now() + Duration::from_millis(self.config.batch_window_ms);
        let mut batch = vec![first];
        while batch.len() < max_batch {
            let notified = self.notify.notified();
            let more = self.heap.pop_many(max_batch - batch.len());
            if !more.is_empty() {
                batch.extend(more);
                continue;
            }
            if self.is_closed() || tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        metrics::set_queue_depth(QUEUE_LABEL, self.heap.len() as i64);
        Some(batch)
    }

    fn release(&self, item: &QueueItem) {
        self.pending
            .remove(&(item.content_type, item.item_id.clone()));
    }

    /// Score a batch: one orchestrator call per group of identical
    /// normalized texts, result fanned out to every member.
    ///
    /// Returns the number of orchestrator calls made.
    pub async fn process_batch(
        &self,
        batch: Vec<QueueItem>,
        orchestrator: &DecisionOrchestrator,
        store: &dyn ContentStore,
    ) -> usize {
        let mut order: Vec<(ContentType, String)> = Vec::new();
        let mut groups: HashMap<(ContentType, String), (String, Vec<QueueItem>)> = HashMap::new();

        for item in batch {
            match store.get_content(item.content_type, &item.item_id).await {
                Ok(Some(text)) => {
                    let key = (item.content_type, normalize(&text));
                    let group = groups.entry(key.clone()).or_insert_with(|| {
                        order.push(key);
                        (text, Vec::new())
                    });
                    group.1.push(item);
                }
                Ok(None) => {
                    warn!(item_id = %item.item_id, "queued item has no content, skipping");
                    self.release(&item);
                }
                Err(e) => {
                    warn!(item_id = %item.item_id, error = %e, "failed to load queued item");
                    self.release(&item);
                }
            }
        }

        let calls = order.len();
        let work = order.into_iter().filter_map(|key| groups.remove(&key)).map(
            |(text, members)| async move {
                let Some(lead) = members.first() else {
                    return;
                };
                let priority = members
                    .iter()
                    .map(|m| m.priority)
                    .max()
                    .unwrap_or_default();
                let mut request = AnalyzeRequest::new(text, lead.content_type).with_priority(priority);
                if let Some(subject) = members.iter().find_map(|m| m.subject_id.clone()) {
                    request = request.with_subject(subject);
                }
                let result = orchestrator.analyze(request).await;

                for member in &members {
                    if let Err(e) = store
                        .apply_result(member.content_type, &member.item_id, &result)
                        .await
                    {
                        warn!(item_id = %member.item_id, error = %e, "failed to store verdict");
                    }
                    self.release(member);
                }
                if members.len() > 1 {
                    debug!(group_size = members.len(), "duplicate items shared one verdict");
                }
            },
        );
        join_all(work).await;
        calls
    }
}

/// Owns the worker tasks draining a [`BatchQueue`].
pub struct QueueSupervisor {
    queue: Arc<BatchQueue>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl QueueSupervisor {
    /// Spawn `queue.config().workers` workers.
    pub fn spawn(
        queue: Arc<BatchQueue>,
        orchestrator: Arc<DecisionOrchestrator>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let workers = queue.config().workers.max(1);
        let handles = (0..workers)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let orchestrator = Arc::clone(&orchestrator);
                let store = Arc::clone(&store);
                let mut rx = rx.clone();
                tokio::spawn(async move {
                    debug!(worker_id = worker_id, "batch worker started");
                    while let Some(batch) = queue.next_batch(&mut rx).await {
                        let size = batch.len();
                        let calls = queue
                            .process_batch(batch, &orchestrator, store.as_ref())
                            .await;
                        debug!(worker_id = worker_id, items = size, calls = calls, "batch done");
                    }
                    debug!(worker_id = worker_id, "batch worker stopped");
                })
            })
            .collect();
        info!(workers = workers, "queue supervisor started");
        Self {
            queue,
            shutdown,
            handles,
        }
    }

    /// The supervised queue.
    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.queue
    }

    /// Close the queue, let workers drain what is already queued, and join
    /// them.
    pub async fn shutdown(self) {
        self.queue.close();
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "batch worker panicked");
            }
        }
        info!("queue supervisor stopped");
    }
}
