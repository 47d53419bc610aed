use crate::types::{Priority, QueueItem, QueueState, QueueStatistics};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use switchyard_core::Request;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue and scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retries allowed per item through `retry_failed`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Orchestrations the scheduler runs at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Upper bound on how long the scheduler sleeps on an empty queue.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// How long finished items and their results are kept before purging.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Period of the purge pass while the scheduler runs.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    4
}

fn default_idle_poll_ms() -> u64 {
    250
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_purge_interval_secs() -> u64 {
    60
}

impl QueueConfig {
    /// Retention window for finished items.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_concurrent: default_max_concurrent(),
            idle_poll_ms: default_idle_poll_ms(),
            retention_secs: default_retention_secs(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

#[derive(Default)]
struct Counters {
    total_enqueued: u64,
    processed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
    wait_ms_total: f64,
    wait_samples: u64,
    processing_ms_total: f64,
    processing_samples: u64,
}

#[derive(Default)]
struct Inner {
    /// FIFO of item ids per priority, indexed by `Priority::index`.
    buckets: [VecDeque<Uuid>; 4],
    items: HashMap<Uuid, QueueItem>,
    next_sequence: u64,
    counters: Counters,
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(0).max(0) as f64 / 1000.0
}

/// Thread-safe priority queue with per-item lifecycle tracking.
///
/// Four FIFO buckets are consulted Critical to Low. Every operation takes
/// one short lock, so dequeue, cancel and retry are linearizable. Ids of
/// cancelled items stay in their bucket and are skipped on dequeue.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_retries: u32,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            max_retries: config.max_retries,
        }
    }

    /// Enqueue a request. The workflow id is taken from the request context.
    pub fn enqueue(&self, request: Request, priority: Priority) -> Uuid {
        let workflow_id = request.workflow_id().map(str::to_string);
        self.push(QueueItem::new(request, priority, workflow_id))
    }

    /// Enqueue a request under an explicit workflow id.
    pub fn enqueue_in_workflow(
        &self,
        request: Request,
        priority: Priority,
        workflow_id: impl Into<String>,
    ) -> Uuid {
        self.push(QueueItem::new(request, priority, Some(workflow_id.into())))
    }

    fn push(&self, mut item: QueueItem) -> Uuid {
        let id = item.id;
        let priority = item.priority;
        {
            let mut inner = self.inner.lock();
            item.sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.buckets[priority.index()].push_back(id);
            inner.items.insert(id, item);
            inner.counters.total_enqueued += 1;
        }
        debug!(item = %id, priority = %priority, "Item enqueued");
        self.notify.notify_one();
        id
    }

    /// Take the oldest pending item of the highest non-empty priority and
    /// mark it in progress.
    pub fn dequeue(&self) -> Option<QueueItem> {
        let mut inner = self.inner.lock();
        let Inner {
            buckets,
            items,
            counters,
            ..
        } = &mut *inner;

        for priority in Priority::DESCENDING {
            let bucket = &mut buckets[priority.index()];
            while let Some(id) = bucket.pop_front() {
                let Some(item) = items.get_mut(&id) else {
                    continue;
                };
                if item.state != QueueState::Pending {
                    continue;
                }
                let now = Utc::now();
                item.state = QueueState::InProgress;
                item.started_at = Some(now);
                // Retried items measure wait from their original enqueue time.
                counters.wait_ms_total += millis_between(item.enqueued_at, now);
                counters.wait_samples += 1;
                return Some(item.clone());
            }
        }
        None
    }

    /// Wait until an item may be available, or until `timeout` elapses.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Current state of an item, `None` if unknown or purged.
    pub fn status(&self, id: Uuid) -> Option<QueueState> {
        self.inner.lock().items.get(&id).map(|i| i.state.clone())
    }

    /// Snapshot of an item, `None` if unknown or purged.
    pub fn item(&self, id: Uuid) -> Option<QueueItem> {
        self.inner.lock().items.get(&id).cloned()
    }

    /// Items of one workflow, in enqueue order.
    pub fn items_for_workflow(&self, workflow_id: &str) -> Vec<QueueItem> {
        let inner = self.inner.lock();
        let mut items: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|i| i.workflow_id.as_deref() == Some(workflow_id))
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sequence);
        items
    }

    /// Cancel a pending item. Returns false, leaving the state unchanged,
    /// once the item is in progress or terminal.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        let Some(item) = inner.items.get_mut(&id) else {
            return false;
        };
        if item.state != QueueState::Pending {
            return false;
        }
        item.state = QueueState::Cancelled;
        item.finished_at = Some(Utc::now());
        inner.counters.cancelled += 1;
        info!(item = %id, "Item cancelled");
        true
    }

    /// Record an in-progress item as completed. False if it was not in
    /// progress.
    pub fn mark_completed(&self, id: Uuid) -> bool {
        self.finish(id, QueueState::Completed, false)
    }

    /// Record an in-progress item as failed. It stays eligible for
    /// `retry_failed`.
    pub fn mark_failed(&self, id: Uuid, reason: impl Into<String>) -> bool {
        self.finish(
            id,
            QueueState::Failed {
                reason: reason.into(),
            },
            false,
        )
    }

    /// Record an in-progress item whose request was rejected. It is failed
    /// with its retries exhausted, since resubmitting cannot change the
    /// outcome.
    pub fn mark_rejected(&self, id: Uuid, reason: impl Into<String>) -> bool {
        self.finish(
            id,
            QueueState::Failed {
                reason: reason.into(),
            },
            true,
        )
    }

    /// Record an in-progress item that observed cancellation.
    pub fn mark_cancelled(&self, id: Uuid) -> bool {
        self.finish(id, QueueState::Cancelled, false)
    }

    fn finish(&self, id: Uuid, state: QueueState, exhausted: bool) -> bool {
        let mut inner = self.inner.lock();
        let Inner {
            items, counters, ..
        } = &mut *inner;
        let Some(item) = items.get_mut(&id) else {
            return false;
        };
        if item.state != QueueState::InProgress {
            warn!(item = %id, state = ?item.state, "Ignoring completion of an item not in progress");
            return false;
        }
        let now = Utc::now();
        if let Some(started) = item.started_at {
            counters.processing_ms_total += millis_between(started, now);
            counters.processing_samples += 1;
        }
        match &state {
            QueueState::Completed => counters.processed += 1,
            QueueState::Failed { .. } => {
                counters.failed += 1;
                item.failure_count += 1;
            }
            QueueState::Cancelled => counters.cancelled += 1,
            _ => {}
        }
        item.state = state;
        item.finished_at = Some(now);
        item.retries_exhausted |= exhausted;
        true
    }

    /// Drop terminal items that finished more than `older_than` ago.
    /// Counters are unaffected. Returns the purged ids.
    pub fn purge_terminal(&self, older_than: Duration) -> Vec<Uuid> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };
        let mut inner = self.inner.lock();
        let Inner { buckets, items, .. } = &mut *inner;

        let purged: Vec<Uuid> = items
            .values()
            .filter(|i| i.state.is_terminal() && i.finished_at.is_some_and(|t| t <= cutoff))
            .map(|i| i.id)
            .collect();
        for id in &purged {
            items.remove(id);
        }
        for bucket in buckets.iter_mut() {
            bucket.retain(|id| items.contains_key(id));
        }
        if !purged.is_empty() {
            debug!(count = purged.len(), "Purged finished queue items");
        }
        purged
    }

    /// Re-enqueue every failed item of a workflow at its original priority.
    /// Items already retried `max_retries` times stay failed and are marked
    /// exhausted. Returns the ids that were re-enqueued.
    pub fn retry_failed_items(&self, workflow_id: &str) -> Vec<Uuid> {
        let mut requeued = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Inner {
                buckets,
                items,
                counters,
                ..
            } = &mut *inner;

            let mut failed: Vec<&mut QueueItem> = items
                .values_mut()
                .filter(|i| {
                    i.workflow_id.as_deref() == Some(workflow_id)
                        && matches!(i.state, QueueState::Failed { .. })
                        && !i.retries_exhausted
                })
                .collect();
            failed.sort_by_key(|i| i.sequence);

            for item in failed {
                if item.retry_count >= self.max_retries {
                    item.retries_exhausted = true;
                    warn!(item = %item.id, retries = item.retry_count, "Retry limit reached, item stays failed");
                    continue;
                }
                item.retry_count += 1;
                item.state = QueueState::Pending;
                item.started_at = None;
                item.finished_at = None;
                buckets[item.priority.index()].push_back(item.id);
                counters.retried += 1;
                requeued.push(item.id);
            }
        }
        if !requeued.is_empty() {
            info!(workflow_id, count = requeued.len(), "Failed items re-enqueued");
            for _ in &requeued {
                self.notify.notify_one();
            }
        }
        requeued
    }

    /// Retry a workflow's failed items. True if at least one was re-enqueued.
    pub fn retry_failed(&self, workflow_id: &str) -> bool {
        !self.retry_failed_items(workflow_id).is_empty()
    }

    /// Counters since creation plus current pending and in-progress counts.
    pub fn statistics(&self) -> QueueStatistics {
        let inner = self.inner.lock();
        let c = &inner.counters;
        let mut stats = QueueStatistics {
            total_enqueued: c.total_enqueued,
            processed: c.processed,
            failed: c.failed,
            cancelled: c.cancelled,
            retried: c.retried,
            average_wait_ms: if c.wait_samples == 0 {
                0.0
            } else {
                c.wait_ms_total / c.wait_samples as f64
            },
            average_processing_ms: if c.processing_samples == 0 {
                0.0
            } else {
                c.processing_ms_total / c.processing_samples as f64
            },
            ..QueueStatistics::default()
        };
        for priority in Priority::DESCENDING {
            stats.pending_by_priority.insert(priority, 0);
        }
        for item in inner.items.values() {
            match item.state {
                QueueState::Pending => {
                    stats.pending += 1;
                    *stats.pending_by_priority.entry(item.priority).or_default() += 1;
                }
                QueueState::InProgress => stats.in_progress += 1,
                _ => {}
            }
        }
        stats
    }

    /// Items waiting to be dequeued.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .items
            .values()
            .filter(|i| i.state == QueueState::Pending)
            .count()
    }

    /// Items still tracked, purged ones excluded.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when no item is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}
