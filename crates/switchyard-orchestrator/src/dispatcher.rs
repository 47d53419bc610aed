use crate::engine::{validate, Orchestrator};
use crate::events::{EventBus, SwitchyardEvent};
use crate::scheduler::{QueueScheduler, ResultStore};
use crate::task_queue::{QueueConfig, TaskQueue};
use crate::types::{OrchestratorResult, Priority, QueueItem, QueueState, QueueStatistics};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchyard_core::{Request, SwitchyardResult, WORKFLOW_ID_CONTEXT_KEY};
use switchyard_recovery::{Diagnosis, FailureInfo, FailureReport, RecoveryStrategy};
use tracing::{info, warn};
use uuid::Uuid;

/// Returned by [`Dispatcher::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Queue item created for the request.
    pub item_id: Uuid,
    /// Workflow the item was filed under; generated when the request named none.
    pub workflow_id: String,
}

/// Aggregate state of the items submitted under one workflow id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Nothing has started yet.
    Pending,
    /// Some items are in progress or still pending behind finished ones.
    Running,
    /// Every item completed, possibly with some cancelled.
    Completed,
    /// At least one item failed and none remain pending.
    Failed,
    /// Every item was cancelled.
    Cancelled,
}

/// Snapshot of one queue item within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStatus {
    /// Queue item id.
    pub item_id: Uuid,
    /// Priority it was submitted with.
    pub priority: Priority,
    /// Current queue state.
    pub state: QueueState,
    /// Times the item was re-enqueued.
    pub retry_count: u32,
    /// Submission time.
    pub enqueued_at: DateTime<Utc>,
    /// Time it reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-state counts and item list for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Workflow id.
    pub workflow_id: String,
    /// Aggregate state.
    pub state: WorkflowState,
    /// Items waiting to run.
    pub pending: usize,
    /// Items being processed.
    pub in_progress: usize,
    /// Items that completed.
    pub completed: usize,
    /// Items that failed.
    pub failed: usize,
    /// Items cancelled before running.
    pub cancelled: usize,
    /// Items in submission order.
    pub items: Vec<ItemStatus>,
}

impl WorkflowStatus {
    fn from_items(workflow_id: &str, items: &[QueueItem]) -> Self {
        let mut status = Self {
            workflow_id: workflow_id.to_string(),
            state: WorkflowState::Pending,
            pending: 0,
            in_progress: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            items: Vec::with_capacity(items.len()),
        };
        for item in items {
            match item.state {
                QueueState::Pending => status.pending += 1,
                QueueState::InProgress => status.in_progress += 1,
                QueueState::Completed => status.completed += 1,
                QueueState::Failed { .. } => status.failed += 1,
                QueueState::Cancelled => status.cancelled += 1,
            }
            status.items.push(ItemStatus {
                item_id: item.id,
                priority: item.priority,
                state: item.state.clone(),
                retry_count: item.retry_count,
                enqueued_at: item.enqueued_at,
                finished_at: item.finished_at,
            });
        }
        let finished = status.completed + status.failed + status.cancelled;
        status.state = if status.in_progress > 0 || (status.pending > 0 && finished > 0) {
            WorkflowState::Running
        } else if status.pending > 0 {
            WorkflowState::Pending
        } else if status.failed > 0 {
            WorkflowState::Failed
        } else if status.completed > 0 {
            WorkflowState::Completed
        } else {
            WorkflowState::Cancelled
        };
        status
    }

    /// Number of items in the workflow.
    pub fn total(&self) -> usize {
        self.items.len()
    }
}

/// Task lifecycle façade: submit, status, cancel and retry keyed by
/// workflow id, backed by the task queue, a scheduler and the orchestrator.
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<TaskQueue>,
    scheduler: QueueScheduler,
    results: ResultStore,
}

impl Dispatcher {
    /// Dispatcher over `orchestrator` with a fresh queue. Call `start` before submitting.
    pub fn new(orchestrator: Arc<Orchestrator>, config: &QueueConfig) -> Self {
        let queue = Arc::new(TaskQueue::new(config));
        let results: ResultStore = Arc::new(DashMap::new());
        let scheduler =
            QueueScheduler::new(queue.clone(), orchestrator.clone(), results.clone(), config);
        Self {
            orchestrator,
            queue,
            scheduler,
            results,
        }
    }

    /// Orchestrator processing dequeued items.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Underlying task queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Event bus of the orchestrator.
    pub fn events(&self) -> &Arc<EventBus> {
        self.orchestrator.events()
    }

    /// Whether the scheduler is running.
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Initialize the orchestrator, restore the failure snapshot if one is
    /// configured and present, and start scheduling. Idempotent.
    pub async fn start(&self) -> SwitchyardResult<()> {
        if self.scheduler.is_running() {
            return Ok(());
        }
        self.orchestrator.initialize().await?;

        let tracker = self.orchestrator.tracker();
        if let Some(path) = &tracker.config().snapshot_path {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                if let Err(e) = tracker.load_snapshot(path).await {
                    warn!(path = %path.display(), error = %e, "Failed to load failure snapshot");
                }
            }
        }

        self.scheduler.start();
        info!("Dispatcher started");
        Ok(())
    }

    /// Drain in-flight work, shut the orchestrator down and write the
    /// failure snapshot if configured. Pending items are left unprocessed.
    pub async fn shutdown(&self) -> SwitchyardResult<()> {
        self.scheduler.stop().await;
        self.finish_shutdown().await
    }

    /// Like [`Dispatcher::shutdown`], but cancels in-flight work first.
    pub async fn shutdown_now(&self) -> SwitchyardResult<()> {
        self.scheduler.stop_now().await;
        self.finish_shutdown().await
    }

    async fn finish_shutdown(&self) -> SwitchyardResult<()> {
        self.orchestrator.shutdown().await?;
        let tracker = self.orchestrator.tracker();
        if let Some(path) = &tracker.config().snapshot_path {
            if let Err(e) = tracker.save_snapshot(path).await {
                warn!(path = %path.display(), error = %e, "Failed to save failure snapshot");
            }
        }
        info!(pending = self.queue.pending_count(), "Dispatcher shut down");
        Ok(())
    }

    /// Validate and enqueue a request. A workflow id is generated when the
    /// request does not carry one.
    pub fn submit(&self, request: Request, priority: Priority) -> SwitchyardResult<SubmitReceipt> {
        validate(&request)?;
        let (request, workflow_id) = match request.workflow_id().map(str::to_string) {
            Some(id) => (request, id),
            None => {
                let id = Uuid::new_v4().to_string();
                (
                    request.with_context(WORKFLOW_ID_CONTEXT_KEY, serde_json::json!(id)),
                    id,
                )
            }
        };
        let request_id = request.id;
        let item_id = self
            .queue
            .enqueue_in_workflow(request, priority, workflow_id.clone());
        info!(
            item = %item_id,
            request_id = %request_id,
            workflow_id = %workflow_id,
            priority = %priority,
            "Request submitted"
        );
        self.publish(item_id, Some(workflow_id.clone()), QueueState::Pending);
        Ok(SubmitReceipt {
            item_id,
            workflow_id,
        })
    }

    /// Submit under an explicit workflow id.
    pub fn submit_to_workflow(
        &self,
        workflow_id: impl Into<String>,
        request: Request,
        priority: Priority,
    ) -> SwitchyardResult<SubmitReceipt> {
        let request =
            request.with_context(WORKFLOW_ID_CONTEXT_KEY, serde_json::json!(workflow_id.into()));
        self.submit(request, priority)
    }

    /// Queue state of an item, `None` if unknown or purged.
    pub fn request_status(&self, item_id: Uuid) -> Option<QueueState> {
        self.queue.status(item_id)
    }

    /// Full queue item, `None` if unknown or purged.
    pub fn item(&self, item_id: Uuid) -> Option<QueueItem> {
        self.queue.item(item_id)
    }

    /// Aggregate status of a workflow, or `None` if nothing was submitted
    /// under that id.
    pub fn status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        let items = self.queue.items_for_workflow(workflow_id);
        (!items.is_empty()).then(|| WorkflowStatus::from_items(workflow_id, &items))
    }

    /// Cancel a pending item.
    pub fn cancel(&self, item_id: Uuid) -> bool {
        if !self.queue.cancel(item_id) {
            return false;
        }
        let workflow_id = self.queue.item(item_id).and_then(|i| i.workflow_id);
        self.publish(item_id, workflow_id, QueueState::Cancelled);
        true
    }

    /// Cancel every pending item of a workflow. Returns how many were cancelled.
    pub fn cancel_workflow(&self, workflow_id: &str) -> usize {
        self.queue
            .items_for_workflow(workflow_id)
            .into_iter()
            .filter(|i| i.state == QueueState::Pending)
            .filter(|i| self.cancel(i.id))
            .count()
    }

    /// Re-enqueue a workflow's failed items. Returns the ids re-enqueued.
    pub fn retry_failed(&self, workflow_id: &str) -> Vec<Uuid> {
        let requeued = self.queue.retry_failed_items(workflow_id);
        for id in &requeued {
            self.results.remove(id);
            self.publish(*id, Some(workflow_id.to_string()), QueueState::Pending);
        }
        requeued
    }

    /// Queue counters and current depths.
    pub fn statistics(&self) -> QueueStatistics {
        self.queue.statistics()
    }

    /// Forget finished items and their results older than `older_than`.
    /// The scheduler also does this periodically using the configured
    /// retention window.
    pub fn purge_finished(&self, older_than: std::time::Duration) -> usize {
        self.scheduler.purge_finished(older_than)
    }

    /// Result of a finished item.
    pub fn result(&self, item_id: Uuid) -> Option<OrchestratorResult> {
        self.results.get(&item_id).map(|r| r.value().clone())
    }

    /// Failure report for the tracker window between `from` and `to`.
    pub fn failure_report(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> FailureReport {
        self.orchestrator.tracker().failure_report(from, to)
    }

    /// Ranked recovery strategies for a failure.
    pub fn recovery_suggestions(&self, info: &FailureInfo) -> Vec<RecoveryStrategy> {
        self.orchestrator.tracker().suggest_recovery(info)
    }

    /// Root-cause diagnosis of a failure.
    pub fn diagnose(&self, info: &FailureInfo) -> Diagnosis {
        self.orchestrator.tracker().diagnose(info)
    }

    fn publish(&self, item_id: Uuid, workflow_id: Option<String>, state: QueueState) {
        self.events().publish(&SwitchyardEvent::StatusChanged {
            item_id,
            workflow_id,
            state,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchyard_core::HandlerRegistry;
    use switchyard_core::StaticConfigProvider;
    use switchyard_recovery::FailureTracker;
    use switchyard_routing::RoutingEngine;

    fn dispatcher() -> Dispatcher {
        let orchestrator = Orchestrator::new(
            Arc::new(HandlerRegistry::new()),
            Arc::new(StaticConfigProvider::default()),
            RoutingEngine::with_default_rules(),
            Arc::new(FailureTracker::default()),
        );
        Dispatcher::new(Arc::new(orchestrator), &QueueConfig::default())
    }

    #[test]
    fn test_submit_assigns_workflow_id() {
        let d = dispatcher();
        let receipt = d.submit(Request::new("explain"), Priority::Normal).unwrap();
        assert!(!receipt.workflow_id.is_empty());
        let item = d.item(receipt.item_id).unwrap();
        assert_eq!(item.workflow_id.as_deref(), Some(receipt.workflow_id.as_str()));
        assert_eq!(item.request.workflow_id(), Some(receipt.workflow_id.as_str()));

        let again = d
            .submit_to_workflow("wf-1", Request::new("explain"), Priority::Low)
            .unwrap();
        assert_eq!(again.workflow_id, "wf-1");
    }

    #[test]
    fn test_submit_rejects_empty() {
        let d = dispatcher();
        assert!(d.submit(Request::new(""), Priority::Normal).is_err());
        assert_eq!(d.statistics().total_enqueued, 0);
    }

    #[test]
    fn test_workflow_status_aggregation() {
        let d = dispatcher();
        let a = d.submit_to_workflow("wf", Request::new("a"), Priority::Normal).unwrap();
        d.submit_to_workflow("wf", Request::new("b"), Priority::Normal).unwrap();
        assert_eq!(d.status("wf").unwrap().state, WorkflowState::Pending);

        assert!(d.cancel(a.item_id));
        let status = d.status("wf").unwrap();
        assert_eq!(status.state, WorkflowState::Running);
        assert_eq!(status.cancelled, 1);
        assert_eq!(status.total(), 2);

        assert_eq!(d.cancel_workflow("wf"), 1);
        assert_eq!(d.status("wf").unwrap().state, WorkflowState::Cancelled);
        assert!(d.status("missing").is_none());
    }
}
