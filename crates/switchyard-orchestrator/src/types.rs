use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use switchyard_core::{ErrorKind, HandlerResult, Request, SwitchyardError};
use switchyard_routing::RoutingDecision;
use uuid::Uuid;

/// Queue priority. Higher always dequeues first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Ahead of normal traffic.
    High,
    /// Always dequeued first.
    Critical,
}

impl Priority {
    /// Highest first.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(SwitchyardError::Validation(format!("Unknown priority '{other}'"))),
        }
    }
}

/// Lifecycle state of a queued item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Waiting to be dequeued.
    Pending,
    /// Dequeued and being processed.
    InProgress,
    /// Processed successfully.
    Completed,
    /// Processing failed or the request was rejected.
    Failed { reason: String },
    /// Cancelled before it ran.
    Cancelled,
}

impl QueueState {
    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueState::Completed | QueueState::Failed { .. } | QueueState::Cancelled
        )
    }
}

/// A request held by the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Item id, also the request id used for results.
    pub id: Uuid,
    /// Enqueue order assigned by the queue.
    pub sequence: u64,
    /// Request to process.
    pub request: Request,
    /// Dequeue priority.
    pub priority: Priority,
    /// Workflow the item belongs to.
    pub workflow_id: Option<String>,
    /// Current lifecycle state.
    pub state: QueueState,
    /// Enqueue time.
    pub enqueued_at: DateTime<Utc>,
    /// Most recent dequeue time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time of the last terminal transition.
    pub finished_at: Option<DateTime<Utc>>,
    /// Times the item was re-enqueued after failing.
    pub retry_count: u32,
    /// Times processing failed.
    pub failure_count: u32,
    /// Set once a retry was refused because `retry_count` reached the limit.
    pub retries_exhausted: bool,
}

impl QueueItem {
    /// Pending item with a fresh id.
    pub fn new(request: Request, priority: Priority, workflow_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            request,
            priority,
            workflow_id,
            state: QueueState::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            retry_count: 0,
            failure_count: 0,
            retries_exhausted: false,
        }
    }
}

/// Queue-wide counters and timings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    /// Items ever enqueued.
    pub total_enqueued: u64,
    /// Items that reached Completed.
    pub processed: u64,
    /// Failed transitions, including items later retried.
    pub failed: u64,
    /// Items cancelled before running.
    pub cancelled: u64,
    /// Failed items re-enqueued.
    pub retried: u64,
    /// Items currently pending.
    pub pending: usize,
    /// Items currently in progress.
    pub in_progress: usize,
    /// Pending items per priority.
    pub pending_by_priority: BTreeMap<Priority, usize>,
    /// Mean enqueue to dequeue time.
    pub average_wait_ms: f64,
    /// Mean dequeue to terminal time.
    pub average_processing_ms: f64,
}

/// Outcome of one workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepResult {
    /// Step name.
    pub step: String,
    /// Whether the step succeeded.
    pub success: bool,
    /// Handler result the step produced.
    pub result: HandlerResult,
    /// Step-specific details.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Aggregate outcome of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Workflow id from the request context, or the request id.
    pub workflow_id: String,
    /// Every step attempted, in execution order.
    pub steps: Vec<WorkflowStepResult>,
    /// True iff every executed step succeeded.
    pub success: bool,
    /// True if cancellation stopped the run.
    pub cancelled: bool,
    /// Step that failed and aborted the run.
    pub failed_step: Option<String>,
    /// Last step's result, or the failing step's result on abort.
    pub final_result: Option<HandlerResult>,
    /// Shared context as left by the last step.
    pub context: HashMap<String, serde_json::Value>,
}

/// Terminal classification of an orchestrated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Handler reported success.
    Succeeded,
    /// Routing, the handler or a workflow step failed.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Rejected by validation before any work ran.
    Rejected,
}

/// Structured result of [`crate::Orchestrator::process`]. Errors never escape
/// the orchestrator as raw faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    /// Id of the processed request.
    pub request_id: Uuid,
    /// Terminal classification.
    pub outcome: Outcome,
    /// Same as `outcome == Succeeded`.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Handler output, if any.
    pub content: Option<String>,
    /// Handler that produced the result.
    pub handler_name: Option<String>,
    /// Error category on failure.
    pub error_kind: Option<ErrorKind>,
    /// Error text on failure.
    pub error: Option<String>,
    /// Routing decision, when routing ran.
    pub routing: Option<RoutingDecision>,
    /// Per-step results for workflow requests.
    pub workflow: Option<WorkflowResult>,
    /// Handler attempts made, including retries.
    pub attempts: u32,
    /// Wall-clock time spent processing.
    pub duration_ms: u64,
    /// Handler metadata plus orchestration details.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OrchestratorResult {
    /// Result mirroring a handler result.
    pub fn from_handler(request_id: Uuid, result: HandlerResult) -> Self {
        Self {
            request_id,
            outcome: if result.success {
                Outcome::Succeeded
            } else {
                Outcome::Failed
            },
            success: result.success,
            message: result.message,
            content: result.content,
            handler_name: result.handler_name,
            error_kind: (!result.success).then_some(ErrorKind::Handler),
            error: result.error,
            routing: None,
            workflow: None,
            attempts: 0,
            duration_ms: 0,
            metadata: result.metadata,
        }
    }

    /// Result for an error raised before or during dispatch.
    pub fn from_error(request_id: Uuid, error: &SwitchyardError) -> Self {
        let kind = error.kind();
        let outcome = match kind {
            ErrorKind::Cancelled => Outcome::Cancelled,
            ErrorKind::Validation => Outcome::Rejected,
            _ => Outcome::Failed,
        };
        Self {
            request_id,
            outcome,
            success: false,
            message: error.to_string(),
            content: None,
            handler_name: None,
            error_kind: Some(kind),
            error: Some(error.to_string()),
            routing: None,
            workflow: None,
            attempts: 0,
            duration_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Result of a workflow run, taken from its final step.
    pub fn from_workflow(request_id: Uuid, workflow: WorkflowResult) -> Self {
        let mut result = match &workflow.final_result {
            Some(last) => Self::from_handler(request_id, last.clone()),
            None => Self::from_handler(
                request_id,
                HandlerResult::failure("Workflow produced no result", "no steps executed"),
            ),
        };
        if workflow.cancelled {
            result.outcome = Outcome::Cancelled;
            result.success = false;
            result.error_kind = Some(ErrorKind::Cancelled);
        } else if !workflow.success {
            result.outcome = Outcome::Failed;
            result.success = false;
            result.error_kind = Some(ErrorKind::WorkflowStep);
            if let Some(step) = &workflow.failed_step {
                result.message = format!("Workflow step '{step}' failed: {}", result.message);
            }
        }
        result.workflow = Some(workflow);
        result
    }
}
