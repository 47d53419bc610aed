//! Request orchestration: task queue, workflow engine, orchestrator and
//! dispatcher.
//!
//! A request enters through the [`Dispatcher`] (queued, scheduled, tracked
//! by workflow id) or directly through the [`Orchestrator`]. It is
//! classified and routed, then either handed to a single handler or run
//! through the [`WorkflowEngine`]. Every failure is reported to the
//! failure tracker.
//!
//! # Main types
//!
//! - [`Orchestrator`] - Validates, routes and processes one request; owns the handler pool lifecycle.
//! - [`Dispatcher`] - Submit/status/cancel/retry façade over the queue and scheduler.
//! - [`TaskQueue`] - Priority queue with per-item lifecycle and statistics.
//! - [`WorkflowEngine`] - Ordered steps over a shared [`WorkflowContext`].
//! - [`HandlerInvoker`] - Retry, backoff and timeout around handler calls.
//! - [`EventBus`] - Status and step notifications.

/// Submit/status/cancel/retry façade.
pub mod dispatcher;
/// The orchestrator and request validation.
pub mod engine;
/// Event publication to external listeners.
pub mod events;
/// Handler invocation under retry policy and timeout.
pub mod invoker;
/// Per-handler metrics and in-flight tracking.
pub mod monitor;
/// Exponential backoff retry executor.
pub mod retry;
/// Classification, routing and invocation for one request.
pub mod router;
/// Background queue consumer.
pub mod scheduler;
/// Priority task queue.
pub mod task_queue;
/// Shared orchestration types.
pub mod types;
/// Workflow engine and built-in steps.
pub mod workflow;

pub use dispatcher::{Dispatcher, ItemStatus, SubmitReceipt, WorkflowState, WorkflowStatus};
pub use engine::{validate, Orchestrator};
pub use events::{EventBus, SubscriptionId, SwitchyardEvent};
pub use invoker::HandlerInvoker;
pub use monitor::{HandlerMetrics, HandlerMonitor, InFlightCounter, InFlightGuard};
pub use retry::{retry_with_backoff, Retried};
pub use router::{RequestRouter, Routed};
pub use scheduler::{QueueScheduler, ResultStore};
pub use task_queue::{QueueConfig, TaskQueue};
pub use types::{
    OrchestratorResult, Outcome, Priority, QueueItem, QueueState, QueueStatistics,
    WorkflowResult, WorkflowStepResult,
};
pub use workflow::{
    default_steps, HandlerDispatchStep, IntentClassificationStep, LanguageDetectionStep,
    ValidateRequestStep, WorkflowContext, WorkflowEngine, WorkflowStep,
};
