//! Sequential multi-step processing over a shared mutable context.

mod steps;

pub use steps::{
    default_steps, HandlerDispatchStep, IntentClassificationStep, LanguageDetectionStep,
    ValidateRequestStep,
};

use crate::events::{EventBus, SwitchyardEvent};
use crate::types::{WorkflowResult, WorkflowStepResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::{
    CancellationSignal, HandlerResult, Request, SwitchyardError, SwitchyardResult,
};
use switchyard_recovery::{FailureInfo, FailureTracker};
use tracing::{debug, info, warn};

/// Request-scoped state shared by the steps of one workflow run.
///
/// Seeded from the request's context bag; each step may read what earlier
/// steps wrote and add its own values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    workflow_id: String,
    values: HashMap<String, serde_json::Value>,
}

impl WorkflowContext {
    /// Context for `workflow_id` seeded with `values`.
    pub fn new(workflow_id: impl Into<String>, values: HashMap<String, serde_json::Value>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            values,
        }
    }

    /// Id of the workflow this context belongs to.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// String value stored under `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(serde_json::Value::as_str)
    }

    /// Store a value, replacing any earlier one.
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Whether `key` is set.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Consume the context, returning its values.
    pub fn into_values(self) -> HashMap<String, serde_json::Value> {
        self.values
    }
}

/// One stage of a workflow.
///
/// Steps hold no per-request state; everything request-scoped goes in the
/// [`WorkflowContext`].
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    /// Unique step name.
    fn name(&self) -> &str;

    /// Ascending execution position.
    fn order(&self) -> i32;

    /// Whether the step applies to `request`. Skipped steps are not recorded.
    fn can_handle(&self, _request: &Request) -> bool {
        true
    }

    /// Run the step. An unsuccessful result or an error stops the workflow.
    async fn execute(
        &self,
        request: &Request,
        context: &mut WorkflowContext,
        cancel: &CancellationSignal,
    ) -> SwitchyardResult<HandlerResult>;
}

/// Runs registered steps in order, stopping at the first failure.
pub struct WorkflowEngine {
    steps: RwLock<Vec<Arc<dyn WorkflowStep>>>,
    events: Option<Arc<EventBus>>,
    tracker: Option<Arc<FailureTracker>>,
}

impl WorkflowEngine {
    /// Engine with no steps.
    pub fn new() -> Self {
        Self {
            steps: RwLock::new(Vec::new()),
            events: None,
            tracker: None,
        }
    }

    /// Publish a `StepCompleted` event after every step.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Record internal step faults as failures.
    pub fn with_tracker(mut self, tracker: Arc<FailureTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Register a step, replacing any step with the same name.
    pub fn register(&self, step: Arc<dyn WorkflowStep>) {
        let mut steps = self.steps.write();
        steps.retain(|s| s.name() != step.name());
        debug!(step = step.name(), order = step.order(), "Workflow step registered");
        steps.push(step);
    }

    /// Registered step names in execution order.
    pub fn step_names(&self) -> Vec<String> {
        let mut steps = self.steps.read().clone();
        steps.sort_by_key(|s| s.order());
        steps.iter().map(|s| s.name().to_string()).collect()
    }

    /// Run every step that accepts `request`, in order. Step failures are
    /// reported in the result rather than returned as errors.
    pub async fn execute(&self, request: &Request, cancel: &CancellationSignal) -> WorkflowResult {
        let workflow_id = request
            .workflow_id()
            .map(str::to_string)
            .unwrap_or_else(|| request.id.to_string());

        let mut selected: Vec<Arc<dyn WorkflowStep>> = self
            .steps
            .read()
            .iter()
            .filter(|s| s.can_handle(request))
            .cloned()
            .collect();
        selected.sort_by_key(|s| s.order());

        if selected.is_empty() {
            warn!(workflow_id = %workflow_id, "No workflow step accepts the request");
            return WorkflowResult {
                workflow_id,
                steps: Vec::new(),
                success: false,
                cancelled: false,
                failed_step: None,
                final_result: Some(HandlerResult::failure(
                    "No workflow step accepts the request",
                    "empty workflow",
                )),
                context: request.context.clone(),
            };
        }

        info!(workflow_id = %workflow_id, steps = selected.len(), "Workflow started");
        let mut context = WorkflowContext::new(workflow_id.clone(), request.context.clone());
        let mut results: Vec<WorkflowStepResult> = Vec::with_capacity(selected.len());
        let mut cancelled = false;
        let mut failed_step = None;

        for step in selected {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let name = step.name().to_string();
            let started = Instant::now();
            let outcome = step.execute(request, &mut context, cancel).await;

            let mut metadata = HashMap::new();
            metadata.insert("order".to_string(), serde_json::json!(step.order()));
            metadata.insert(
                "duration_ms".to_string(),
                serde_json::json!(started.elapsed().as_millis() as u64),
            );

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    if matches!(e, SwitchyardError::Cancelled) {
                        cancelled = true;
                    } else {
                        self.track_fault(&name, request, &e);
                    }
                    metadata.insert("error_kind".to_string(), serde_json::json!(e.kind()));
                    HandlerResult::failure(format!("Step '{name}' failed"), e.to_string())
                }
            };
            let success = result.success;
            debug!(workflow_id = %workflow_id, step = %name, success, "Workflow step finished");

            if let Some(events) = &self.events {
                events.publish(&SwitchyardEvent::StepCompleted {
                    workflow_id: workflow_id.clone(),
                    step: name.clone(),
                    success,
                });
            }

            results.push(WorkflowStepResult {
                step: name.clone(),
                success,
                result,
                metadata,
            });

            if !success {
                if !cancelled {
                    failed_step = Some(name);
                }
                break;
            }
        }

        let success = !cancelled && failed_step.is_none();
        let final_result = results.last().map(|s| s.result.clone());
        match (&failed_step, cancelled) {
            (_, true) => info!(workflow_id = %workflow_id, steps = results.len(), "Workflow cancelled"),
            (Some(step), _) => warn!(workflow_id = %workflow_id, step = %step, "Workflow aborted"),
            (None, _) => info!(workflow_id = %workflow_id, steps = results.len(), "Workflow completed"),
        }

        WorkflowResult {
            workflow_id,
            steps: results,
            success,
            cancelled,
            failed_step,
            final_result,
            context: context.into_values(),
        }
    }

    fn track_fault(&self, step: &str, request: &Request, error: &SwitchyardError) {
        // Handler and routing failures are tracked where they happen.
        if matches!(
            error,
            SwitchyardError::Handler(_)
                | SwitchyardError::TransientHandler(_)
                | SwitchyardError::Routing(_)
        ) {
            return;
        }
        if let Some(tracker) = &self.tracker {
            tracker.track(
                &FailureInfo::new(error.to_string(), format!("workflow:{step}")).with_request(request.id),
            );
        }
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use switchyard_core::CancellationSource;

    /// Appends its name to the shared `trail` context value.
    struct Scripted {
        name: &'static str,
        order: i32,
        outcome: Result<bool, &'static str>,
        accepts: bool,
        ran: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Scripted {
        fn ok(name: &'static str, order: i32, ran: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                order,
                outcome: Ok(true),
                accepts: true,
                ran: ran.clone(),
            })
        }

        fn failing(name: &'static str, order: i32, ran: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                order,
                outcome: Ok(false),
                accepts: true,
                ran: ran.clone(),
            })
        }
    }

    #[async_trait]
    impl WorkflowStep for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn can_handle(&self, _request: &Request) -> bool {
            self.accepts
        }

        async fn execute(
            &self,
            _request: &Request,
            context: &mut WorkflowContext,
            _cancel: &CancellationSignal,
        ) -> SwitchyardResult<HandlerResult> {
            self.ran.lock().push(self.name);
            let trail = context.get_str("trail").unwrap_or_default().to_string();
            context.insert("trail", serde_json::json!(format!("{trail}{}", self.name)));
            match self.outcome {
                Ok(true) => Ok(HandlerResult::success(format!("{} ok", self.name))),
                Ok(false) => Ok(HandlerResult::failure(format!("{} failed", self.name), "scripted")),
                Err(msg) => Err(SwitchyardError::Internal(msg.into())),
            }
        }
    }

    fn trail() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let ran = trail();
        let engine = WorkflowEngine::new();
        engine.register(Scripted::ok("a", 1, &ran));
        engine.register(Scripted::failing("b", 2, &ran));
        engine.register(Scripted::ok("c", 3, &ran));

        let result = engine
            .execute(&Request::new("go"), &CancellationSignal::never())
            .await;
        assert!(!result.success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.failed_step.as_deref(), Some("b"));
        assert_eq!(*ran.lock(), vec!["a", "b"]);
        assert_eq!(result.final_result.unwrap().message, "b failed");
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let ran = trail();
        let engine = WorkflowEngine::new();
        engine.register(Scripted::ok("a", 1, &ran));
        engine.register(Scripted::ok("b", 2, &ran));

        let result = engine
            .execute(&Request::new("go"), &CancellationSignal::never())
            .await;
        assert!(result.success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.final_result.unwrap().message, "b ok");
        assert_eq!(result.context["trail"], serde_json::json!("ab"));
    }

    #[tokio::test]
    async fn test_sorted_by_order_and_filtered() {
        let ran = trail();
        let engine = WorkflowEngine::new();
        engine.register(Scripted::ok("late", 50, &ran));
        engine.register(Scripted::ok("early", 5, &ran));
        engine.register(Arc::new(Scripted {
            name: "skipped",
            order: 10,
            outcome: Ok(true),
            accepts: false,
            ran: ran.clone(),
        }));

        let result = engine
            .execute(&Request::new("go"), &CancellationSignal::never())
            .await;
        assert!(result.success);
        assert_eq!(*ran.lock(), vec!["early", "late"]);
        assert_eq!(engine.step_names(), vec!["early", "skipped", "late"]);
    }

    #[tokio::test]
    async fn test_empty_selection_fails() {
        let engine = WorkflowEngine::new();
        let result = engine
            .execute(&Request::new("go"), &CancellationSignal::never())
            .await;
        assert!(!result.success);
        assert!(result.steps.is_empty());
        assert!(result.final_result.is_some());
    }

    #[tokio::test]
    async fn test_step_error_is_failed_result_and_tracked() {
        let ran = trail();
        let tracker = Arc::new(FailureTracker::default());
        let engine = WorkflowEngine::new().with_tracker(tracker.clone());
        engine.register(Arc::new(Scripted {
            name: "explodes",
            order: 1,
            outcome: Err("configuration missing key"),
            accepts: true,
            ran: ran.clone(),
        }));
        engine.register(Scripted::ok("after", 2, &ran));

        let result = engine
            .execute(&Request::new("go"), &CancellationSignal::never())
            .await;
        assert!(!result.success);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(
            result.steps[0].metadata["error_kind"],
            serde_json::json!("internal")
        );
        assert_eq!(tracker.record_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_next_step() {
        let ran = trail();
        let engine = WorkflowEngine::new();
        engine.register(Scripted::ok("a", 1, &ran));
        let source = CancellationSource::new();
        source.cancel();

        let result = engine.execute(&Request::new("go"), &source.signal()).await;
        assert!(result.cancelled);
        assert!(!result.success);
        assert!(result.steps.is_empty());
        assert!(ran.lock().is_empty());
    }

    #[tokio::test]
    async fn test_step_events_published() {
        let ran = trail();
        let bus = Arc::new(EventBus::new());
        let (_id, mut rx) = bus.subscribe_channel();
        let engine = WorkflowEngine::new().with_events(bus);
        engine.register(Scripted::ok("a", 1, &ran));

        let request = Request::new("go").with_context(
            switchyard_core::WORKFLOW_ID_CONTEXT_KEY,
            serde_json::json!("wf-9"),
        );
        engine.execute(&request, &CancellationSignal::never()).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            SwitchyardEvent::StepCompleted {
                workflow_id: "wf-9".into(),
                step: "a".into(),
                success: true
            }
        );
    }
}
