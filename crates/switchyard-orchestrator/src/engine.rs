use crate::events::EventBus;
use crate::invoker::HandlerInvoker;
use crate::monitor::{HandlerMonitor, InFlightCounter, InFlightGuard};
use crate::router::RequestRouter;
use crate::types::{OrchestratorResult, Outcome};
use crate::workflow::{default_steps, WorkflowEngine};
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::{
    CancellationSignal, ConfigurationProvider, ErrorKind, HandlerPool, Request, SwitchyardError,
    SwitchyardResult,
};
use switchyard_recovery::FailureTracker;
use switchyard_routing::{IntentClassifier, RoutingDecision, RoutingEngine};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Top-level entry point for processing a single request.
///
/// Validates the request, then either dispatches it to one handler or runs
/// it through the workflow engine. Owns the handler pool lifecycle; start
/// and stop are both idempotent. A request counts as active from admission
/// until its result is built, and shutdown waits for every active request.
pub struct Orchestrator {
    pool: Arc<dyn HandlerPool>,
    router: Arc<RequestRouter>,
    workflow: Arc<WorkflowEngine>,
    tracker: Arc<FailureTracker>,
    monitor: Arc<HandlerMonitor>,
    events: Arc<EventBus>,
    active: InFlightCounter,
    lifecycle: Mutex<Lifecycle>,
}

impl Orchestrator {
    /// Create an orchestrator with the default classifier and the built-in
    /// workflow steps.
    pub fn new(
        pool: Arc<dyn HandlerPool>,
        config: Arc<dyn ConfigurationProvider>,
        routing: RoutingEngine,
        tracker: Arc<FailureTracker>,
    ) -> Self {
        Self::with_classifier(pool, config, routing, tracker, IntentClassifier::new())
    }

    /// Create with a custom classifier.
    pub fn with_classifier(
        pool: Arc<dyn HandlerPool>,
        config: Arc<dyn ConfigurationProvider>,
        routing: RoutingEngine,
        tracker: Arc<FailureTracker>,
        classifier: IntentClassifier,
    ) -> Self {
        let monitor = Arc::new(HandlerMonitor::new());
        let events = Arc::new(EventBus::new());
        let invoker = Arc::new(HandlerInvoker::new(config, tracker.clone(), monitor.clone()));
        let router = Arc::new(RequestRouter::new(
            pool.clone(),
            Arc::new(classifier),
            Arc::new(routing),
            invoker,
        ));
        let workflow = WorkflowEngine::new()
            .with_events(events.clone())
            .with_tracker(tracker.clone());
        for step in default_steps(router.clone()) {
            workflow.register(step);
        }

        Self {
            pool,
            router,
            workflow: Arc::new(workflow),
            tracker,
            monitor,
            events,
            active: InFlightCounter::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// Router used for direct dispatch and by the dispatch step.
    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// The workflow engine; register extra steps here.
    pub fn workflow(&self) -> &Arc<WorkflowEngine> {
        &self.workflow
    }

    /// Failure tracker shared by every component.
    pub fn tracker(&self) -> &Arc<FailureTracker> {
        &self.tracker
    }

    /// Per-handler invocation metrics.
    pub fn monitor(&self) -> &Arc<HandlerMonitor> {
        &self.monitor
    }

    /// Bus for step and status events.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Requests admitted and not yet finished.
    pub fn active_requests(&self) -> usize {
        self.active.count()
    }

    /// True between a successful `initialize` and `shutdown`.
    pub async fn is_running(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Running
    }

    /// Start the handler pool and failure housekeeping. Repeated calls are
    /// no-ops; an orchestrator that has been shut down cannot be restarted.
    pub async fn initialize(&self) -> SwitchyardResult<()> {
        let mut state = self.lifecycle.lock().await;
        self.start_locked(&mut state).await
    }

    async fn start_locked(&self, state: &mut Lifecycle) -> SwitchyardResult<()> {
        match *state {
            Lifecycle::Running => Ok(()),
            Lifecycle::Stopped => Err(shut_down()),
            Lifecycle::Created => {
                self.pool.start_all().await?;
                self.tracker.start_housekeeping();
                *state = Lifecycle::Running;
                info!("Orchestrator initialized");
                Ok(())
            }
        }
    }

    /// Admit a request, starting the orchestrator on first use. The guard
    /// is taken under the lifecycle lock, so once `shutdown` has marked the
    /// orchestrator stopped no new request can become active.
    async fn admit(&self) -> SwitchyardResult<InFlightGuard> {
        let mut state = self.lifecycle.lock().await;
        self.start_locked(&mut state).await?;
        Ok(self.active.begin())
    }

    /// Stop admitting requests, wait for active requests and in-flight
    /// handler calls, then stop the pool and the housekeeping task.
    /// Idempotent.
    pub async fn shutdown(&self) -> SwitchyardResult<()> {
        let mut state = self.lifecycle.lock().await;
        match *state {
            Lifecycle::Stopped => return Ok(()),
            Lifecycle::Created => {
                *state = Lifecycle::Stopped;
                return Ok(());
            }
            Lifecycle::Running => {}
        }
        *state = Lifecycle::Stopped;

        let active = self.active.count();
        if active > 0 {
            info!(active, "Waiting for active requests");
        }
        self.active.wait_idle().await;
        self.monitor.wait_idle().await;
        self.tracker.stop_housekeeping().await;
        self.pool.stop_all().await?;
        info!("Orchestrator shut down");
        Ok(())
    }

    /// Process a request without external cancellation.
    pub async fn process(&self, request: &Request) -> OrchestratorResult {
        self.process_with_cancel(request, &CancellationSignal::never())
            .await
    }

    /// Process a request to a structured result. Never returns a raw error.
    pub async fn process_with_cancel(
        &self,
        request: &Request,
        cancel: &CancellationSignal,
    ) -> OrchestratorResult {
        let started = Instant::now();
        let mut result = match self.run(request, cancel).await {
            Ok(result) => result,
            Err(e) => {
                match e.kind() {
                    ErrorKind::Validation => {
                        warn!(request_id = %request.id, error = %e, "Request rejected");
                    }
                    ErrorKind::Cancelled => {
                        info!(request_id = %request.id, "Request cancelled");
                    }
                    _ => error!(request_id = %request.id, error = %e, "Request processing failed"),
                }
                OrchestratorResult::from_error(request.id, &e)
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;

        match result.outcome {
            Outcome::Succeeded => info!(
                request_id = %request.id,
                handler = result.handler_name.as_deref().unwrap_or("-"),
                attempts = result.attempts,
                duration_ms = result.duration_ms,
                "Request completed"
            ),
            Outcome::Failed => warn!(
                request_id = %request.id,
                error = result.error.as_deref().unwrap_or("-"),
                attempts = result.attempts,
                "Request failed"
            ),
            Outcome::Cancelled | Outcome::Rejected => {}
        }
        result
    }

    async fn run(
        &self,
        request: &Request,
        cancel: &CancellationSignal,
    ) -> SwitchyardResult<OrchestratorResult> {
        validate(request)?;
        let _active = self.admit().await?;
        if cancel.is_cancelled() {
            return Err(SwitchyardError::Cancelled);
        }

        if request.is_workflow() {
            let workflow = self.workflow.execute(request, cancel).await;
            let routing = workflow
                .context
                .get("routing")
                .and_then(|v| serde_json::from_value::<RoutingDecision>(v.clone()).ok());
            let attempts = workflow
                .context
                .get("attempts")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as u32;
            let mut result = OrchestratorResult::from_workflow(request.id, workflow);
            if result.handler_name.is_none() {
                result.handler_name = routing.as_ref().map(|d| d.handler_name.clone());
            }
            result.routing = routing;
            result.attempts = attempts;
            return Ok(result);
        }

        let classification = self.router.classify(request);
        let routed = self.router.dispatch(request, classification, cancel).await;
        let mut result = match routed.result {
            Ok(handled) => OrchestratorResult::from_handler(request.id, handled),
            Err(e) => OrchestratorResult::from_error(request.id, &e),
        };
        if result.handler_name.is_none() {
            result.handler_name = routed.decision.as_ref().map(|d| d.handler_name.clone());
        }
        result.metadata.insert(
            "intent".to_string(),
            serde_json::json!(routed.classification.intent.as_str()),
        );
        result.routing = routed.decision;
        result.attempts = routed.attempts;
        Ok(result)
    }

}

fn shut_down() -> SwitchyardError {
    SwitchyardError::Validation("orchestrator has been shut down".into())
}

/// Reject requests that carry no work.
pub fn validate(request: &Request) -> SwitchyardResult<()> {
    let has_code = request.code.as_deref().is_some_and(|c| !c.trim().is_empty());
    if request.prompt.trim().is_empty() && !has_code {
        return Err(SwitchyardError::Validation(
            "request must carry a prompt or code".into(),
        ));
    }
    Ok(())
}
