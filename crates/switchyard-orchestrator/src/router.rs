use crate::invoker::HandlerInvoker;
use std::sync::Arc;
use switchyard_core::{
    CancellationSignal, Handler, HandlerDescriptor, HandlerPool, HandlerResult, Request,
    SwitchyardError, SwitchyardResult,
};
use switchyard_recovery::FailureInfo;
use switchyard_routing::{Classification, IntentClassifier, RoutingDecision, RoutingEngine};
use tracing::{debug, warn};

/// Outcome of routing and invoking a single handler.
#[derive(Debug)]
pub struct Routed {
    /// Classification the route was chosen from.
    pub classification: Classification,
    /// Chosen handler, `None` when routing failed.
    pub decision: Option<RoutingDecision>,
    /// Handler result, or the routing or invocation error.
    pub result: SwitchyardResult<HandlerResult>,
    /// Handler attempts made, retries included.
    pub attempts: u32,
}

/// Classify, route and invoke: the single-handler path shared by the
/// orchestrator and the dispatch workflow step.
pub struct RequestRouter {
    pool: Arc<dyn HandlerPool>,
    classifier: Arc<IntentClassifier>,
    routing: Arc<RoutingEngine>,
    invoker: Arc<HandlerInvoker>,
}

impl RequestRouter {
    /// Router over the handlers in `pool`.
    pub fn new(
        pool: Arc<dyn HandlerPool>,
        classifier: Arc<IntentClassifier>,
        routing: Arc<RoutingEngine>,
        invoker: Arc<HandlerInvoker>,
    ) -> Self {
        Self {
            pool,
            classifier,
            routing,
            invoker,
        }
    }

    /// Classifier used by `classify`.
    pub fn classifier(&self) -> &Arc<IntentClassifier> {
        &self.classifier
    }

    /// Rule engine; rule outcomes are recorded here after dispatch.
    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }

    /// Invoker applying retries, timeouts and concurrency caps.
    pub fn invoker(&self) -> &Arc<HandlerInvoker> {
        &self.invoker
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> Classification {
        self.classifier.classify(request)
    }

    /// Started handlers that accept the request.
    pub fn available(&self, request: &Request) -> Vec<Arc<dyn Handler>> {
        self.pool.handlers(&|h: &dyn Handler| h.can_handle(request))
    }

    /// Pick the target handler for an already classified request.
    pub fn resolve(
        &self,
        request: &Request,
        classification: &Classification,
    ) -> SwitchyardResult<(RoutingDecision, Arc<dyn Handler>)> {
        let available = self.available(request);
        let descriptors: Vec<HandlerDescriptor> =
            available.iter().map(|h| h.descriptor()).collect();
        let decision = self
            .routing
            .route(classification, &descriptors, request.preferred_handler)?;
        let handler = available
            .into_iter()
            .find(|h| h.name() == decision.handler_name)
            .ok_or_else(|| {
                SwitchyardError::Internal(format!(
                    "Routed to '{}' but the handler disappeared",
                    decision.handler_name
                ))
            })?;
        debug!(
            request_id = %request.id,
            handler = %decision.handler_name,
            confidence = decision.confidence,
            fallback = decision.is_fallback,
            "Request routed"
        );
        Ok((decision, handler))
    }

    /// Route and invoke. Rule statistics are updated once the handler
    /// outcome is known.
    pub async fn dispatch(
        &self,
        request: &Request,
        classification: Classification,
        cancel: &CancellationSignal,
    ) -> Routed {
        let (decision, handler) = match self.resolve(request, &classification) {
            Ok(found) => found,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Routing failed");
                self.invoker.tracker().track(
                    &FailureInfo::new(e.to_string(), "router")
                        .with_request(request.id)
                        .with_context("intent", serde_json::json!(classification.intent.as_str())),
                );
                return Routed {
                    classification,
                    decision: None,
                    result: Err(e),
                    attempts: 0,
                };
            }
        };

        let invocation = self.invoker.invoke(&handler, request, cancel).await;
        if let Some(rule_id) = decision.rule_id {
            if !matches!(invocation.result, Err(SwitchyardError::Cancelled)) {
                self.routing.record_outcome(rule_id, invocation.result.is_ok());
            }
        }

        Routed {
            classification,
            decision: Some(decision),
            result: invocation.result,
            attempts: invocation.attempts,
        }
    }
}
