use super::{WorkflowContext, WorkflowStep};
use crate::router::RequestRouter;
use async_trait::async_trait;
use std::sync::Arc;
use switchyard_core::{CancellationSignal, HandlerResult, Request, SwitchyardResult};
use switchyard_routing::{detect_language, Classification, IntentClassifier};

/// Rejects requests that carry neither a prompt nor code.
pub struct ValidateRequestStep;

#[async_trait]
impl WorkflowStep for ValidateRequestStep {
    fn name(&self) -> &str {
        "validate_request"
    }

    fn order(&self) -> i32 {
        0
    }

    async fn execute(
        &self,
        request: &Request,
        context: &mut WorkflowContext,
        _cancel: &CancellationSignal,
    ) -> SwitchyardResult<HandlerResult> {
        let has_code = request.code.as_deref().is_some_and(|c| !c.trim().is_empty());
        if request.prompt.trim().is_empty() && !has_code {
            return Ok(HandlerResult::failure(
                "Request has no prompt or code",
                "validation",
            ));
        }
        context.insert("validated", serde_json::json!(true));
        Ok(HandlerResult::success("Request is valid"))
    }
}

/// Writes the detected language under `language`.
pub struct LanguageDetectionStep;

#[async_trait]
impl WorkflowStep for LanguageDetectionStep {
    fn name(&self) -> &str {
        "language_detection"
    }

    fn order(&self) -> i32 {
        10
    }

    async fn execute(
        &self,
        request: &Request,
        context: &mut WorkflowContext,
        _cancel: &CancellationSignal,
    ) -> SwitchyardResult<HandlerResult> {
        let language = detect_language(request);
        context.insert("language", serde_json::json!(language.as_str()));
        Ok(HandlerResult::success(format!("Detected language '{language}'")))
    }
}

/// Classifies the request and stores the classification for later steps.
pub struct IntentClassificationStep {
    classifier: Arc<IntentClassifier>,
}

impl IntentClassificationStep {
    /// Step backed by `classifier`.
    pub fn new(classifier: Arc<IntentClassifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl WorkflowStep for IntentClassificationStep {
    fn name(&self) -> &str {
        "intent_classification"
    }

    fn order(&self) -> i32 {
        20
    }

    async fn execute(
        &self,
        request: &Request,
        context: &mut WorkflowContext,
        _cancel: &CancellationSignal,
    ) -> SwitchyardResult<HandlerResult> {
        let classification = self.classifier.classify(request);
        context.insert("intent", serde_json::json!(classification.intent.as_str()));
        context.insert("confidence", serde_json::json!(classification.confidence));
        context.insert("keywords", serde_json::json!(classification.keywords));
        context.insert("classification", serde_json::to_value(&classification)?);
        Ok(HandlerResult::success(format!(
            "Classified as '{}' ({:.2})",
            classification.intent, classification.confidence
        )))
    }
}

/// Routes the request to a handler and invokes it.
///
/// Reuses the classification written by [`IntentClassificationStep`] when
/// present.
pub struct HandlerDispatchStep {
    router: Arc<RequestRouter>,
}

impl HandlerDispatchStep {
    /// Step dispatching through `router`.
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl WorkflowStep for HandlerDispatchStep {
    fn name(&self) -> &str {
        "handler_dispatch"
    }

    fn order(&self) -> i32 {
        100
    }

    async fn execute(
        &self,
        request: &Request,
        context: &mut WorkflowContext,
        cancel: &CancellationSignal,
    ) -> SwitchyardResult<HandlerResult> {
        let classification = context
            .get("classification")
            .and_then(|v| serde_json::from_value::<Classification>(v.clone()).ok())
            .unwrap_or_else(|| self.router.classify(request));

        let routed = self.router.dispatch(request, classification, cancel).await;
        if let Some(decision) = &routed.decision {
            context.insert("handler", serde_json::json!(decision.handler_name));
            context.insert("routing", serde_json::to_value(decision)?);
        }
        context.insert("attempts", serde_json::json!(routed.attempts));
        routed
            .result
            .map(|r| r.with_metadata("attempts", serde_json::json!(routed.attempts)))
    }
}

/// The standard validate, detect, classify, dispatch pipeline.
pub fn default_steps(router: Arc<RequestRouter>) -> Vec<Arc<dyn WorkflowStep>> {
    vec![
        Arc::new(ValidateRequestStep),
        Arc::new(LanguageDetectionStep),
        Arc::new(IntentClassificationStep::new(router.classifier().clone())),
        Arc::new(HandlerDispatchStep::new(router)),
    ]
}
