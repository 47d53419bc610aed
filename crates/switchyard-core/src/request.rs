use crate::handler::HandlerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Context key that flags a request for workflow execution.
pub const WORKFLOW_CONTEXT_KEY: &str = "workflow";

/// Context key carrying the caller-supplied workflow identifier.
pub const WORKFLOW_ID_CONTEXT_KEY: &str = "workflow_id";

/// A free-form work request.
///
/// Everything except `context` is fixed once the request is submitted.
/// The context bag accumulates values as the request moves through workflow steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request id.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Caller identity, if known.
    #[serde(default)]
    pub user: Option<String>,
    /// Free-form instruction text.
    pub prompt: String,
    /// Code the prompt refers to.
    #[serde(default)]
    pub code: Option<String>,
    /// Path of the file the code came from; drives language detection.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Handler type the caller asked for.
    #[serde(default)]
    pub preferred_handler: Option<HandlerType>,
    /// Values shared with workflow steps.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl Request {
    /// Request with a prompt and nothing else.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            user: None,
            prompt: prompt.into(),
            code: None,
            file_path: None,
            preferred_handler: None,
            context: HashMap::new(),
        }
    }

    /// Attach code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach the source file path.
    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Record the caller.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Ask for a specific handler type.
    pub fn with_preferred_handler(mut self, handler_type: HandlerType) -> Self {
        self.preferred_handler = Some(handler_type);
        self
    }

    /// Set one context value.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Flag this request for workflow execution.
    pub fn as_workflow(self) -> Self {
        self.with_context(WORKFLOW_CONTEXT_KEY, serde_json::Value::Bool(true))
    }

    /// True when the context bag asks for workflow execution.
    ///
    /// Accepts a boolean `true` or the string `"true"`.
    pub fn is_workflow(&self) -> bool {
        match self.context.get(WORKFLOW_CONTEXT_KEY) {
            Some(serde_json::Value::Bool(flag)) => *flag,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Caller-supplied workflow identifier, if any.
    pub fn workflow_id(&self) -> Option<&str> {
        self.context
            .get(WORKFLOW_ID_CONTEXT_KEY)
            .and_then(serde_json::Value::as_str)
    }

    /// Extension of `file_path` in lower case, without the dot.
    pub fn file_extension(&self) -> Option<String> {
        let path = self.file_path.as_deref()?;
        let name = path.rsplit(['/', '\\']).next()?;
        let (_, ext) = name.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext.to_ascii_lowercase())
        }
    }
}

/// Structured outcome returned by a handler or a workflow step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerResult {
    /// Whether the handler did its job.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Produced content such as a patch or an explanation.
    #[serde(default)]
    pub content: Option<String>,
    /// Name of the handler that produced the result.
    #[serde(default)]
    pub handler_name: Option<String>,
    /// Error detail for failed results.
    #[serde(default)]
    pub error: Option<String>,
    /// Extra structured detail.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HandlerResult {
    /// Creates a successful result.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    /// Creates a failed result with an error detail.
    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach produced content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Record the producing handler.
    pub fn with_handler(mut self, name: impl Into<String>) -> Self {
        self.handler_name = Some(name.into());
        self
    }

    /// Add one metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Text used to match the failure against retry allowlists and failure heuristics.
    pub fn failure_text(&self) -> String {
        match &self.error {
            Some(err) if !err.is_empty() => format!("{}: {}", self.message, err),
            _ => self.message.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = Request::new("Fix the null reference error")
            .with_file_path("src/Foo.cs")
            .with_code("var x = null;")
            .with_user("dev");
        assert_eq!(req.prompt, "Fix the null reference error");
        assert_eq!(req.file_extension().as_deref(), Some("cs"));
        assert_eq!(req.user.as_deref(), Some("dev"));
        assert!(!req.is_workflow());
    }

    #[test]
    fn test_workflow_flag() {
        let req = Request::new("refactor").as_workflow();
        assert!(req.is_workflow());

        let req = Request::new("refactor")
            .with_context(WORKFLOW_CONTEXT_KEY, serde_json::json!("TRUE"));
        assert!(req.is_workflow());

        let req = Request::new("refactor").with_context(WORKFLOW_CONTEXT_KEY, serde_json::json!(0));
        assert!(!req.is_workflow());
    }

    #[test]
    fn test_workflow_id_from_context() {
        let req = Request::new("x").with_context(WORKFLOW_ID_CONTEXT_KEY, serde_json::json!("wf-1"));
        assert_eq!(req.workflow_id(), Some("wf-1"));
        assert_eq!(Request::new("x").workflow_id(), None);
    }

    #[test]
    fn test_file_extension_edge_cases() {
        assert_eq!(Request::new("x").file_extension(), None);
        assert_eq!(
            Request::new("x").with_file_path("Makefile").file_extension(),
            None
        );
        assert_eq!(
            Request::new("x")
                .with_file_path("C:\\code\\App.Main.PY")
                .file_extension()
                .as_deref(),
            Some("py")
        );
        assert_eq!(
            Request::new("x").with_file_path("dir.v2/README").file_extension(),
            None
        );
    }

    #[test]
    fn test_handler_result_failure_text() {
        let result = HandlerResult::failure("Handler failed", "connection reset");
        assert!(!result.success);
        assert_eq!(result.failure_text(), "Handler failed: connection reset");

        let ok = HandlerResult::success("done").with_content("patched").with_handler("fixer");
        assert!(ok.success);
        assert_eq!(ok.failure_text(), "done");
        assert_eq!(ok.handler_name.as_deref(), Some("fixer"));
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: Request = serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "created_at": Utc::now(),
            "prompt": "explain this"
        }))
        .unwrap();
        assert!(req.context.is_empty());
        assert!(req.preferred_handler.is_none());
    }
}
