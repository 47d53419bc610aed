//! Core types and error definitions for the Switchyard routing engine.
//!
//! This crate provides the foundational types shared across all Switchyard
//! crates: the error taxonomy, the request model, and the contracts that the
//! external task handlers and their pool must satisfy.
//!
//! # Main types
//!
//! - [`SwitchyardError`] - Unified error enum, one variant per error class.
//! - [`SwitchyardResult`] - Convenience alias for `Result<T, SwitchyardError>`.
//! - [`Request`] - A free-form work request plus its mutable context bag.
//! - [`HandlerResult`] - Structured outcome returned by a handler.
//! - [`Handler`] / [`HandlerPool`] - Contracts for pluggable task handlers.
//! - [`HandlerConfig`] / [`RetryPolicy`] - Per-handler execution settings.
//! - [`CancellationSignal`] - Cooperative cancellation observed at every suspension point.

/// Cooperative cancellation primitives.
pub mod cancel;
/// Handler configuration and retry policy.
pub mod config;
/// Handler and handler-pool contracts plus the in-memory registry.
pub mod handler;
/// Request and result models.
pub mod request;

pub use cancel::{CancellationSignal, CancellationSource};
pub use config::{ConfigurationProvider, HandlerConfig, RetryPolicy, StaticConfigProvider};
pub use handler::{Handler, HandlerDescriptor, HandlerPool, HandlerRegistry, HandlerType};
pub use request::{HandlerResult, Request, WORKFLOW_CONTEXT_KEY, WORKFLOW_ID_CONTEXT_KEY};

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for Switchyard.
///
/// Each variant corresponds to one class of the error taxonomy. Only
/// [`SwitchyardError::TransientHandler`] is ever retried.
#[derive(Debug, thiserror::Error)]
pub enum SwitchyardError {
    /// Malformed or missing request; rejected synchronously.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A handler failure that matched the retryable allowlist.
    #[error("Transient handler error: {0}")]
    TransientHandler(String),

    /// A handler failure that is not retryable, or retries were exhausted.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A workflow step failed and aborted the remaining steps.
    #[error("Workflow step '{step}' failed: {reason}")]
    WorkflowStep {
        /// Name of the failing step.
        step: String,
        /// Failure message reported by the step.
        reason: String,
    },

    /// No handler could be resolved for the request.
    #[error("Routing error: {0}")]
    Routing(String),

    /// The operation observed a cancellation signal.
    #[error("Operation cancelled")]
    Cancelled,

    /// An unexpected fault inside the engine itself.
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`SwitchyardError`].
pub type SwitchyardResult<T> = Result<T, SwitchyardError>;

/// Serializable discriminant of [`SwitchyardError`], carried in structured results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or empty input.
    Validation,
    /// Handler failure worth retrying.
    TransientHandler,
    /// Handler failure that retrying will not fix.
    Handler,
    /// A workflow step failed.
    WorkflowStep,
    /// No handler could be selected.
    Routing,
    /// Work was cancelled before it finished.
    Cancelled,
    /// Configuration, serialization or other internal faults.
    Internal,
}

impl SwitchyardError {
    /// Classify this error for inclusion in a structured result.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwitchyardError::Validation(_) => ErrorKind::Validation,
            SwitchyardError::TransientHandler(_) => ErrorKind::TransientHandler,
            SwitchyardError::Handler(_) => ErrorKind::Handler,
            SwitchyardError::WorkflowStep { .. } => ErrorKind::WorkflowStep,
            SwitchyardError::Routing(_) => ErrorKind::Routing,
            SwitchyardError::Cancelled => ErrorKind::Cancelled,
            SwitchyardError::Internal(_)
            | SwitchyardError::Config(_)
            | SwitchyardError::Json(_)
            | SwitchyardError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SwitchyardError::TransientHandler(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SwitchyardError::Validation("empty".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(SwitchyardError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            SwitchyardError::Config("bad".into()).kind(),
            ErrorKind::Internal
        );
        let step = SwitchyardError::WorkflowStep {
            step: "validate".into(),
            reason: "no prompt".into(),
        };
        assert_eq!(step.kind(), ErrorKind::WorkflowStep);
        assert_eq!(step.to_string(), "Workflow step 'validate' failed: no prompt");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(SwitchyardError::TransientHandler("timeout".into()).is_transient());
        assert!(!SwitchyardError::Handler("bad input".into()).is_transient());
        assert!(!SwitchyardError::Internal("oops".into()).is_transient());
    }
}
