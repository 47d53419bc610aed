//! Failure tracking and recovery recommendations.
//!
//! The [`FailureTracker`] is an explicitly owned store: construct one per
//! process (or per test), share it behind an `Arc`, and start/stop its
//! housekeeping task with its owner's lifecycle.
//!
//! # Main types
//!
//! - [`FailureTracker`] - Records failures, aggregates [`FailurePattern`]s, diagnoses.
//! - [`RecoveryCatalog`] / [`RecoveryStrategy`] - Ranked remediation procedures.
//! - [`Diagnosis`] - Root cause, contributing factors, impact and similar failures.
//! - [`FailureReport`] - Aggregates over a time range.

/// Recovery strategy catalog.
pub mod catalog;
/// Similarity scoring and diagnosis.
pub mod diagnosis;
/// Category, severity, trend and pattern key heuristics.
pub mod heuristics;
/// Time-range failure reports.
pub mod report;
/// The failure tracker store.
pub mod tracker;

pub use catalog::{RecoveryCatalog, RecoveryStrategy, RiskLevel};
pub use diagnosis::{Diagnosis, SimilarFailure};
pub use heuristics::{FailureCategory, Severity, Trend};
pub use report::{FailureReport, PatternSummary};
pub use tracker::{
    FailureInfo, FailurePattern, FailureRecord, FailureTracker, FailureTrackerConfig,
    HousekeepingStats, TrackerSnapshot,
};
