use crate::heuristics::{word_overlap, words, FailureCategory, Severity};
use crate::tracker::{FailureInfo, FailureRecord, FailureTracker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use uuid::Uuid;

/// A past record resembling the failure under diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarFailure {
    /// Id of the similar record.
    pub record_id: Uuid,
    /// Similarity in `[0, 1]`.
    pub score: f64,
    /// Message of the similar record.
    pub message: String,
    /// Component it came from.
    pub component: String,
    /// When it was tracked.
    pub timestamp: DateTime<Utc>,
    /// How it was resolved, if it was.
    pub resolution: Option<String>,
}

/// Root-cause analysis for a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Category of the diagnosed failure.
    pub category: FailureCategory,
    /// Severity of the diagnosed failure.
    pub severity: Severity,
    /// Pattern the failure belongs to.
    pub pattern_key: String,
    /// Times this pattern has been tracked so far.
    pub occurrences: u64,
    /// Most likely cause for the category.
    pub root_cause: String,
    /// Conditions that make the failure more likely.
    pub contributing_factors: Vec<String>,
    /// Likely effects on the system.
    pub impact: Vec<String>,
    /// Most similar first.
    pub similar_failures: Vec<SimilarFailure>,
    /// Recovery strategy names, best first.
    pub recommended_strategies: Vec<String>,
}

/// Weighted similarity between a failure and a past record: 0.4 for the
/// same category, 0.3 for the same component and up to 0.3 from shared
/// message words.
pub fn similarity(
    category: FailureCategory,
    component: &str,
    message_words: &HashSet<String>,
    record: &FailureRecord,
) -> f64 {
    let mut score = 0.0;
    if record.category == category {
        score += 0.4;
    }
    if record.component.eq_ignore_ascii_case(component) {
        score += 0.3;
    }
    score + 0.3 * word_overlap(message_words, &words(&record.message))
}

fn root_cause(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::Timeout => "Operation exceeded its time limit; the dependency is slow or overloaded",
        FailureCategory::Network => "Network connectivity problem between the component and a remote endpoint",
        FailureCategory::Memory => "Memory exhaustion from large allocations or a leak",
        FailureCategory::NullReference => "A value was used before being initialized or after being cleared",
        FailureCategory::Argument => "An invalid argument reached a call that rejected it",
        FailureCategory::FileSystem => "A referenced file or directory is missing or inaccessible",
        FailureCategory::Database => "Database connection, query or transaction failure",
        FailureCategory::Security => "Authentication or authorization was rejected",
        FailureCategory::Configuration => "Missing or invalid configuration value",
        FailureCategory::Unknown => "Root cause could not be determined from the failure text",
    }
}

fn impact(severity: Severity) -> Vec<String> {
    let lines: &[&str] = match severity {
        Severity::Critical => &[
            "Service outage likely",
            "Dependent requests will fail until recovery",
            "Immediate operator attention required",
        ],
        Severity::High => &[
            "Requests routed to the component fail",
            "Users see errors for affected operations",
        ],
        Severity::Medium => &["Degraded performance or intermittent failures"],
        Severity::Low => &["Minimal user impact"],
    };
    lines.iter().map(|s| (*s).to_string()).collect()
}

fn contributing_factors(text: &str, occurrences: u64) -> Vec<String> {
    let lower = text.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    let mut factors = Vec::new();
    if any(&["load", "busy"]) {
        factors.push("High system load".to_string());
    }
    if any(&["concurrent", "thread"]) {
        factors.push("Concurrent access or threading contention".to_string());
    }
    if any(&["resource", "limit"]) {
        factors.push("Resource limits reached".to_string());
    }
    if occurrences >= 3 {
        factors.push(format!("Recurring failure ({occurrences} occurrences)"));
    }
    factors
}

impl FailureTracker {
    /// Diagnose a failure against the tracked history. Does not track it.
    pub fn diagnose(&self, info: &FailureInfo) -> Diagnosis {
        let category = info.category();
        let severity = info.severity();
        let pattern_key = info.pattern_key();
        let occurrences = self.pattern(&pattern_key).map_or(0, |p| p.frequency);

        let message_words = words(&info.message);
        let threshold = self.config.similarity_threshold;
        let mut similar: Vec<SimilarFailure> = self
            .records
            .iter()
            .filter_map(|r| {
                let score = similarity(category, &info.component, &message_words, &r);
                (score >= threshold).then(|| SimilarFailure {
                    record_id: r.id,
                    score,
                    message: r.message.clone(),
                    component: r.component.clone(),
                    timestamp: r.timestamp,
                    resolution: r.resolution.clone(),
                })
            })
            .collect();
        similar.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        similar.truncate(self.config.max_similar);

        let mut factors = contributing_factors(&info.classification_text(), occurrences);
        if let Some(previous) = similar.iter().find_map(|s| s.resolution.as_ref()) {
            factors.push(format!("A similar failure was resolved before: {previous}"));
        }

        Diagnosis {
            category,
            severity,
            pattern_key,
            occurrences,
            root_cause: root_cause(category).to_string(),
            contributing_factors: factors,
            impact: impact(severity),
            similar_failures: similar,
            recommended_strategies: self
                .catalog
                .suggest(category)
                .into_iter()
                .map(|s| s.name)
                .collect(),
        }
    }
}
