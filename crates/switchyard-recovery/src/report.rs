use crate::heuristics::{FailureCategory, Trend};
use crate::tracker::FailureTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Number of patterns listed in a report.
const TOP_PATTERNS: usize = 10;

/// Per-pattern line in a [`FailureReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    /// Pattern key.
    pub key: String,
    /// Human-readable description.
    pub description: String,
    /// Failure category.
    pub category: FailureCategory,
    /// Occurrences inside the report window.
    pub occurrences: usize,
    /// Lifetime frequency.
    pub frequency: u64,
    /// Current trend.
    pub trend: Trend,
}

/// Aggregate view of the failures recorded in a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Start of the window.
    pub from: DateTime<Utc>,
    /// End of the window.
    pub to: DateTime<Utc>,
    /// Failures tracked in the window.
    pub total_failures: usize,
    /// Of those, how many were resolved.
    pub resolved: usize,
    /// Counts keyed by category label.
    pub by_category: BTreeMap<String, usize>,
    /// Counts keyed by severity label.
    pub by_severity: BTreeMap<String, usize>,
    /// Counts keyed by component.
    pub by_component: BTreeMap<String, usize>,
    /// Most frequent in the window first.
    pub top_patterns: Vec<PatternSummary>,
    /// Keys of patterns with an increasing trend.
    pub increasing_patterns: Vec<String>,
}

impl FailureTracker {
    /// Summarize records with `from <= timestamp <= to`.
    pub fn failure_report(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> FailureReport {
        let mut report = FailureReport {
            from,
            to,
            total_failures: 0,
            resolved: 0,
            by_category: BTreeMap::new(),
            by_severity: BTreeMap::new(),
            by_component: BTreeMap::new(),
            top_patterns: Vec::new(),
            increasing_patterns: Vec::new(),
        };
        let mut per_pattern: HashMap<String, usize> = HashMap::new();

        for record in self.records.iter() {
            if record.timestamp < from || record.timestamp > to {
                continue;
            }
            report.total_failures += 1;
            if record.is_resolved() {
                report.resolved += 1;
            }
            *report.by_category.entry(record.category.to_string()).or_default() += 1;
            *report.by_severity.entry(record.severity.to_string()).or_default() += 1;
            *report.by_component.entry(record.component.clone()).or_default() += 1;
            *per_pattern.entry(record.pattern_key.clone()).or_default() += 1;
        }

        let mut top: Vec<PatternSummary> = per_pattern
            .into_iter()
            .filter_map(|(key, occurrences)| {
                let pattern = self.pattern(&key)?;
                Some(PatternSummary {
                    key,
                    description: pattern.description,
                    category: pattern.category,
                    occurrences,
                    frequency: pattern.frequency,
                    trend: pattern.trend,
                })
            })
            .collect();
        top.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then_with(|| a.key.cmp(&b.key)));

        report.increasing_patterns = top
            .iter()
            .filter(|p| p.trend == Trend::Increasing)
            .map(|p| p.key.clone())
            .collect();
        top.truncate(TOP_PATTERNS);
        report.top_patterns = top;
        report
    }
}
