use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Broad failure class derived from the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Timeouts and deadlines.
    Timeout,
    /// Connections, sockets, DNS and HTTP.
    Network,
    /// Allocation and out-of-memory.
    Memory,
    /// Null or missing references.
    NullReference,
    /// Invalid arguments or formats.
    Argument,
    /// Files, directories, paths and disks.
    FileSystem,
    /// Queries, transactions and deadlocks.
    Database,
    /// Authentication and authorization.
    Security,
    /// Missing or invalid settings.
    Configuration,
    /// No keyword matched.
    Unknown,
}

impl FailureCategory {
    /// Categories in detection order; `Unknown` last.
    pub const ALL: [FailureCategory; 10] = [
        FailureCategory::Timeout,
        FailureCategory::Network,
        FailureCategory::Memory,
        FailureCategory::NullReference,
        FailureCategory::Argument,
        FailureCategory::FileSystem,
        FailureCategory::Database,
        FailureCategory::Security,
        FailureCategory::Configuration,
        FailureCategory::Unknown,
    ];

    /// Snake-case label used in pattern keys and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::Network => "network",
            FailureCategory::Memory => "memory",
            FailureCategory::NullReference => "null_reference",
            FailureCategory::Argument => "argument",
            FailureCategory::FileSystem => "file_system",
            FailureCategory::Database => "database",
            FailureCategory::Security => "security",
            FailureCategory::Configuration => "configuration",
            FailureCategory::Unknown => "unknown",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            FailureCategory::Timeout => &["timeout", "timed out", "deadline exceeded"],
            FailureCategory::Network => &[
                "network",
                "connection",
                "socket",
                "dns",
                "unreachable",
                "http",
            ],
            FailureCategory::Memory => &["out of memory", "outofmemory", "memory", "heap", "allocation"],
            FailureCategory::NullReference => &[
                "null reference",
                "nullreference",
                "null pointer",
                "nullpointer",
                "object reference not set",
                "nonetype",
                "undefined is not",
            ],
            FailureCategory::Argument => &["argument", "parameter", "out of range", "invalid value"],
            FailureCategory::FileSystem => &["file", "directory", "path", "disk", "no such file"],
            FailureCategory::Database => &["database", "sql", "query", "deadlock", "transaction"],
            FailureCategory::Security => &[
                "security",
                "unauthorized",
                "forbidden",
                "access denied",
                "permission",
                "authentication",
                "credential",
            ],
            FailureCategory::Configuration => &["configuration", "config", "setting", "missing key"],
            FailureCategory::Unknown => &[],
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// No severity keyword.
    Low,
    /// Mentions a warning or timeout.
    Medium,
    /// Mentions an error, exception or failure.
    High,
    /// Mentions a critical or fatal condition.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Direction of a pattern's frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Running frequency above 10.
    Increasing,
    /// Between the two thresholds.
    Stable,
    /// Running frequency below 3.
    Decreasing,
}

impl Trend {
    /// Approximate trend from the running frequency alone.
    pub fn from_frequency(frequency: u64) -> Self {
        if frequency > 10 {
            Trend::Increasing
        } else if frequency < 3 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

/// First category whose keywords appear in the text. Timeout is checked
/// before network so "connection timed out" is a timeout.
pub fn categorize(text: &str) -> FailureCategory {
    let lower = text.to_lowercase();
    FailureCategory::ALL
        .iter()
        .copied()
        .find(|c| c.keywords().iter().any(|k| lower.contains(k)))
        .unwrap_or(FailureCategory::Unknown)
}

/// Severity from keywords in a failure text, most severe match first.
pub fn severity_of(text: &str) -> Severity {
    let lower = text.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if any(&["critical", "fatal"]) {
        Severity::Critical
    } else if any(&["error", "exception", "failed"]) {
        Severity::High
    } else if any(&["warning", "timeout"]) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Stable 16-hex-char hash of a message with digit runs masked, so messages
/// differing only in ids, ports or counts share a pattern.
pub fn message_hash(message: &str) -> String {
    let mut masked = String::with_capacity(message.len());
    for c in message.trim().to_lowercase().chars() {
        if c.is_ascii_digit() {
            if !masked.ends_with('#') {
                masked.push('#');
            }
        } else {
            masked.push(c);
        }
    }
    let digest = Sha256::digest(masked.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(16);
    hash
}

/// Pattern key: `category:component:hash`.
pub fn pattern_key(category: FailureCategory, component: &str, message: &str) -> String {
    let component = component.trim();
    let component = if component.is_empty() {
        "unknown".to_string()
    } else {
        component.to_lowercase()
    };
    format!("{}:{}:{}", category.as_str(), component, message_hash(message))
}

/// Distinct lowercase words of three or more characters.
pub fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_string)
        .collect()
}

/// Shared words over the larger word set, in [0, 1].
pub fn word_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let larger = a.len().max(b.len());
    if larger == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / larger as f64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize() {
        assert_eq!(categorize("Connection timed out after 30s"), FailureCategory::Timeout);
        assert_eq!(categorize("Socket closed by peer"), FailureCategory::Network);
        assert_eq!(categorize("OutOfMemoryException"), FailureCategory::Memory);
        assert_eq!(
            categorize("Object reference not set to an instance of an object"),
            FailureCategory::NullReference
        );
        assert_eq!(categorize("Value cannot be null. Parameter name: x"), FailureCategory::Argument);
        assert_eq!(categorize("No such file or directory"), FailureCategory::FileSystem);
        assert_eq!(categorize("SQL deadlock victim"), FailureCategory::Database);
        assert_eq!(categorize("401 Unauthorized"), FailureCategory::Security);
        assert_eq!(categorize("missing key 'api_url'"), FailureCategory::Configuration);
        assert_eq!(categorize("something odd"), FailureCategory::Unknown);
    }

    #[test]
    fn test_severity() {
        assert_eq!(severity_of("FATAL: disk gone"), Severity::Critical);
        assert_eq!(severity_of("Unhandled exception"), Severity::High);
        assert_eq!(severity_of("operation timeout"), Severity::Medium);
        assert_eq!(severity_of("slow response"), Severity::Low);
        assert!(Severity::Critical > Severity::Low);
    }

    #[test]
    fn test_trend_thresholds() {
        assert_eq!(Trend::from_frequency(1), Trend::Decreasing);
        assert_eq!(Trend::from_frequency(2), Trend::Decreasing);
        assert_eq!(Trend::from_frequency(3), Trend::Stable);
        assert_eq!(Trend::from_frequency(10), Trend::Stable);
        assert_eq!(Trend::from_frequency(11), Trend::Increasing);
    }

    #[test]
    fn test_message_hash_masks_digits() {
        assert_eq!(
            message_hash("Request 1234 failed on port 80"),
            message_hash("request 98 failed on port 443")
        );
        assert_ne!(message_hash("disk full"), message_hash("disk empty"));
        assert_eq!(message_hash("x").len(), 16);
    }

    #[test]
    fn test_pattern_key_shape() {
        let key = pattern_key(FailureCategory::Network, "Gateway", "socket closed");
        assert!(key.starts_with("network:gateway:"));
        let key = pattern_key(FailureCategory::Unknown, "  ", "x");
        assert!(key.starts_with("unknown:unknown:"));
    }

    #[test]
    fn test_word_overlap() {
        let a = words("connection refused by remote host");
        let b = words("connection refused by proxy");
        let overlap = word_overlap(&a, &b);
        assert!((overlap - 0.5).abs() < 1e-9);
        assert_eq!(word_overlap(&HashSet::new(), &HashSet::new()), 0.0);
    }
}
