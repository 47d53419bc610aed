use crate::heuristics::FailureCategory;
use crate::heuristics::FailureCategory as C;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// How disruptive applying a strategy is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Safe to run unattended.
    Low,
    /// May briefly degrade service.
    Medium,
    /// May cause an outage or data changes.
    High,
}

/// A catalogued remediation procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    /// Unique strategy name.
    pub name: String,
    /// What the strategy does.
    pub description: String,
    /// Categories it applies to; `Unknown` applies to all.
    pub categories: Vec<FailureCategory>,
    /// Ordered remediation steps.
    pub steps: Vec<String>,
    /// Historical success rate in [0, 1].
    pub success_rate: f64,
    /// Typical time to apply.
    pub estimated_duration_secs: u64,
    /// How disruptive it is.
    pub risk: RiskLevel,
    /// Can run unattended.
    pub automatic: bool,
    /// Conditions to check before applying.
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl RecoveryStrategy {
    /// Whether the strategy applies to a failure category.
    pub fn applies_to(&self, category: FailureCategory) -> bool {
        self.categories.contains(&category) || self.categories.contains(&FailureCategory::Unknown)
    }
}

struct Seed {
    name: &'static str,
    description: &'static str,
    categories: &'static [FailureCategory],
    steps: &'static [&'static str],
    success_rate: f64,
    duration: u64,
    risk: RiskLevel,
    automatic: bool,
    prerequisites: &'static [&'static str],
}

const SEEDS: &[Seed] = &[
    Seed {
        name: "retry_with_backoff",
        description: "Retry the operation with exponential backoff",
        categories: &[C::Network, C::Timeout],
        steps: &[
            "Wait for the initial backoff delay",
            "Retry the failed operation",
            "Double the delay on each further failure up to the cap",
        ],
        success_rate: 0.85,
        duration: 30,
        risk: RiskLevel::Low,
        automatic: true,
        prerequisites: &["Operation is idempotent"],
    },
    Seed {
        name: "circuit_breaker",
        description: "Stop calling the failing dependency until it recovers",
        categories: &[C::Network, C::Timeout, C::Database],
        steps: &[
            "Open the circuit for the failing dependency",
            "Serve degraded responses while open",
            "Probe with a single request after the cool-down",
        ],
        success_rate: 0.75,
        duration: 60,
        risk: RiskLevel::Medium,
        automatic: true,
        prerequisites: &[],
    },
    Seed {
        name: "increase_timeout",
        description: "Raise the timeout for slow but healthy operations",
        categories: &[C::Timeout],
        steps: &[
            "Measure the observed latency",
            "Raise the timeout above the p99 latency",
            "Retry the operation",
        ],
        success_rate: 0.7,
        duration: 10,
        risk: RiskLevel::Low,
        automatic: true,
        prerequisites: &[],
    },
    Seed {
        name: "release_memory",
        description: "Free caches and reduce batch sizes",
        categories: &[C::Memory],
        steps: &[
            "Clear in-process caches",
            "Reduce batch or buffer sizes",
            "Retry the operation",
        ],
        success_rate: 0.6,
        duration: 20,
        risk: RiskLevel::Medium,
        automatic: true,
        prerequisites: &[],
    },
    Seed {
        name: "restart_component",
        description: "Restart the failing component",
        categories: &[C::Memory, C::Unknown],
        steps: &[
            "Drain in-flight work",
            "Stop the component",
            "Start the component and verify health",
        ],
        success_rate: 0.65,
        duration: 120,
        risk: RiskLevel::High,
        automatic: true,
        prerequisites: &["Component supports restart"],
    },
    Seed {
        name: "add_null_checks",
        description: "Guard the dereference that produced the null reference",
        categories: &[C::NullReference],
        steps: &[
            "Locate the dereference from the stack trace",
            "Add a null guard or default value",
            "Add a regression test",
        ],
        success_rate: 0.9,
        duration: 300,
        risk: RiskLevel::Low,
        automatic: false,
        prerequisites: &["Stack trace available"],
    },
    Seed {
        name: "validate_arguments",
        description: "Validate inputs before the failing call",
        categories: &[C::Argument],
        steps: &[
            "Identify the rejected argument",
            "Add input validation at the boundary",
            "Return a descriptive error to the caller",
        ],
        success_rate: 0.88,
        duration: 240,
        risk: RiskLevel::Low,
        automatic: false,
        prerequisites: &[],
    },
    Seed {
        name: "verify_file_paths",
        description: "Check that referenced files and directories exist and are accessible",
        categories: &[C::FileSystem],
        steps: &[
            "Resolve the path against the working directory",
            "Create missing directories",
            "Check read/write permissions",
        ],
        success_rate: 0.8,
        duration: 30,
        risk: RiskLevel::Low,
        automatic: true,
        prerequisites: &[],
    },
    Seed {
        name: "reconnect_database",
        description: "Reset the database connection pool",
        categories: &[C::Database],
        steps: &[
            "Close broken pooled connections",
            "Re-establish the pool",
            "Retry the transaction",
        ],
        success_rate: 0.7,
        duration: 45,
        risk: RiskLevel::Medium,
        automatic: true,
        prerequisites: &["Transaction can be retried"],
    },
    Seed {
        name: "refresh_credentials",
        description: "Rotate or refresh expired credentials",
        categories: &[C::Security],
        steps: &[
            "Check credential expiry",
            "Refresh the token or rotate the secret",
            "Verify access with a read-only call",
        ],
        success_rate: 0.6,
        duration: 600,
        risk: RiskLevel::High,
        automatic: false,
        prerequisites: &["Operator access to the secret store"],
    },
    Seed {
        name: "reload_configuration",
        description: "Reload configuration and validate required keys",
        categories: &[C::Configuration],
        steps: &[
            "Validate the configuration file",
            "Fill in missing keys",
            "Reload the component configuration",
        ],
        success_rate: 0.75,
        duration: 60,
        risk: RiskLevel::Medium,
        automatic: true,
        prerequisites: &[],
    },
    Seed {
        name: "escalate_to_operator",
        description: "Hand the failure to a human operator",
        categories: &[C::Unknown],
        steps: &[
            "Collect logs and the failure record",
            "Open an incident",
            "Notify the on-call operator",
        ],
        success_rate: 0.5,
        duration: 1800,
        risk: RiskLevel::Low,
        automatic: false,
        prerequisites: &[],
    },
];

/// Thread-safe recovery strategy catalog.
pub struct RecoveryCatalog {
    strategies: RwLock<Vec<RecoveryStrategy>>,
}

impl RecoveryCatalog {
    /// Catalog seeded with the built-in strategies.
    pub fn new() -> Self {
        let strategies = SEEDS
            .iter()
            .map(|s| RecoveryStrategy {
                name: s.name.to_string(),
                description: s.description.to_string(),
                categories: s.categories.to_vec(),
                steps: s.steps.iter().map(|x| (*x).to_string()).collect(),
                success_rate: s.success_rate,
                estimated_duration_secs: s.duration,
                risk: s.risk,
                automatic: s.automatic,
                prerequisites: s.prerequisites.iter().map(|x| (*x).to_string()).collect(),
            })
            .collect();
        Self::from_strategies(strategies)
    }

    /// Catalog holding exactly `strategies`.
    pub fn from_strategies(strategies: Vec<RecoveryStrategy>) -> Self {
        Self {
            strategies: RwLock::new(strategies),
        }
    }

    /// Add a strategy, replacing any with the same name.
    pub fn register(&self, strategy: RecoveryStrategy) {
        let mut strategies = self.strategies.write();
        strategies.retain(|s| s.name != strategy.name);
        strategies.push(strategy);
    }

    /// Strategy by name.
    pub fn get(&self, name: &str) -> Option<RecoveryStrategy> {
        self.strategies.read().iter().find(|s| s.name == name).cloned()
    }

    /// Every strategy, in catalog order.
    pub fn strategies(&self) -> Vec<RecoveryStrategy> {
        self.strategies.read().clone()
    }

    /// Applicable strategies, highest success rate first; ties by name.
    pub fn suggest(&self, category: FailureCategory) -> Vec<RecoveryStrategy> {
        let mut matching: Vec<RecoveryStrategy> = self
            .strategies
            .read()
            .iter()
            .filter(|s| s.applies_to(category))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        matching
    }

    /// Exponentially smooth a strategy's success rate toward the outcome.
    /// Returns the new rate, or `None` for an unknown strategy.
    pub fn record_outcome(&self, name: &str, success: bool, alpha: f64) -> Option<f64> {
        let alpha = alpha.clamp(0.0, 1.0);
        let mut strategies = self.strategies.write();
        let strategy = strategies.iter_mut().find(|s| s.name == name)?;
        let target = if success { 1.0 } else { 0.0 };
        strategy.success_rate = (1.0 - alpha) * strategy.success_rate + alpha * target;
        debug!(strategy = name, success_rate = strategy.success_rate, "Strategy success rate updated");
        Some(strategy.success_rate)
    }
}

impl Default for RecoveryCatalog {
    fn default() -> Self {
        Self::new()
    }
}
