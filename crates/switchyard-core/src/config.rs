use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Retry behaviour for transient handler failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Randomize each delay within [50%, 100%] of the computed value.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff for the given zero-based retry attempt, capped at
    /// `backoff_max_ms`. Jitter is applied by the caller.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }
}

/// Execution settings for one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Backoff applied to transient failures.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Invocations of this handler allowed at once; zero is treated as one.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Per-attempt timeout in milliseconds. Zero disables the timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Case-insensitive substrings that mark a failure as transient.
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_retryable_errors() -> Vec<String> {
    [
        "timeout",
        "timed out",
        "429",
        "500",
        "502",
        "503",
        "504",
        "connection reset",
        "connection refused",
        "temporarily unavailable",
        "rate limit",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            timeout_ms: default_timeout_ms(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl HandlerConfig {
    /// Per-attempt timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Whether a failure message matches the retryable allowlist.
    pub fn is_retryable(&self, failure: &str) -> bool {
        let lower = failure.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }
}

/// Source of per-handler execution settings.
pub trait ConfigurationProvider: Send + Sync {
    /// Effective settings for `handler_name`.
    fn handler_config(&self, handler_name: &str) -> HandlerConfig;
}

/// Configuration provider backed by a default plus per-handler overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfigProvider {
    /// Settings for handlers without an override.
    #[serde(default)]
    pub default: HandlerConfig,
    /// Per-handler settings keyed by handler name.
    #[serde(default)]
    pub overrides: HashMap<String, HandlerConfig>,
}

impl StaticConfigProvider {
    /// Provider that returns `default` for every handler.
    pub fn new(default: HandlerConfig) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Use `config` for the named handler.
    pub fn with_override(mut self, handler_name: impl Into<String>, config: HandlerConfig) -> Self {
        self.overrides.insert(handler_name.into(), config);
        self
    }
}

impl ConfigurationProvider for StaticConfigProvider {
    fn handler_config(&self, handler_name: &str) -> HandlerConfig {
        self.overrides
            .get(handler_name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
