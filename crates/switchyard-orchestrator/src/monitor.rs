use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

/// Counters for one handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerMetrics {
    /// Invocations, each counting its retries once.
    pub invocations: u64,
    /// Invocations that ended successfully.
    pub successes: u64,
    /// Invocations that ended in an error, cancellation included.
    pub failures: u64,
    /// Attempts beyond the first.
    pub retries: u64,
    /// Attempts that hit the configured timeout.
    pub timeouts: u64,
    /// Total wall time across invocations.
    pub duration_ms: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// When the most recent invocation finished.
    pub last_invoked_at: Option<DateTime<Utc>>,
}

impl HandlerMetrics {
    /// Share of invocations that succeeded; zero before the first call.
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        self.successes as f64 / self.invocations as f64
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Marks one unit of work as in flight until dropped.
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

/// Counts work in flight and wakes waiters once it drains to zero.
#[derive(Clone, Default)]
pub struct InFlightCounter {
    inner: Arc<InFlight>,
}

impl InFlightCounter {
    /// Create an idle counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of work; it stays counted until the guard drops.
    pub fn begin(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: self.inner.clone(),
        }
    }

    /// Units currently in flight.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Tracks per-handler metrics and the number of invocations in flight.
pub struct HandlerMonitor {
    metrics: Arc<RwLock<HashMap<String, HandlerMetrics>>>,
    in_flight: InFlightCounter,
}

impl HandlerMonitor {
    /// Create a monitor with no recorded handlers.
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            in_flight: InFlightCounter::new(),
        }
    }

    /// Register an invocation as in flight.
    pub fn begin(&self) -> InFlightGuard {
        self.in_flight.begin()
    }

    /// Handler invocations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Resolve once no handler invocation is in flight.
    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await;
    }

    /// Record a finished invocation.
    pub async fn record_invocation(
        &self,
        handler: &str,
        success: bool,
        attempts: u32,
        duration: Duration,
        error: Option<String>,
    ) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(handler.to_string()).or_default();
        entry.invocations += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
            entry.last_error = error;
        }
        entry.retries += u64::from(attempts.saturating_sub(1));
        entry.duration_ms += duration.as_millis() as u64;
        entry.last_invoked_at = Some(Utc::now());
    }

    /// Count one attempt that hit its timeout.
    pub async fn record_timeout(&self, handler: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.entry(handler.to_string()).or_default().timeouts += 1;
    }

    /// Metrics of one handler, if it was ever invoked.
    pub async fn get(&self, handler: &str) -> Option<HandlerMetrics> {
        self.metrics.read().await.get(handler).cloned()
    }

    /// Copy of every handler's metrics.
    pub async fn snapshot(&self) -> HashMap<String, HandlerMetrics> {
        self.metrics.read().await.clone()
    }

    /// Sum over all handlers.
    pub async fn aggregate(&self) -> HandlerMetrics {
        let metrics = self.metrics.read().await;
        let mut total = HandlerMetrics::default();
        for m in metrics.values() {
            total.invocations += m.invocations;
            total.successes += m.successes;
            total.failures += m.failures;
            total.retries += m.retries;
            total.timeouts += m.timeouts;
            total.duration_ms += m.duration_ms;
            if m.last_invoked_at > total.last_invoked_at {
                total.last_invoked_at = m.last_invoked_at;
            }
        }
        total
    }

    /// Per-handler metrics, the aggregate and the in-flight count as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let handlers = self.snapshot().await;
        let aggregate = self.aggregate().await;
        serde_json::json!({
            "handlers": handlers,
            "aggregate": aggregate,
            "in_flight": self.in_flight(),
        })
    }
}

impl Default for HandlerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
