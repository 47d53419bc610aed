use crate::monitor::HandlerMonitor;
use crate::retry::{retry_with_backoff, Retried};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::{
    CancellationSignal, ConfigurationProvider, Handler, HandlerConfig, HandlerResult, Request,
    SwitchyardError, SwitchyardResult,
};
use switchyard_recovery::{FailureInfo, FailureTracker};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

/// Invokes handlers under their configured retry policy and timeout.
///
/// Every failed attempt is reported to the failure tracker, including
/// attempts that are later retried successfully. Concurrent invocations of
/// one handler are capped at its `max_concurrent_tasks`; the cap is read
/// the first time a handler is invoked.
pub struct HandlerInvoker {
    config: Arc<dyn ConfigurationProvider>,
    tracker: Arc<FailureTracker>,
    monitor: Arc<HandlerMonitor>,
    slots: DashMap<String, Arc<Semaphore>>,
}

impl HandlerInvoker {
    /// Create an invoker reading per-handler settings from `config`.
    pub fn new(
        config: Arc<dyn ConfigurationProvider>,
        tracker: Arc<FailureTracker>,
        monitor: Arc<HandlerMonitor>,
    ) -> Self {
        Self {
            config,
            tracker,
            monitor,
            slots: DashMap::new(),
        }
    }

    /// Metrics recorded for every invocation.
    pub fn monitor(&self) -> &Arc<HandlerMonitor> {
        &self.monitor
    }

    /// Tracker receiving every failed attempt.
    pub fn tracker(&self) -> &Arc<FailureTracker> {
        &self.tracker
    }

    /// Invocation slots still free for a handler, if it has been invoked.
    pub fn available_slots(&self, handler: &str) -> Option<usize> {
        self.slots.get(handler).map(|s| s.available_permits())
    }

    /// Run a handler to completion. Unsuccessful handler results come back
    /// as errors so callers see a single failure path.
    pub async fn invoke(
        &self,
        handler: &Arc<dyn Handler>,
        request: &Request,
        cancel: &CancellationSignal,
    ) -> Retried<HandlerResult> {
        let name = handler.name().to_string();
        let config = self.config.handler_config(&name);
        let _in_flight = self.monitor.begin();
        let _slot = match self.acquire_slot(&name, &config, cancel).await {
            Ok(permit) => permit,
            Err(e) => {
                info!(request_id = %request.id, handler = %name, "Cancelled while waiting for a handler slot");
                return Retried {
                    result: Err(e),
                    attempts: 0,
                };
            }
        };
        let started = Instant::now();

        let config_ref = &config;
        let handler_ref: &dyn Handler = &**handler;
        let outcome = retry_with_backoff(&config.retry_policy, cancel, &name, move |attempt| {
            self.attempt(handler_ref, request, cancel, config_ref, attempt)
        })
        .await;

        let (success, error) = match &outcome.result {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.monitor
            .record_invocation(&name, success, outcome.attempts, started.elapsed(), error)
            .await;

        match &outcome.result {
            Ok(_) => info!(
                request_id = %request.id,
                handler = %name,
                attempts = outcome.attempts,
                "Handler succeeded"
            ),
            Err(SwitchyardError::Cancelled) => info!(
                request_id = %request.id,
                handler = %name,
                "Handler invocation cancelled"
            ),
            Err(e) => error!(
                request_id = %request.id,
                handler = %name,
                attempts = outcome.attempts,
                error = %e,
                "Handler failed"
            ),
        }
        outcome
    }

    async fn acquire_slot(
        &self,
        name: &str,
        config: &HandlerConfig,
        cancel: &CancellationSignal,
    ) -> SwitchyardResult<OwnedSemaphorePermit> {
        let semaphore = self
            .slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))))
            .clone();
        tokio::select! {
            permit = semaphore.acquire_owned() => permit.map_err(|_| {
                SwitchyardError::Internal(format!("slot pool for handler '{name}' closed"))
            }),
            _ = cancel.cancelled() => Err(SwitchyardError::Cancelled),
        }
    }

    async fn attempt(
        &self,
        handler: &dyn Handler,
        request: &Request,
        cancel: &CancellationSignal,
        config: &HandlerConfig,
        attempt: u32,
    ) -> SwitchyardResult<HandlerResult> {
        debug!(request_id = %request.id, handler = handler.name(), attempt, "Invoking handler");

        let call = handler.handle(request, cancel);
        let guarded = async {
            match config.timeout() {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.monitor.record_timeout(handler.name()).await;
                        Err(SwitchyardError::TransientHandler(format!(
                            "handler '{}' timed out after {} ms",
                            handler.name(),
                            config.timeout_ms
                        )))
                    }
                },
                None => call.await,
            }
        };

        let result = tokio::select! {
            result = guarded => result,
            _ = cancel.cancelled() => Err(SwitchyardError::Cancelled),
        };

        let failure = match result {
            Ok(hr) if hr.success => {
                return Ok(hr.with_handler(handler.name()));
            }
            Ok(hr) => hr.failure_text(),
            Err(SwitchyardError::Cancelled) => return Err(SwitchyardError::Cancelled),
            Err(SwitchyardError::TransientHandler(msg)) => {
                self.track(handler, request, &msg);
                return Err(SwitchyardError::TransientHandler(msg));
            }
            Err(e) => e.to_string(),
        };

        self.track(handler, request, &failure);
        if config.is_retryable(&failure) {
            Err(SwitchyardError::TransientHandler(failure))
        } else {
            Err(SwitchyardError::Handler(failure))
        }
    }

    fn track(&self, handler: &dyn Handler, request: &Request, message: &str) {
        let info = FailureInfo::new(message, handler.name())
            .with_request(request.id)
            .with_context("handler_type", serde_json::json!(handler.handler_type().as_str()));
        self.tracker.track(&info);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use switchyard_core::{CancellationSource, HandlerType, RetryPolicy, StaticConfigProvider};

    /// Fails with `error` for the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        error: &'static str,
        calls: AtomicU32,
        delay: Duration,
    }

    impl Flaky {
        fn new(failures: u32, error: &'static str) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Handler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn handler_type(&self) -> HandlerType {
            HandlerType::Fixer
        }

        fn can_handle(&self, _request: &Request) -> bool {
            true
        }

        async fn handle(
            &self,
            _request: &Request,
            _cancel: &CancellationSignal,
        ) -> SwitchyardResult<HandlerResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.failures {
                Ok(HandlerResult::failure("call failed", self.error))
            } else {
                Ok(HandlerResult::success("fixed").with_content("patch"))
            }
        }
    }

    fn invoker(config: HandlerConfig) -> HandlerInvoker {
        HandlerInvoker::new(
            Arc::new(StaticConfigProvider::new(config)),
            Arc::new(FailureTracker::default()),
            Arc::new(HandlerMonitor::new()),
        )
    }

    fn fast_config() -> HandlerConfig {
        HandlerConfig {
            retry_policy: RetryPolicy {
                max_retries: 3,
                backoff_base_ms: 1,
                backoff_max_ms: 2,
                jitter: false,
            },
            ..HandlerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_transient_failures_retried_and_tracked() {
        let inv = invoker(fast_config());
        let flaky = Arc::new(Flaky::new(2, "503 Service Unavailable"));
        let handler: Arc<dyn Handler> = flaky.clone();

        let out = inv
            .invoke(&handler, &Request::new("fix"), &CancellationSignal::never())
            .await;
        let result = out.result.unwrap();
        assert!(result.success);
        assert_eq!(result.handler_name.as_deref(), Some("flaky"));
        assert_eq!(out.attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        // Both failed attempts are recorded even though the call succeeded.
        assert_eq!(inv.tracker().record_count(), 2);

        let metrics = inv.monitor().get("flaky").await.unwrap();
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let inv = invoker(fast_config());
        let flaky = Arc::new(Flaky::new(5, "invalid syntax"));
        let handler: Arc<dyn Handler> = flaky.clone();

        let out = inv
            .invoke(&handler, &Request::new("fix"), &CancellationSignal::never())
            .await;
        assert!(matches!(out.result, Err(SwitchyardError::Handler(_))));
        assert_eq!(out.attempts, 1);
        assert_eq!(inv.tracker().record_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let config = HandlerConfig {
            timeout_ms: 10,
            retry_policy: RetryPolicy {
                max_retries: 1,
                backoff_base_ms: 1,
                backoff_max_ms: 1,
                jitter: false,
            },
            ..HandlerConfig::default()
        };
        let inv = invoker(config);
        let mut slow = Flaky::new(0, "");
        slow.delay = Duration::from_millis(200);
        let handler: Arc<dyn Handler> = Arc::new(slow);

        let out = inv
            .invoke(&handler, &Request::new("fix"), &CancellationSignal::never())
            .await;
        assert_eq!(out.attempts, 2);
        match out.result {
            Err(SwitchyardError::Handler(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(inv.monitor().get("flaky").await.unwrap().timeouts, 2);
    }

    #[tokio::test]
    async fn test_cancel_during_call() {
        let inv = invoker(fast_config());
        let mut slow = Flaky::new(0, "");
        slow.delay = Duration::from_secs(30);
        let handler: Arc<dyn Handler> = Arc::new(slow);
        let source = CancellationSource::new();
        let signal = source.signal();

        let cancel_later = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            source.cancel();
        };
        let request = Request::new("fix");
        let (out, _) = tokio::join!(
            inv.invoke(&handler, &request, &signal),
            cancel_later
        );
        assert!(matches!(out.result, Err(SwitchyardError::Cancelled)));
        assert_eq!(inv.tracker().record_count(), 0);
        assert_eq!(inv.monitor().in_flight(), 0);
    }

    /// Records the highest number of overlapping calls.
    #[derive(Default)]
    struct Overlap {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Overlap {
        fn name(&self) -> &str {
            "overlap"
        }

        fn handler_type(&self) -> HandlerType {
            HandlerType::Generic
        }

        fn can_handle(&self, _request: &Request) -> bool {
            true
        }

        async fn handle(
            &self,
            _request: &Request,
            _cancel: &CancellationSignal,
        ) -> SwitchyardResult<HandlerResult> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(HandlerResult::success("done"))
        }
    }

    #[tokio::test]
    async fn test_max_concurrent_tasks_serializes_calls() {
        let inv = invoker(HandlerConfig {
            max_concurrent_tasks: 1,
            ..fast_config()
        });
        let overlap = Arc::new(Overlap::default());
        let handler: Arc<dyn Handler> = overlap.clone();
        let never = CancellationSignal::never();
        let (first, second) = (Request::new("one"), Request::new("two"));

        let (a, b) = tokio::join!(
            inv.invoke(&handler, &first, &never),
            inv.invoke(&handler, &second, &never)
        );
        assert!(a.result.unwrap().success);
        assert!(b.result.unwrap().success);
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
        assert_eq!(inv.available_slots("overlap"), Some(1));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_slot() {
        let inv = invoker(HandlerConfig {
            max_concurrent_tasks: 1,
            ..fast_config()
        });
        let mut slow = Flaky::new(0, "");
        slow.delay = Duration::from_millis(100);
        let handler: Arc<dyn Handler> = Arc::new(slow);
        let source = CancellationSource::new();
        let waiting = source.signal();
        let never = CancellationSignal::never();
        let (first, second) = (Request::new("one"), Request::new("two"));

        let cancel_later = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            source.cancel();
        };
        let (held, queued, _) = tokio::join!(
            inv.invoke(&handler, &first, &never),
            inv.invoke(&handler, &second, &waiting),
            cancel_later
        );
        assert!(held.result.is_ok());
        assert!(matches!(queued.result, Err(SwitchyardError::Cancelled)));
        assert_eq!(queued.attempts, 0);
    }
}
