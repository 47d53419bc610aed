use rand::Rng;
use std::future::Future;
use std::time::Duration;
use switchyard_core::{CancellationSignal, RetryPolicy, SwitchyardError, SwitchyardResult};
use tracing::{info, warn};

/// Apply jitter to a computed delay: a uniform value in [delay/2, delay].
pub fn jittered(delay_ms: u64, jitter: bool) -> u64 {
    if !jitter || delay_ms < 2 {
        return delay_ms;
    }
    rand::thread_rng().gen_range(delay_ms / 2..=delay_ms)
}

/// Result of a retried operation plus the number of attempts made.
#[derive(Debug)]
pub struct Retried<T> {
    /// Final outcome.
    pub result: SwitchyardResult<T>,
    /// Attempts made; zero if cancelled before the first.
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's retries are used up.
///
/// Only [`SwitchyardError::TransientHandler`] is retried. A transient error
/// on the last attempt becomes [`SwitchyardError::Handler`]. Cancellation is
/// checked before every attempt and interrupts backoff sleeps, yielding
/// [`SwitchyardError::Cancelled`].
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationSignal,
    label: &str,
    mut op: F,
) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SwitchyardResult<T>>,
{
    let mut attempts = 0;
    for attempt in 0..=policy.max_retries {
        if cancel.is_cancelled() {
            return Retried {
                result: Err(SwitchyardError::Cancelled),
                attempts,
            };
        }
        attempts += 1;

        let err = match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(e) if e.is_transient() => e,
            Err(e) => return Retried { result: Err(e), attempts },
        };

        if attempt == policy.max_retries {
            warn!(target_name = label, attempts, error = %err, "Retries exhausted");
            return Retried {
                result: Err(SwitchyardError::Handler(format!(
                    "retries exhausted after {attempts} attempts: {err}"
                ))),
                attempts,
            };
        }

        let delay = jittered(policy.backoff_ms(attempt), policy.jitter);
        info!(target_name = label, attempt, delay_ms = delay, error = %err, "Transient failure, backing off");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            _ = cancel.cancelled() => {
                return Retried {
                    result: Err(SwitchyardError::Cancelled),
                    attempts,
                };
            }
        }
    }

    // Unreachable: the loop returns on its last iteration.
    Retried {
        result: Err(SwitchyardError::Internal("retry loop ended without a result".into())),
        attempts,
    }
}
