use tokio::sync::watch;

/// Owning side of a cancellation pair.
///
/// Cancelling is idempotent. Dropping the source without cancelling leaves
/// every signal permanently un-cancelled.
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    /// A source that has not been cancelled.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A signal observing this source.
    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Request cancellation for every signal.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable read side of a [`CancellationSource`].
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the source
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let source = CancellationSource::new();
        let signal = source.signal();
        assert!(!signal.is_cancelled());
        source.cancel();
        source.cancel();
        assert!(signal.is_cancelled());
        assert!(source.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let source = CancellationSource::new();
        let signal = source.signal();
        let waiter = tokio::spawn(async move { signal.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_stays_pending() {
        let signal = CancellationSignal::never();
        assert!(!signal.is_cancelled());
        let outcome = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_signal_after_cancel_resolves_immediately() {
        let source = CancellationSource::new();
        source.cancel();
        let signal = source.signal();
        tokio::time::timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .unwrap();
    }
}
