use crate::engine::Orchestrator;
use crate::events::{EventBus, SwitchyardEvent};
use crate::task_queue::{QueueConfig, TaskQueue};
use crate::types::{OrchestratorResult, Outcome, QueueItem};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{CancellationSignal, CancellationSource};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Results of finished queue items, keyed by item id. Entries are evicted
/// together with their queue item.
pub type ResultStore = Arc<DashMap<Uuid, OrchestratorResult>>;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    purge: JoinHandle<()>,
}

/// Everything a spawned orchestration needs.
#[derive(Clone)]
struct Worker {
    queue: Arc<TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    events: Arc<EventBus>,
    results: ResultStore,
    cancel: CancellationSignal,
}

impl Worker {
    async fn process(&self, item: QueueItem) {
        debug!(item = %item.id, priority = %item.priority, "Processing queue item");
        let result = self
            .orchestrator
            .process_with_cancel(&item.request, &self.cancel)
            .await;
        let outcome = result.outcome;
        let reason = result
            .error
            .clone()
            .unwrap_or_else(|| result.message.clone());
        // Stored first so a terminal status always has a result behind it.
        self.results.insert(item.id, result);

        let recorded = match outcome {
            Outcome::Succeeded => self.queue.mark_completed(item.id),
            Outcome::Cancelled => self.queue.mark_cancelled(item.id),
            Outcome::Failed => self.queue.mark_failed(item.id, reason),
            Outcome::Rejected => self.queue.mark_rejected(item.id, reason),
        };
        if !recorded {
            warn!(item = %item.id, "Queue item changed state while processing");
        }
        self.publish(&item);
    }

    fn purge(&self, older_than: Duration) -> usize {
        let purged = self.queue.purge_terminal(older_than);
        for id in &purged {
            self.results.remove(id);
        }
        purged.len()
    }

    fn publish(&self, item: &QueueItem) {
        if let Some(state) = self.queue.status(item.id) {
            self.events.publish(&SwitchyardEvent::StatusChanged {
                item_id: item.id,
                workflow_id: item.workflow_id.clone(),
                state,
            });
        }
    }
}

/// Background loop that drains the task queue into the orchestrator with
/// bounded concurrency.
pub struct QueueScheduler {
    worker: Worker,
    max_concurrent: usize,
    idle_poll: Duration,
    retention: Duration,
    purge_interval: Duration,
    semaphore: Arc<Semaphore>,
    abort: CancellationSource,
    running: parking_lot::Mutex<Option<Running>>,
}

impl QueueScheduler {
    /// Create a stopped scheduler over `queue`, storing results in `results`.
    pub fn new(
        queue: Arc<TaskQueue>,
        orchestrator: Arc<Orchestrator>,
        results: ResultStore,
        config: &QueueConfig,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let abort = CancellationSource::new();
        let events = orchestrator.events().clone();
        Self {
            worker: Worker {
                queue,
                orchestrator,
                events,
                results,
                cancel: abort.signal(),
            },
            max_concurrent,
            idle_poll: Duration::from_millis(config.idle_poll_ms.max(1)),
            retention: config.retention(),
            purge_interval: Duration::from_secs(config.purge_interval_secs.max(1)),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            abort,
            running: parking_lot::Mutex::new(None),
        }
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Remove finished items older than `older_than` from the queue and the
    /// result store. Returns how many were removed.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        self.worker.purge(older_than)
    }

    /// Orchestrations currently executing.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Start the loop. A no-op if already running. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        let mut slot = self.running.lock();
        if slot.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.worker.clone(),
            self.semaphore.clone(),
            self.idle_poll,
            shutdown_rx.clone(),
        ));
        let purge = tokio::spawn(purge_loop(
            self.worker.clone(),
            self.retention,
            self.purge_interval,
            shutdown_rx,
        ));
        *slot = Some(Running {
            shutdown,
            handle,
            purge,
        });
        info!(max_concurrent = self.max_concurrent, "Queue scheduler started");
    }

    /// Stop taking new items and wait for in-flight orchestrations to
    /// finish. Pending items stay queued. Idempotent.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running {
            shutdown,
            handle,
            purge,
        }) = running
        else {
            return;
        };
        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
        if let Err(e) = purge.await {
            warn!(error = %e, "Purge loop ended abnormally");
        }
        // Every permit back means every spawned orchestration returned.
        match self.semaphore.acquire_many(self.max_concurrent as u32).await {
            Ok(_drained) => {}
            Err(e) => warn!(error = %e, "Scheduler semaphore closed during drain"),
        }
        info!("Queue scheduler stopped");
    }

    /// Cancel in-flight orchestrations, then stop.
    pub async fn stop_now(&self) {
        self.abort.cancel();
        self.stop().await;
    }
}

impl Drop for QueueScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.handle.abort();
            running.purge.abort();
        }
    }
}

async fn run_loop(
    worker: Worker,
    semaphore: Arc<Semaphore>,
    idle_poll: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        let Some(item) = worker.queue.dequeue() else {
            drop(permit);
            tokio::select! {
                _ = worker.queue.wait_for_work(idle_poll) => {}
                _ = shutdown_rx.changed() => break,
            }
            continue;
        };

        worker.publish(&item);
        let task_worker = worker.clone();
        tokio::spawn(async move {
            task_worker.process(item).await;
            drop(permit);
        });
    }
    debug!("Scheduler loop exited");
}

async fn purge_loop(
    worker: Worker,
    retention: Duration,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = worker.purge(retention);
                if purged > 0 {
                    debug!(purged, "Finished queue items purged");
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
