#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    CancellationSignal, Handler, HandlerConfig, HandlerRegistry, HandlerResult, HandlerType,
    Request, RetryPolicy, StaticConfigProvider, SwitchyardResult,
};
use switchyard_orchestrator::{
    Dispatcher, Orchestrator, Outcome, Priority, QueueConfig, QueueState, SwitchyardEvent,
    WorkflowState,
};
use switchyard_recovery::{FailureCategory, FailureInfo, FailureTracker, FailureTrackerConfig};
use switchyard_routing::RoutingEngine;
use uuid::Uuid;

/// Records every prompt it sees. Prompts containing "boom" fail until the
/// handler is marked healthy.
struct Recorder {
    healthy: AtomicBool,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Handler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn handler_type(&self) -> HandlerType {
        HandlerType::Generic
    }

    fn can_handle(&self, _request: &Request) -> bool {
        true
    }

    async fn handle(
        &self,
        request: &Request,
        _cancel: &CancellationSignal,
    ) -> SwitchyardResult<HandlerResult> {
        self.seen.lock().push(request.prompt.clone());
        if request.prompt.contains("boom") && !self.healthy.load(Ordering::SeqCst) {
            return Ok(HandlerResult::failure(
                "exploded",
                "invalid state in database transaction",
            ));
        }
        Ok(HandlerResult::success("handled").with_content(request.prompt.to_uppercase()))
    }
}

fn setup(tracker_config: FailureTrackerConfig) -> (Dispatcher, Arc<Recorder>) {
    let recorder = Arc::new(Recorder {
        healthy: AtomicBool::new(false),
        seen: Mutex::new(Vec::new()),
    });
    let registry = HandlerRegistry::new();
    registry.register(recorder.clone());

    let config = StaticConfigProvider::new(HandlerConfig {
        retry_policy: RetryPolicy::none(),
        ..HandlerConfig::default()
    });
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        Arc::new(config),
        RoutingEngine::with_default_rules(),
        Arc::new(FailureTracker::new(tracker_config)),
    );
    let queue_config = QueueConfig {
        max_concurrent: 1,
        idle_poll_ms: 10,
        ..QueueConfig::default()
    };
    (
        Dispatcher::new(Arc::new(orchestrator), &queue_config),
        recorder,
    )
}

async fn wait_terminal(dispatcher: &Dispatcher, ids: &[Uuid]) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !ids.iter().all(|id| {
            dispatcher
                .request_status(*id)
                .is_some_and(|s| s.is_terminal())
        }) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("items did not finish in time");
}

#[tokio::test]
async fn test_submit_runs_to_completion() {
    let (dispatcher, _recorder) = setup(FailureTrackerConfig::default());
    let (_sub, mut events) = dispatcher.events().subscribe_channel();
    dispatcher.start().await.unwrap();

    let receipt = dispatcher
        .submit(Request::new("explain this function"), Priority::Normal)
        .unwrap();
    wait_terminal(&dispatcher, &[receipt.item_id]).await;

    assert_eq!(
        dispatcher.request_status(receipt.item_id),
        Some(QueueState::Completed)
    );
    let result = dispatcher.result(receipt.item_id).unwrap();
    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(result.content.as_deref(), Some("EXPLAIN THIS FUNCTION"));
    assert_eq!(result.handler_name.as_deref(), Some("recorder"));

    let status = dispatcher.status(&receipt.workflow_id).unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.completed, 1);

    let stats = dispatcher.statistics();
    assert_eq!(stats.total_enqueued, 1);
    assert_eq!(stats.processed, 1);

    let mut states = Vec::new();
    while states.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let SwitchyardEvent::StatusChanged { item_id, state, .. } = event {
            if item_id == receipt.item_id {
                states.push(state);
            }
        }
    }
    assert_eq!(
        states,
        vec![
            QueueState::Pending,
            QueueState::InProgress,
            QueueState::Completed
        ]
    );

    dispatcher.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_priority_order_with_single_worker() {
    let (dispatcher, recorder) = setup(FailureTrackerConfig::default());
    let ids = vec![
        dispatcher.submit(Request::new("low one"), Priority::Low).unwrap().item_id,
        dispatcher.submit(Request::new("normal one"), Priority::Normal).unwrap().item_id,
        dispatcher.submit(Request::new("critical one"), Priority::Critical).unwrap().item_id,
        dispatcher.submit(Request::new("normal two"), Priority::Normal).unwrap().item_id,
        dispatcher.submit(Request::new("high one"), Priority::High).unwrap().item_id,
    ];

    dispatcher.start().await.unwrap();
    wait_terminal(&dispatcher, &ids).await;

    assert_eq!(
        *recorder.seen.lock(),
        vec!["critical one", "high one", "normal one", "normal two", "low one"]
    );
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_item_never_runs() {
    let (dispatcher, recorder) = setup(FailureTrackerConfig::default());
    let keep = dispatcher.submit(Request::new("keep me"), Priority::Normal).unwrap();
    let dropped = dispatcher.submit(Request::new("drop me"), Priority::Normal).unwrap();

    assert!(dispatcher.cancel(dropped.item_id));
    assert!(!dispatcher.cancel(dropped.item_id));
    assert_eq!(
        dispatcher.request_status(dropped.item_id),
        Some(QueueState::Cancelled)
    );

    dispatcher.start().await.unwrap();
    wait_terminal(&dispatcher, &[keep.item_id]).await;
    assert!(!dispatcher.cancel(keep.item_id));
    assert_eq!(*recorder.seen.lock(), vec!["keep me"]);
    assert!(dispatcher.result(dropped.item_id).is_none());
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_requeues_only_the_workflows_failed_items() {
    let (dispatcher, recorder) = setup(FailureTrackerConfig::default());
    dispatcher.start().await.unwrap();

    let mut batch = Vec::new();
    for (prompt, priority) in [
        ("boom one", Priority::High),
        ("fine", Priority::Normal),
        ("boom two", Priority::Low),
        ("boom three", Priority::Normal),
    ] {
        batch.push(
            dispatcher
                .submit_to_workflow("wf-a", Request::new(prompt), priority)
                .unwrap(),
        );
    }
    let other = dispatcher
        .submit_to_workflow("wf-b", Request::new("boom elsewhere"), Priority::Normal)
        .unwrap();

    let mut all: Vec<Uuid> = batch.iter().map(|r| r.item_id).collect();
    all.push(other.item_id);
    wait_terminal(&dispatcher, &all).await;

    let status = dispatcher.status("wf-a").unwrap();
    assert_eq!(status.failed, 3);
    assert_eq!(status.completed, 1);
    assert_eq!(status.state, WorkflowState::Failed);
    let failed = dispatcher.result(batch[0].item_id).unwrap();
    assert_eq!(failed.outcome, Outcome::Failed);

    recorder.healthy.store(true, Ordering::SeqCst);
    let requeued = dispatcher.retry_failed("wf-a");
    assert_eq!(requeued.len(), 3);
    for id in &requeued {
        let item = dispatcher.item(*id).unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.workflow_id.as_deref(), Some("wf-a"));
    }
    assert_eq!(dispatcher.item(batch[0].item_id).unwrap().priority, Priority::High);
    assert_eq!(dispatcher.item(batch[2].item_id).unwrap().priority, Priority::Low);
    assert!(!requeued.contains(&batch[1].item_id));

    wait_terminal(&dispatcher, &requeued).await;
    assert_eq!(dispatcher.status("wf-a").unwrap().state, WorkflowState::Completed);

    let untouched = dispatcher.item(other.item_id).unwrap();
    assert!(matches!(untouched.state, QueueState::Failed { .. }));
    assert_eq!(untouched.retry_count, 0);

    assert!(dispatcher.retry_failed("wf-a").is_empty());
    assert_eq!(dispatcher.statistics().retried, 3);
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failures_feed_report_and_suggestions() {
    let (dispatcher, _recorder) = setup(FailureTrackerConfig::default());
    dispatcher.start().await.unwrap();
    let from = chrono::Utc::now() - chrono::Duration::minutes(1);

    let ids: Vec<Uuid> = (0..3)
        .map(|_| {
            dispatcher
                .submit(Request::new("boom"), Priority::Normal)
                .unwrap()
                .item_id
        })
        .collect();
    wait_terminal(&dispatcher, &ids).await;

    let report = dispatcher.failure_report(from, chrono::Utc::now() + chrono::Duration::minutes(1));
    assert_eq!(report.total_failures, 3);
    assert_eq!(report.by_component.get("recorder"), Some(&3));
    assert_eq!(report.top_patterns[0].frequency, 3);

    let info = FailureInfo::new("exploded: invalid state in database transaction", "recorder");
    assert_eq!(info.category(), FailureCategory::Database);
    let suggestions = dispatcher.recovery_suggestions(&info);
    assert!(!suggestions.is_empty());
    assert!(suggestions
        .windows(2)
        .all(|w| w[0].success_rate >= w[1].success_rate));

    let diagnosis = dispatcher.diagnose(&info);
    assert_eq!(diagnosis.occurrences, 3);
    assert!(!diagnosis.similar_failures.is_empty());
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_written_on_shutdown_and_restored_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("failures.json");
    let config = FailureTrackerConfig {
        snapshot_path: Some(path.clone()),
        ..FailureTrackerConfig::default()
    };

    let (first, _) = setup(config.clone());
    first.start().await.unwrap();
    let receipt = first.submit(Request::new("boom"), Priority::Normal).unwrap();
    wait_terminal(&first, &[receipt.item_id]).await;
    first.shutdown().await.unwrap();
    assert!(path.exists());

    let (second, _) = setup(config);
    second.start().await.unwrap();
    assert_eq!(second.orchestrator().tracker().pattern_count(), 1);
    assert_eq!(second.orchestrator().tracker().record_count(), 1);
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_purge_forgets_finished_items_and_results() {
    let (dispatcher, _recorder) = setup(FailureTrackerConfig::default());
    dispatcher.start().await.unwrap();

    let done = dispatcher
        .submit(Request::new("explain this"), Priority::Normal)
        .unwrap();
    wait_terminal(&dispatcher, &[done.item_id]).await;
    assert!(dispatcher.result(done.item_id).is_some());

    assert_eq!(dispatcher.purge_finished(Duration::from_secs(3600)), 0);
    assert_eq!(dispatcher.purge_finished(Duration::ZERO), 1);
    assert!(dispatcher.request_status(done.item_id).is_none());
    assert!(dispatcher.result(done.item_id).is_none());
    assert!(dispatcher.status(&done.workflow_id).is_none());
    assert_eq!(dispatcher.statistics().processed, 1);

    dispatcher.shutdown().await.unwrap();
}
