use crate::catalog::{RecoveryCatalog, RecoveryStrategy};
use crate::heuristics::{
    categorize, pattern_key, severity_of, word_overlap, words, FailureCategory, Severity, Trend,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Minimum word overlap for a same-category pattern to count as related.
const RELATED_PATTERN_OVERLAP: f64 = 0.5;

/// A failure as reported by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Request that failed, if any.
    #[serde(default)]
    pub request_id: Option<Uuid>,
    /// Failure message.
    pub message: String,
    /// Exception or error type name, if known. Included in classification.
    #[serde(default)]
    pub error_type: Option<String>,
    /// Stack trace, kept on the record.
    #[serde(default)]
    pub stack_trace: Option<String>,
    /// Component that reported the failure.
    #[serde(default)]
    pub component: String,
    /// Free-form extra detail.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl FailureInfo {
    /// Failure with a message and reporting component.
    pub fn new(message: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            component: component.into(),
            ..Self::default()
        }
    }

    /// Link the failure to a request.
    pub fn with_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Set the error type name.
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Attach a stack trace.
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Add one context value.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Text the category and severity heuristics run over.
    pub(crate) fn classification_text(&self) -> String {
        match &self.error_type {
            Some(t) => format!("{t}: {}", self.message),
            None => self.message.clone(),
        }
    }

    /// Category detected from the error type and message.
    pub fn category(&self) -> FailureCategory {
        categorize(&self.classification_text())
    }

    /// Severity detected from the error type and message.
    pub fn severity(&self) -> Severity {
        severity_of(&self.classification_text())
    }

    /// Key of the pattern this failure folds into.
    pub fn pattern_key(&self) -> String {
        pattern_key(self.category(), &self.component, &self.message)
    }
}

/// One tracked failure. Only the resolution fields change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Record id.
    pub id: Uuid,
    /// When the failure was tracked.
    pub timestamp: DateTime<Utc>,
    /// Request that failed, if any.
    pub request_id: Option<Uuid>,
    /// Detected category.
    pub category: FailureCategory,
    /// Detected severity.
    pub severity: Severity,
    /// Failure message.
    pub message: String,
    /// Stack trace, if reported.
    pub stack_trace: Option<String>,
    /// Reporting component.
    pub component: String,
    /// Primary pattern key.
    pub pattern_key: String,
    /// Primary pattern first, then related patterns.
    pub matched_patterns: Vec<String>,
    /// Best-ranked strategy at the time of tracking.
    pub suggested_recovery: Option<String>,
    /// When the failure was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// How it was resolved.
    pub resolution: Option<String>,
}

impl FailureRecord {
    /// True once `resolve` was called for this record.
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Aggregated, recurring failure signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    /// `category:component:hash` key.
    pub key: String,
    /// Message of the first occurrence.
    pub description: String,
    /// Shared category.
    pub category: FailureCategory,
    /// Highest severity seen for this pattern.
    pub severity: Severity,
    /// Shared component.
    pub component: String,
    /// Occurrences tracked.
    pub frequency: u64,
    /// First occurrence.
    pub first_seen: DateTime<Utc>,
    /// Latest occurrence.
    pub last_seen: DateTime<Utc>,
    /// Trend derived from the frequency.
    pub trend: Trend,
    /// Recovery outcomes reported.
    pub recovery_attempts: u64,
    /// Of those, how many succeeded.
    pub recovery_successes: u64,
}

/// Failure tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureTrackerConfig {
    /// Records and idle patterns older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Period of the background housekeeping task.
    #[serde(default = "default_housekeeping_interval_secs")]
    pub housekeeping_interval_secs: u64,
    /// Minimum score for a past record to count as similar in a diagnosis.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Upper bound on similar failures in a diagnosis.
    #[serde(default = "default_max_similar")]
    pub max_similar: usize,
    /// Weight of the newest outcome when smoothing strategy success rates.
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,
    /// Snapshot written on shutdown, if set.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

fn default_retention_days() -> u32 {
    30
}

fn default_housekeeping_interval_secs() -> u64 {
    300
}

fn default_similarity_threshold() -> f64 {
    0.5
}

fn default_max_similar() -> usize {
    5
}

fn default_smoothing_factor() -> f64 {
    0.1
}

impl Default for FailureTrackerConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            housekeeping_interval_secs: default_housekeeping_interval_secs(),
            similarity_threshold: default_similarity_threshold(),
            max_similar: default_max_similar(),
            smoothing_factor: default_smoothing_factor(),
            snapshot_path: None,
        }
    }
}

/// Outcome of one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingStats {
    /// Records older than the retention window.
    pub records_pruned: usize,
    /// Idle patterns dropped.
    pub patterns_evicted: usize,
    /// Patterns left after the pass.
    pub patterns_remaining: usize,
}

/// Serializable copy of the tracker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Patterns, most frequent first.
    pub patterns: Vec<FailurePattern>,
    /// Records, oldest first.
    pub records: Vec<FailureRecord>,
}

struct Housekeeping {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Records failures, maintains per-pattern statistics and recommends
/// recovery strategies.
///
/// All state lives in concurrent maps; every update is a single-key
/// add-or-update and no lock is held across an await.
pub struct FailureTracker {
    pub(crate) config: FailureTrackerConfig,
    pub(crate) patterns: DashMap<String, FailurePattern>,
    pub(crate) records: DashMap<Uuid, FailureRecord>,
    pub(crate) catalog: RecoveryCatalog,
    housekeeping: parking_lot::Mutex<Option<Housekeeping>>,
}

impl FailureTracker {
    /// Tracker with the built-in recovery catalog.
    pub fn new(config: FailureTrackerConfig) -> Self {
        Self::with_catalog(config, RecoveryCatalog::new())
    }

    /// Tracker with a custom recovery catalog.
    pub fn with_catalog(config: FailureTrackerConfig, catalog: RecoveryCatalog) -> Self {
        Self {
            config,
            patterns: DashMap::new(),
            records: DashMap::new(),
            catalog,
            housekeeping: parking_lot::Mutex::new(None),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &FailureTrackerConfig {
        &self.config
    }

    /// Recovery catalog consulted for suggestions.
    pub fn catalog(&self) -> &RecoveryCatalog {
        &self.catalog
    }

    /// Record a failure and fold it into its pattern.
    pub fn track(&self, info: &FailureInfo) -> FailureRecord {
        let now = Utc::now();
        let text = info.classification_text();
        let category = categorize(&text);
        let severity = severity_of(&text);
        let key = pattern_key(category, &info.component, &info.message);

        // The entry guard must be released before iterating the map below.
        let frequency = {
            let mut pattern = self
                .patterns
                .entry(key.clone())
                .or_insert_with(|| FailurePattern {
                    key: key.clone(),
                    description: info.message.clone(),
                    category,
                    severity,
                    component: info.component.clone(),
                    frequency: 0,
                    first_seen: now,
                    last_seen: now,
                    trend: Trend::Decreasing,
                    recovery_attempts: 0,
                    recovery_successes: 0,
                });
            pattern.frequency += 1;
            pattern.last_seen = now;
            pattern.severity = pattern.severity.max(severity);
            pattern.trend = Trend::from_frequency(pattern.frequency);
            pattern.frequency
        };

        let mut matched_patterns = vec![key.clone()];
        matched_patterns.extend(self.related_patterns(&key, category, &info.message));

        let suggested_recovery = self.catalog.suggest(category).into_iter().next().map(|s| s.name);

        let record = FailureRecord {
            id: Uuid::new_v4(),
            timestamp: now,
            request_id: info.request_id,
            category,
            severity,
            message: info.message.clone(),
            stack_trace: info.stack_trace.clone(),
            component: info.component.clone(),
            pattern_key: key.clone(),
            matched_patterns,
            suggested_recovery,
            resolved_at: None,
            resolution: None,
        };
        self.records.insert(record.id, record.clone());

        warn!(
            pattern = %key,
            category = %category,
            severity = %severity,
            frequency,
            component = %info.component,
            "Failure tracked"
        );
        record
    }

    fn related_patterns(&self, primary: &str, category: FailureCategory, message: &str) -> Vec<String> {
        let message_words = words(message);
        let mut related: Vec<String> = self
            .patterns
            .iter()
            .filter(|p| p.key != primary && p.category == category)
            .filter(|p| word_overlap(&words(&p.description), &message_words) >= RELATED_PATTERN_OVERLAP)
            .map(|p| p.key.clone())
            .collect();
        related.sort();
        related
    }

    /// Applicable strategies for a failure, highest success rate first.
    pub fn suggest_recovery(&self, info: &FailureInfo) -> Vec<RecoveryStrategy> {
        self.catalog.suggest(info.category())
    }

    /// Mark a record resolved. Resolution is set once.
    pub fn resolve(&self, record_id: Uuid, resolution: impl Into<String>) -> SwitchyardResult<FailureRecord> {
        let mut record = self
            .records
            .get_mut(&record_id)
            .ok_or_else(|| SwitchyardError::Validation(format!("Unknown failure record {record_id}")))?;
        if record.is_resolved() {
            return Err(SwitchyardError::Validation(format!(
                "Failure record {record_id} is already resolved"
            )));
        }
        record.resolved_at = Some(Utc::now());
        record.resolution = Some(resolution.into());
        info!(record = %record_id, pattern = %record.pattern_key, "Failure resolved");
        Ok(record.clone())
    }

    /// Feed back the outcome of applying a strategy. Returns the strategy's
    /// new success rate.
    pub fn record_recovery_outcome(
        &self,
        strategy: &str,
        pattern_key: Option<&str>,
        success: bool,
    ) -> SwitchyardResult<f64> {
        let rate = self
            .catalog
            .record_outcome(strategy, success, self.config.smoothing_factor)
            .ok_or_else(|| SwitchyardError::Validation(format!("Unknown recovery strategy '{strategy}'")))?;

        if let Some(key) = pattern_key {
            match self.patterns.get_mut(key) {
                Some(mut pattern) => {
                    pattern.recovery_attempts += 1;
                    if success {
                        pattern.recovery_successes += 1;
                    }
                }
                None => warn!(pattern = key, "Recovery outcome for unknown pattern"),
            }
        }
        Ok(rate)
    }

    /// Pattern by key.
    pub fn pattern(&self, key: &str) -> Option<FailurePattern> {
        self.patterns.get(key).map(|p| p.clone())
    }

    /// All patterns, most frequent first.
    pub fn patterns(&self) -> Vec<FailurePattern> {
        let mut patterns: Vec<FailurePattern> = self.patterns.iter().map(|p| p.clone()).collect();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.key.cmp(&b.key)));
        patterns
    }

    /// Record by id.
    pub fn record(&self, id: Uuid) -> Option<FailureRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<FailureRecord> {
        let mut records: Vec<FailureRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.timestamp);
        records
    }

    /// Number of patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Number of records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Prune records past retention, evict patterns not seen within
    /// retention and recompute every remaining trend.
    pub fn run_housekeeping(&self) -> HousekeepingStats {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));

        let records_before = self.records.len();
        self.records.retain(|_, r| r.timestamp >= cutoff);
        let patterns_before = self.patterns.len();
        self.patterns.retain(|_, p| p.last_seen >= cutoff);

        for mut pattern in self.patterns.iter_mut() {
            pattern.trend = Trend::from_frequency(pattern.frequency);
        }

        let stats = HousekeepingStats {
            records_pruned: records_before.saturating_sub(self.records.len()),
            patterns_evicted: patterns_before.saturating_sub(self.patterns.len()),
            patterns_remaining: self.patterns.len(),
        };
        debug!(
            records_pruned = stats.records_pruned,
            patterns_evicted = stats.patterns_evicted,
            patterns_remaining = stats.patterns_remaining,
            "Failure housekeeping completed"
        );
        stats
    }

    /// Start the periodic housekeeping task. A no-op if already running.
    /// Must be called from within a tokio runtime.
    pub fn start_housekeeping(self: &Arc<Self>) {
        let mut slot = self.housekeeping.lock();
        if slot.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let period = Duration::from_secs(self.config.housekeeping_interval_secs.max(1));
        let handle = tokio::spawn(housekeeping_task(Arc::downgrade(self), period, shutdown_rx));
        *slot = Some(Housekeeping { shutdown, handle });
    }

    /// True while the housekeeping task runs.
    pub fn is_housekeeping_running(&self) -> bool {
        self.housekeeping.lock().is_some()
    }

    /// Stop the housekeeping task and wait for it to exit. Idempotent.
    pub async fn stop_housekeeping(&self) {
        let running = self.housekeeping.lock().take();
        if let Some(Housekeeping { shutdown, handle }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Housekeeping task ended abnormally");
            }
        }
    }

    /// Copy of every pattern and record.
    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            taken_at: Utc::now(),
            patterns: self.patterns(),
            records: self.records(),
        }
    }

    /// Replace entries with those from a snapshot. Returns the number of
    /// patterns restored.
    pub fn restore(&self, snapshot: TrackerSnapshot) -> usize {
        let restored = snapshot.patterns.len();
        for pattern in snapshot.patterns {
            self.patterns.insert(pattern.key.clone(), pattern);
        }
        for record in snapshot.records {
            self.records.insert(record.id, record);
        }
        restored
    }

    /// Write a snapshot as JSON, creating parent directories.
    pub async fn save_snapshot(&self, path: &Path) -> SwitchyardResult<()> {
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), patterns = self.pattern_count(), "Failure snapshot saved");
        Ok(())
    }

    /// Load a JSON snapshot written by `save_snapshot`. Returns the number of patterns restored.
    pub async fn load_snapshot(&self, path: &Path) -> SwitchyardResult<usize> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: TrackerSnapshot = serde_json::from_slice(&bytes)?;
        let restored = self.restore(snapshot);
        info!(path = %path.display(), patterns = restored, "Failure snapshot loaded");
        Ok(restored)
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(FailureTrackerConfig::default())
    }
}

impl Drop for FailureTracker {
    fn drop(&mut self) {
        if let Some(running) = self.housekeeping.get_mut().take() {
            running.handle.abort();
        }
    }
}

async fn housekeeping_task(
    tracker: Weak<FailureTracker>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;
    info!(interval_secs = period.as_secs(), "Failure housekeeping started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(tracker) = tracker.upgrade() else { break };
                tracker.run_housekeeping();
            }
        }
    }
    info!("Failure housekeeping stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tracker() -> FailureTracker {
        FailureTracker::default()
    }

    #[test]
    fn test_track_creates_and_increments_pattern() {
        let t = tracker();
        let first = t.track(&FailureInfo::new("Connection refused to 10.0.0.1", "gateway"));
        let second = t.track(&FailureInfo::new("Connection refused to 10.0.0.7", "gateway"));

        assert_eq!(first.pattern_key, second.pattern_key);
        assert_eq!(t.pattern_count(), 1);
        assert_eq!(t.record_count(), 2);
        let pattern = t.pattern(&first.pattern_key).unwrap();
        assert_eq!(pattern.frequency, 2);
        assert_eq!(pattern.category, FailureCategory::Network);
        assert_eq!(pattern.trend, Trend::Decreasing);
        assert_eq!(first.suggested_recovery.as_deref(), Some("retry_with_backoff"));
    }

    #[test]
    fn test_trend_rises_with_frequency() {
        let t = tracker();
        let info = FailureInfo::new("disk quota exceeded", "storage");
        for _ in 0..11 {
            t.track(&info);
        }
        let pattern = t.pattern(&info.pattern_key()).unwrap();
        assert_eq!(pattern.frequency, 11);
        assert_eq!(pattern.trend, Trend::Increasing);
    }

    #[test]
    fn test_error_type_feeds_category() {
        let info = FailureInfo::new("Object reference not set", "parser")
            .with_error_type("NullReferenceException");
        assert_eq!(info.category(), FailureCategory::NullReference);
        assert_eq!(info.severity(), Severity::High);
    }

    #[test]
    fn test_related_patterns_matched() {
        let t = tracker();
        t.track(&FailureInfo::new("socket closed by remote peer", "fetcher"));
        let record = t.track(&FailureInfo::new("socket closed by remote peer", "uploader"));
        assert_eq!(record.matched_patterns.len(), 2);
        assert_eq!(record.matched_patterns[0], record.pattern_key);
    }

    #[test]
    fn test_resolve_once() {
        let t = tracker();
        let record = t.track(&FailureInfo::new("timeout", "svc"));
        let resolved = t.resolve(record.id, "raised timeout").unwrap();
        assert!(resolved.is_resolved());
        assert!(t.resolve(record.id, "again").is_err());
        assert!(t.resolve(Uuid::new_v4(), "missing").is_err());
    }

    #[test]
    fn test_recovery_outcome_updates_pattern_and_strategy() {
        let t = tracker();
        let record = t.track(&FailureInfo::new("connection reset", "svc"));
        let rate = t
            .record_recovery_outcome("retry_with_backoff", Some(&record.pattern_key), true)
            .unwrap();
        assert!(rate > 0.85);
        let pattern = t.pattern(&record.pattern_key).unwrap();
        assert_eq!(pattern.recovery_attempts, 1);
        assert_eq!(pattern.recovery_successes, 1);
        assert!(t.record_recovery_outcome("nope", None, true).is_err());
    }

    #[test]
    fn test_housekeeping_prunes_old_entries() {
        let t = tracker();
        let old = t.track(&FailureInfo::new("ancient failure", "legacy"));
        let fresh = t.track(&FailureInfo::new("recent failure", "current"));
        {
            let past = Utc::now() - chrono::Duration::days(45);
            t.records.get_mut(&old.id).unwrap().timestamp = past;
            t.patterns.get_mut(&old.pattern_key).unwrap().last_seen = past;
        }

        let stats = t.run_housekeeping();
        assert_eq!(stats.records_pruned, 1);
        assert_eq!(stats.patterns_evicted, 1);
        assert_eq!(stats.patterns_remaining, 1);
        assert!(t.record(old.id).is_none());
        assert!(t.record(fresh.id).is_some());
    }

    #[tokio::test]
    async fn test_housekeeping_task_start_stop() {
        let t = Arc::new(tracker());
        t.start_housekeeping();
        t.start_housekeeping();
        assert!(t.is_housekeeping_running());
        t.stop_housekeeping().await;
        assert!(!t.is_housekeeping_running());
        t.stop_housekeeping().await;
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("failures.json");

        let t = tracker();
        t.track(&FailureInfo::new("connection refused", "a"));
        t.track(&FailureInfo::new("out of memory", "b"));
        t.save_snapshot(&path).await.unwrap();

        let restored = tracker();
        assert_eq!(restored.load_snapshot(&path).await.unwrap(), 2);
        assert_eq!(restored.pattern_count(), 2);
        assert_eq!(restored.record_count(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_is_io_error() {
        let t = tracker();
        let err = t
            .load_snapshot(Path::new("/nonexistent/switchyard/failures.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::Io(_)));
    }
}
