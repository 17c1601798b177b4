//! # Reconciliation Coordinator
//!
//! Perpetual background loop: resume from the persisted bookmark, merge-diff
//! the canonical and indexed streams, resync every inconsistent entity, then
//! rest for a quiet period and start over.
//!
//! One coordinator runs per deployment. A restarted coordinator re-scans at
//! most the tail after the last persisted bookmark.

use super::bookmark::{Bookmark, BookmarkStore};
use super::diff::{DiffEntry, Inconsistency, MergeDiff};
use super::source::MetadataSource;
use super::stream::{ResumableStream, StreamSettings};
use crate::config::ReconciliationConfig;
use crate::metrics::ReconcileMetrics;
use crate::model::{EntityId, Metadata, Revision};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::fmt;
use std::future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Receives targeted resync commands.
#[async_trait]
pub trait ResyncSink: Send + Sync + 'static {
    async fn resync(&self, metadata: Metadata) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Normal,
    /// The same inconsistency survived a full pass and its resync.
    Escalated,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Normal => f.write_str("normal"),
            Severity::Escalated => f.write_str("escalated"),
        }
    }
}

/// Outcome of one (possibly interrupted) pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub compared: u64,
    pub in_flight: u64,
    pub inconsistencies: u64,
    pub escalated: u64,
    pub resyncs: u64,
    /// Both streams were exhausted.
    pub completed: bool,
}

/// Health snapshot of the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationStatus {
    pub canonical_progress: Bookmark,
    pub indexed_progress: Bookmark,
    pub bookmark: Bookmark,
    pub severity: Severity,
    pub passes_completed: u64,
    pub last_pass: Option<PassSummary>,
    pub running: bool,
}

/// Shared, read-only view of the coordinator's status.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard(Arc<RwLock<ReconciliationStatus>>);

impl StatusBoard {
    pub fn snapshot(&self) -> ReconciliationStatus {
        self.0.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut ReconciliationStatus)) {
        f(&mut self.0.write());
    }
}

/// Asks a running coordinator to stop.
#[derive(Debug, Clone)]
pub struct CoordinatorStopper(Arc<watch::Sender<bool>>);

impl CoordinatorStopper {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub stream: StreamSettings,
    pub bookmark_every_entries: u64,
    pub bookmark_interval: Duration,
    pub quiet_period: Duration,
    pub tolerance_window: Duration,
}

impl From<&ReconciliationConfig> for CoordinatorSettings {
    fn from(config: &ReconciliationConfig) -> Self {
        Self {
            stream: StreamSettings::from(config),
            bookmark_every_entries: config.bookmark_every_entries.max(1),
            bookmark_interval: config.bookmark_interval(),
            quiet_period: config.quiet_period(),
            tolerance_window: config.tolerance_window(),
        }
    }
}

pub struct ReconciliationCoordinator {
    canonical: Arc<dyn MetadataSource>,
    indexed: Arc<dyn MetadataSource>,
    sink: Arc<dyn ResyncSink>,
    bookmarks: Arc<dyn BookmarkStore>,
    settings: CoordinatorSettings,
    metrics: Arc<ReconcileMetrics>,
    status: StatusBoard,
    /// Inconsistencies seen in the previous completed pass.
    previous: FxHashSet<(EntityId, Revision)>,
    current: FxHashSet<(EntityId, Revision)>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl ReconciliationCoordinator {
    pub fn new(
        canonical: Arc<dyn MetadataSource>,
        indexed: Arc<dyn MetadataSource>,
        sink: Arc<dyn ResyncSink>,
        bookmarks: Arc<dyn BookmarkStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            canonical,
            indexed,
            sink,
            bookmarks,
            settings,
            metrics: Arc::new(ReconcileMetrics::new()),
            status: StatusBoard::default(),
            previous: FxHashSet::default(),
            current: FxHashSet::default(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReconcileMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ReconcileMetrics> {
        &self.metrics
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn stopper(&self) -> CoordinatorStopper {
        CoordinatorStopper(Arc::clone(&self.stop_tx))
    }

    /// Run passes until stopped. Pass failures are logged and retried after
    /// the quiet period; they never end the loop.
    pub async fn run(mut self) {
        self.status.update(|status| status.running = true);
        info!(
            canonical = self.canonical.name(),
            indexed = self.indexed.name(),
            "reconciliation started"
        );
        loop {
            match self.run_pass().await {
                Ok(summary) if !summary.completed => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "reconciliation pass aborted");
                }
            }
            if self.is_stopped() {
                break;
            }
            let quiet = self.settings.quiet_period;
            let mut stop = self.stop_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(quiet) => {}
                _ = stopped(&mut stop) => break,
            }
        }
        self.status.update(|status| status.running = false);
        info!("reconciliation stopped");
    }

    /// One pass from the persisted bookmark to the end of both streams, or
    /// until stopped. The bookmark is reset to the beginning once a pass
    /// completes.
    pub async fn run_pass(&mut self) -> Result<PassSummary> {
        let start = self.bookmarks.load().await?;
        debug!(start = %start, "reconciliation pass starting");
        let stream = |source: &Arc<dyn MetadataSource>| {
            ResumableStream::new(
                Arc::clone(source),
                start.clone(),
                self.settings.stream.clone(),
            )
            .with_metrics(Arc::clone(&self.metrics))
        };
        let mut diff = MergeDiff::new(
            stream(&self.canonical),
            stream(&self.indexed),
            self.settings.tolerance_window,
        );

        let mut summary = PassSummary::default();
        let mut since_flush = 0u64;
        let mut last_flush = Instant::now();
        let mut stop = self.stop_rx.clone();

        loop {
            let step = tokio::select! {
                biased;
                _ = stopped(&mut stop) => {
                    self.flush(&diff).await?;
                    debug!(compared = summary.compared, "reconciliation pass interrupted");
                    return Ok(summary);
                }
                step = diff.next() => step,
            };
            let entry = match step {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    // Keep what was decided so far.
                    self.flush(&diff).await?;
                    return Err(err);
                }
            };

            summary.compared += 1;
            self.metrics.entries_compared.fetch_add(1, Ordering::Relaxed);
            match entry {
                DiffEntry::Consistent(_) => {}
                DiffEntry::InFlight(_) => summary.in_flight += 1,
                DiffEntry::Inconsistent(inconsistency) => {
                    self.handle_inconsistency(inconsistency, &mut summary).await;
                }
            }

            since_flush += 1;
            if since_flush >= self.settings.bookmark_every_entries
                || last_flush.elapsed() >= self.settings.bookmark_interval
            {
                self.flush(&diff).await?;
                since_flush = 0;
                last_flush = Instant::now();
            }
        }

        summary.completed = true;
        self.bookmarks.save(&Bookmark::Beginning).await?;
        self.previous = std::mem::take(&mut self.current);
        self.metrics.passes.fetch_add(1, Ordering::Relaxed);
        let severity = if summary.escalated > 0 {
            Severity::Escalated
        } else {
            Severity::Normal
        };
        self.status.update(|status| {
            status.bookmark = Bookmark::Beginning;
            status.severity = severity;
            status.passes_completed += 1;
            status.last_pass = Some(summary);
        });
        info!(
            compared = summary.compared,
            inconsistencies = summary.inconsistencies,
            escalated = summary.escalated,
            resyncs = summary.resyncs,
            in_flight = summary.in_flight,
            "reconciliation pass completed"
        );
        Ok(summary)
    }

    async fn handle_inconsistency(&mut self, inconsistency: Inconsistency, summary: &mut PassSummary) {
        summary.inconsistencies += 1;
        self.metrics.inconsistencies.fetch_add(1, Ordering::Relaxed);

        let key = (
            inconsistency.entity_id.clone(),
            inconsistency.canonical_revision(),
        );
        let repeated = self.previous.contains(&key);
        self.current.insert(key);

        if repeated {
            summary.escalated += 1;
            self.metrics.escalations.fetch_add(1, Ordering::Relaxed);
            self.status.update(|status| status.severity = Severity::Escalated);
            error!(
                entity_id = %inconsistency.entity_id,
                kind = %inconsistency.kind,
                canonical_revision = %inconsistency.canonical_revision(),
                indexed_revision = ?inconsistency.indexed_revision.map(|r| r.0),
                "inconsistency persisted across passes"
            );
        } else {
            warn!(
                entity_id = %inconsistency.entity_id,
                kind = %inconsistency.kind,
                canonical_revision = %inconsistency.canonical_revision(),
                indexed_revision = ?inconsistency.indexed_revision.map(|r| r.0),
                "index inconsistent with canonical store"
            );
        }

        match self.sink.resync(inconsistency.resync_metadata()).await {
            Ok(()) => {
                summary.resyncs += 1;
                self.metrics.resyncs_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(entity_id = %inconsistency.entity_id, error = %err, "resync not delivered");
            }
        }
    }

    async fn flush(&self, diff: &MergeDiff) -> Result<()> {
        let bookmark = diff.safe_point();
        self.bookmarks.save(&bookmark).await?;
        let canonical = diff.canonical().progress().clone();
        let indexed = diff.indexed().progress().clone();
        self.status.update(|status| {
            status.bookmark = bookmark;
            status.canonical_progress = canonical;
            status.indexed_progress = indexed;
        });
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }
}

/// Resolves once a stop is requested.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::reconcile::bookmark::MemoryBookmarkStore;
    use crate::reconcile::source::{MemorySource, MetadataEntry};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Metadata>>,
    }

    #[async_trait]
    impl ResyncSink for RecordingSink {
        async fn resync(&self, metadata: Metadata) -> Result<()> {
            self.sent.lock().push(metadata);
            Ok(())
        }
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            stream: StreamSettings {
                page_size: 3,
                max_entries_per_sec: 0,
                max_retries: 1,
                backoff: ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2)),
            },
            bookmark_every_entries: 2,
            bookmark_interval: Duration::from_secs(60),
            quiet_period: Duration::from_millis(10),
            tolerance_window: Duration::ZERO,
        }
    }

    struct Fixture {
        canonical: Arc<MemorySource>,
        indexed: Arc<MemorySource>,
        sink: Arc<RecordingSink>,
        bookmarks: Arc<MemoryBookmarkStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                canonical: Arc::new(MemorySource::new("canonical")),
                indexed: Arc::new(MemorySource::new("index")),
                sink: Arc::new(RecordingSink::default()),
                bookmarks: Arc::new(MemoryBookmarkStore::new()),
            }
        }

        fn both(&self, id: &str, canonical: u64, indexed: u64) {
            self.canonical
                .upsert(MetadataEntry::new(EntityId::new(id), Revision(canonical)));
            self.indexed
                .upsert(MetadataEntry::new(EntityId::new(id), Revision(indexed)));
        }

        fn coordinator(&self) -> ReconciliationCoordinator {
            ReconciliationCoordinator::new(
                self.canonical.clone(),
                self.indexed.clone(),
                self.sink.clone(),
                self.bookmarks.clone(),
                settings(),
            )
        }

        fn sent(&self) -> Vec<Metadata> {
            std::mem::take(&mut *self.sink.sent.lock())
        }
    }

    #[tokio::test]
    async fn test_consistent_dataset_sends_nothing() {
        let fixture = Fixture::new();
        for i in 0..10 {
            fixture.both(&format!("e{}", i), 3, 3);
        }
        let mut coordinator = fixture.coordinator();
        for _ in 0..2 {
            let summary = coordinator.run_pass().await.unwrap();
            assert!(summary.completed);
            assert_eq!(summary.compared, 10);
            assert_eq!(summary.resyncs, 0);
        }
        assert!(fixture.sent().is_empty());
        assert_eq!(coordinator.status().snapshot().passes_completed, 2);
    }

    #[tokio::test]
    async fn test_stale_entity_gets_one_resync() {
        let fixture = Fixture::new();
        fixture.both("a", 1, 1);
        fixture.both("e1", 5, 3);
        fixture.both("z", 1, 1);
        let mut coordinator = fixture.coordinator();

        coordinator.run_pass().await.unwrap();
        let sent = fixture.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].entity_id, EntityId::new("e1"));
        assert_eq!(sent[0].revision, Revision(5));

        // The resync repaired the index.
        fixture.both("e1", 5, 5);
        coordinator.run_pass().await.unwrap();
        assert!(fixture.sent().is_empty());
        assert_eq!(coordinator.status().snapshot().severity, Severity::Normal);
    }

    #[tokio::test]
    async fn test_repeated_inconsistency_escalates() {
        let fixture = Fixture::new();
        fixture.both("e1", 5, 3);
        let mut coordinator = fixture.coordinator();

        let first = coordinator.run_pass().await.unwrap();
        assert_eq!(first.escalated, 0);
        assert_eq!(coordinator.status().snapshot().severity, Severity::Normal);

        let second = coordinator.run_pass().await.unwrap();
        assert_eq!(second.escalated, 1);
        assert_eq!(coordinator.status().snapshot().severity, Severity::Escalated);
        assert_eq!(coordinator.metrics().snapshot().escalations, 1);

        // A newer canonical revision is a different inconsistency.
        fixture.canonical
            .upsert(MetadataEntry::new(EntityId::new("e1"), Revision(6)));
        let third = coordinator.run_pass().await.unwrap();
        assert_eq!(third.escalated, 0);
        assert_eq!(coordinator.status().snapshot().severity, Severity::Normal);
    }

    #[tokio::test]
    async fn test_bookmark_is_flushed_during_pass_and_reset_after() {
        let fixture = Fixture::new();
        for id in ["a", "b", "c", "d", "e"] {
            fixture.both(id, 1, 1);
        }
        let mut coordinator = fixture.coordinator();
        coordinator.run_pass().await.unwrap();

        let history = fixture.bookmarks.history();
        assert_eq!(history.last(), Some(&Bookmark::Beginning));
        assert!(history.contains(&Bookmark::After(EntityId::new("b"))));
        assert!(history.contains(&Bookmark::After(EntityId::new("d"))));
    }

    #[tokio::test]
    async fn test_pass_resumes_from_bookmark() {
        let fixture = Fixture::new();
        fixture.both("a", 2, 1);
        fixture.both("m", 2, 1);
        fixture.bookmarks.save(&Bookmark::After(EntityId::new("b"))).await.unwrap();
        let mut coordinator = fixture.coordinator();
        coordinator.run_pass().await.unwrap();
        let sent = fixture.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].entity_id, EntityId::new("m"));
    }

    /// Takes the canonical source down right after resyncing `trigger`.
    struct OutageSink {
        canonical: Arc<MemorySource>,
        trigger: EntityId,
    }

    #[async_trait]
    impl ResyncSink for OutageSink {
        async fn resync(&self, metadata: Metadata) -> Result<()> {
            if metadata.entity_id == self.trigger {
                self.canonical.fail_next(2);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_source_failure_keeps_decided_progress() {
        let fixture = Fixture::new();
        for id in ["a", "c", "d", "e", "f", "g"] {
            fixture.both(id, 1, 1);
        }
        fixture.both("b", 2, 1);
        let sink = Arc::new(OutageSink {
            canonical: fixture.canonical.clone(),
            trigger: EntityId::new("b"),
        });
        let mut coordinator = ReconciliationCoordinator::new(
            fixture.canonical.clone(),
            fixture.indexed.clone(),
            sink,
            fixture.bookmarks.clone(),
            settings(),
        );

        // The first page (a..c) is decided, fetching the second one fails.
        assert!(coordinator.run_pass().await.is_err());
        assert_eq!(fixture.bookmarks.current(), Bookmark::After(EntityId::new("c")));
        assert!(coordinator.metrics().snapshot().stream_retries >= 1);

        let summary = coordinator.run_pass().await.unwrap();
        assert!(summary.completed);
        assert_eq!(summary.compared, 4);
    }

    #[tokio::test]
    async fn test_run_stops_on_request() {
        let fixture = Fixture::new();
        fixture.both("a", 1, 1);
        let coordinator = fixture.coordinator();
        let status = coordinator.status();
        let stopper = coordinator.stopper();
        let task = tokio::spawn(coordinator.run());

        tokio::time::timeout(Duration::from_secs(2), async {
            while status.snapshot().passes_completed < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        stopper.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!status.snapshot().running);
    }
}
