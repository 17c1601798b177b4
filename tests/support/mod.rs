use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use twinsync_rs::model::{EntityId, Metadata, Revision};
use twinsync_rs::persistence::{
    BulkWriteFlow, Cancellation, IndexDocument, PersistenceFlow, PersistenceResult,
};
use twinsync_rs::reconcile::MetadataEntry;
use twinsync_rs::{InMemoryIndex, MemorySource, SyncConfig, WriteModel};

/// Config with short timers so tests converge in milliseconds.
#[allow(dead_code)]
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.updater.coalesce_ms = 5;
    config.updater.backoff_base_ms = 5;
    config.updater.backoff_cap_ms = 20;
    config.updater.backoff_jitter = 0.0;
    config.updater.deletion_grace_ms = 20;
    config.persistence.timeout_ms = 2_000;
    config.reconciliation.page_size = 4;
    config.reconciliation.max_entries_per_sec = 0;
    config.reconciliation.stream_backoff_base_ms = 1;
    config.reconciliation.stream_backoff_cap_ms = 5;
    config.reconciliation.bookmark_every_entries = 3;
    config.reconciliation.quiet_period_ms = 20;
    config.reconciliation.tolerance_window_ms = 0;
    config
}

/// Poll `check` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[allow(dead_code)]
pub fn indexed_revision(index: &InMemoryIndex, id: &str) -> Option<Revision> {
    index.document(&EntityId::new(id)).map(|doc| doc.revision)
}

/// Put `id` at the same revision in the canonical store and the index.
#[allow(dead_code)]
pub fn seed_consistent(canonical: &MemorySource, index: &InMemoryIndex, id: &str, revision: u64) {
    seed(canonical, index, id, revision, revision);
}

#[allow(dead_code)]
pub fn seed(
    canonical: &MemorySource,
    index: &InMemoryIndex,
    id: &str,
    canonical_revision: u64,
    indexed_revision: u64,
) {
    canonical.upsert(MetadataEntry::new(EntityId::new(id), Revision(canonical_revision)));
    index.put_raw(IndexDocument::bare(
        EntityId::new(id),
        Revision(indexed_revision),
    ));
}

/// Wraps [`BulkWriteFlow`] and records how many writes overlap.
#[allow(dead_code)]
pub struct CountingFlow {
    inner: BulkWriteFlow<InMemoryIndex>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub attempts: AtomicU64,
    pub full_rebuilds: AtomicU64,
    latency: Duration,
}

#[allow(dead_code)]
impl CountingFlow {
    pub fn new(index: Arc<InMemoryIndex>, latency: Duration) -> Self {
        Self {
            inner: BulkWriteFlow::new(index),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
            full_rebuilds: AtomicU64::new(0),
            latency,
        }
    }
}

#[async_trait]
impl PersistenceFlow for CountingFlow {
    async fn persist(
        &self,
        metadata: Metadata,
        last: WriteModel,
        cancel: Cancellation,
    ) -> PersistenceResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if last.is_full_rebuild() {
            self.full_rebuilds.fetch_add(1, Ordering::Relaxed);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = self.inner.persist(metadata, last, cancel).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
