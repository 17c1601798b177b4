//! # TwinSync
//!
//! Keeps a secondary search index in sync with the canonical state of
//! digital-twin entities.
//!
//! Each entity has one updater that coalesces change notifications into
//! merged [`Metadata`], writes it to the index through a [`PersistenceFlow`],
//! and retries ambiguous writes as full rebuilds. A background
//! reconciliation loop compares the canonical store with the index and
//! resyncs whatever drifted.

pub mod backoff;
pub mod config;
pub mod index;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod reconcile;
pub mod router;
pub mod updater;
pub mod write_model;

// Re-export main types for convenience
pub use config::{ConfigError, ConfigOverrides, SyncConfig};
pub use index::InMemoryIndex;
pub use metrics::{ReconcileMetrics, ReconcileMetricsSnapshot, SyncMetrics, SyncMetricsSnapshot};
pub use model::{Acknowledgement, AckRecipient, EntityId, EventKind, Metadata, Revision};
pub use persistence::{BulkWriteFlow, PersistenceFlow, PersistenceResult, WriteModelRecovery};
pub use reconcile::{
    Bookmark, BookmarkStore, FileBookmarkStore, MemoryBookmarkStore, MemorySource, MetadataSource,
    ReconciliationCoordinator, ReconciliationStatus, Severity,
};
pub use router::UpdaterRouter;
pub use updater::{ChangeNotification, Command};
pub use write_model::WriteModel;

use anyhow::Result;
use reconcile::{CoordinatorSettings, CoordinatorStopper, StatusBoard};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

struct Reconciliation {
    status: StatusBoard,
    stopper: CoordinatorStopper,
    task: JoinHandle<()>,
}

/// Main API: routes live changes to entity updaters and runs the
/// reconciliation loop.
pub struct TwinSync {
    config: SyncConfig,
    router: Arc<UpdaterRouter>,
    metrics: Arc<SyncMetrics>,
    reconcile_metrics: Arc<ReconcileMetrics>,
    reconciliation: Option<Reconciliation>,
}

impl TwinSync {
    pub fn new(
        flow: Arc<dyn PersistenceFlow>,
        recovery: Arc<dyn WriteModelRecovery>,
        config: SyncConfig,
    ) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let router = Arc::new(UpdaterRouter::new(
            flow,
            recovery,
            Arc::clone(&metrics),
            &config,
        ));
        Self {
            config,
            router,
            metrics,
            reconcile_metrics: Arc::new(ReconcileMetrics::new()),
            reconciliation: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<UpdaterRouter> {
        &self.router
    }

    pub async fn notify(&self, notification: ChangeNotification) -> Result<()> {
        self.router.notify(notification).await
    }

    pub async fn resync(&self, metadata: Metadata) -> Result<()> {
        self.router.resync(metadata).await
    }

    /// Start the background reconciliation loop. The bookmark lives in the
    /// configured file, or in memory when no path is set.
    pub fn start_reconciliation(
        &mut self,
        canonical: Arc<dyn MetadataSource>,
        indexed: Arc<dyn MetadataSource>,
    ) -> StatusBoard {
        if let Some(running) = &self.reconciliation {
            return running.status.clone();
        }
        let settings = &self.config.reconciliation;
        let bookmarks: Arc<dyn BookmarkStore> = match &settings.bookmark_path {
            Some(path) => Arc::new(FileBookmarkStore::new(path.clone())),
            None => Arc::new(MemoryBookmarkStore::new()),
        };
        let coordinator = ReconciliationCoordinator::new(
            canonical,
            indexed,
            self.router.clone(),
            bookmarks,
            CoordinatorSettings::from(settings),
        )
        .with_metrics(Arc::clone(&self.reconcile_metrics));
        let status = coordinator.status();
        let stopper = coordinator.stopper();
        let task = tokio::spawn(coordinator.run());
        self.reconciliation = Some(Reconciliation {
            status: status.clone(),
            stopper,
            task,
        });
        status
    }

    pub fn reconciliation_status(&self) -> Option<ReconciliationStatus> {
        self.reconciliation
            .as_ref()
            .map(|running| running.status.snapshot())
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reconcile_metrics(&self) -> ReconcileMetricsSnapshot {
        self.reconcile_metrics.snapshot()
    }

    /// Stop reconciliation, let updaters finish their in-flight writes for
    /// up to `grace`, then terminate whatever is left.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(running) = self.reconciliation.take() {
            running.stopper.stop();
            let _ = running.task.await;
        }
        self.router.shutdown_all(grace).await;
        self.router.terminate().await;
        info!(metrics = ?self.metrics.snapshot(), "twinsync shut down");
    }
}
