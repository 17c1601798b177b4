//! # Router Module
//!
//! Local shard region: delivers each command to the unique live updater of
//! its entity, spawning one on first contact and again after the previous
//! instance stopped (idle, deleted or failed recovery).

use crate::config::SyncConfig;
use crate::metrics::SyncMetrics;
use crate::model::{EntityId, Metadata};
use crate::persistence::{cancellation, CancelHandle, PersistenceFlow, WriteModelRecovery};
use crate::reconcile::ResyncSink;
use crate::updater::{
    ChangeNotification, Command, EntityUpdater, StopReason, UpdaterContext, UpdaterExit,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Attempts to reach a live updater before giving up on a command.
const MAX_DELIVERY_ATTEMPTS: usize = 3;

struct UpdaterHandle {
    generation: u64,
    sender: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// State shared between the router and the tasks it spawns.
struct Registry {
    updaters: DashMap<EntityId, UpdaterHandle>,
    context: UpdaterContext,
    mailbox_capacity: usize,
    next_generation: AtomicU64,
    stopped: DashMap<StopReason, u64>,
}

/// Routes commands to per-entity updaters.
pub struct UpdaterRouter {
    registry: Arc<Registry>,
    terminate: CancelHandle,
}

impl UpdaterRouter {
    pub fn new(
        flow: Arc<dyn PersistenceFlow>,
        recovery: Arc<dyn WriteModelRecovery>,
        metrics: Arc<SyncMetrics>,
        config: &SyncConfig,
    ) -> Self {
        let (terminate, token) = cancellation();
        let context = UpdaterContext::new(
            flow,
            recovery,
            metrics,
            &config.updater,
            config.persistence.timeout(),
        )
        .with_terminate(token);
        Self {
            registry: Arc::new(Registry {
                updaters: DashMap::new(),
                context,
                mailbox_capacity: config.updater.mailbox_capacity,
                next_generation: AtomicU64::new(0),
                stopped: DashMap::new(),
            }),
            terminate,
        }
    }

    /// Deliver a live change notification.
    pub async fn notify(&self, notification: ChangeNotification) -> Result<()> {
        let entity_id = notification.metadata.entity_id.clone();
        self.registry
            .tell(&entity_id, Command::Notify(notification))
            .await
    }

    /// Force a full rebuild of one entity from `metadata`.
    pub async fn resync(&self, metadata: Metadata) -> Result<()> {
        let entity_id = metadata.entity_id.clone();
        self.registry.tell(&entity_id, Command::Resync(metadata)).await
    }

    /// Ask one updater to stop once everything it merged is written. No-op
    /// if the entity is not active.
    pub async fn shutdown_entity(&self, entity_id: &EntityId) {
        let sender = self
            .registry
            .updaters
            .get(entity_id)
            .map(|handle| handle.sender.clone());
        if let Some(sender) = sender {
            let _ = sender.send(Command::Shutdown).await;
        }
    }

    /// Cooperatively stop every active updater and wait for them.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let updaters = &self.registry.updaters;
        let senders: Vec<mpsc::Sender<Command>> =
            updaters.iter().map(|entry| entry.sender.clone()).collect();
        for sender in &senders {
            let _ = sender.send(Command::Shutdown).await;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        while !updaters.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if !updaters.is_empty() {
            debug!(remaining = updaters.len(), "updaters still active after shutdown timeout");
        }
    }

    /// Supervisory stop: cancel in-flight writes and end every updater.
    pub async fn terminate(&self) {
        self.terminate.cancel();
        let updaters = &self.registry.updaters;
        let tasks: Vec<JoinHandle<()>> = {
            let keys: Vec<EntityId> = updaters.iter().map(|e| e.key().clone()).collect();
            keys.into_iter()
                .filter_map(|key| updaters.remove(&key).map(|(_, handle)| handle.task))
                .collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Number of updaters currently running.
    pub fn active_count(&self) -> usize {
        self.registry.updaters.len()
    }

    pub fn is_active(&self, entity_id: &EntityId) -> bool {
        self.registry.updaters.contains_key(entity_id)
    }

    /// How many updaters stopped for `reason` so far.
    pub fn stopped_count(&self, reason: StopReason) -> u64 {
        self.registry
            .stopped
            .get(&reason)
            .map(|count| *count)
            .unwrap_or(0)
    }
}

impl Registry {
    async fn tell(self: &Arc<Self>, entity_id: &EntityId, command: Command) -> Result<()> {
        let mut command = command;
        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            let (generation, sender) = self.sender_for(entity_id);
            match sender.send(command).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    // The updater stopped between lookup and send.
                    trace!(entity_id = %entity_id, generation, "updater gone, respawning");
                    self.updaters
                        .remove_if(entity_id, |_, handle| handle.generation == generation);
                    command = returned;
                }
            }
        }
        Err(anyhow!("no live updater for {} after {} attempts", entity_id, MAX_DELIVERY_ATTEMPTS))
    }

    fn sender_for(self: &Arc<Self>, entity_id: &EntityId) -> (u64, mpsc::Sender<Command>) {
        let entry = self
            .updaters
            .entry(entity_id.clone())
            .or_insert_with(|| self.spawn(entity_id.clone()));
        (entry.generation, entry.sender.clone())
    }

    fn spawn(self: &Arc<Self>, entity_id: EntityId) -> UpdaterHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, rx) = mpsc::channel(self.mailbox_capacity.max(1));
        let updater = EntityUpdater::new(entity_id.clone(), rx, self.context.clone());
        // Weak, so dropping the router still closes every mailbox.
        let registry = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let exit = updater.run().await;
            if let Some(registry) = registry.upgrade() {
                registry.retire(&entity_id, generation, exit).await;
            }
        });
        debug!(generation, "updater activated");
        UpdaterHandle {
            generation,
            sender,
            task,
        }
    }

    /// Deregister a stopped updater and re-deliver whatever it never
    /// processed to a fresh generation.
    async fn retire(self: &Arc<Self>, entity_id: &EntityId, generation: u64, exit: UpdaterExit) {
        self.updaters
            .remove_if(entity_id, |_, handle| handle.generation == generation);
        *self.stopped.entry(exit.reason).or_insert(0) += 1;
        for command in exit.undelivered {
            if matches!(command, Command::Shutdown) {
                continue;
            }
            if let Err(err) = self.tell(entity_id, command).await {
                warn!(entity_id = %entity_id, error = %err, "dropping command after updater stop");
            }
        }
    }
}

#[async_trait]
impl ResyncSink for UpdaterRouter {
    async fn resync(&self, metadata: Metadata) -> Result<()> {
        UpdaterRouter::resync(self, metadata).await
    }
}
