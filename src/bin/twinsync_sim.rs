//! Simulated twin fleet: random change events flow through the entity
//! updaters into an in-memory index, while write faults and silent index
//! drift exercise retries and reconciliation.
//!
//! Usage:
//! ```bash
//! RUST_LOG=info cargo run --bin twinsync_sim -- \
//!   --config twinsync.toml \
//!   --entities 5000 \
//!   --duration 60 \
//!   --bookmark /tmp/twinsync-bookmark.json
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use twinsync_rs::config::{ReconciliationOverrides, SimulationOverrides};
use twinsync_rs::persistence::IndexDocument;
use twinsync_rs::{
    AckRecipient, BulkWriteFlow, ChangeNotification, ConfigOverrides, EntityId, EventKind,
    InMemoryIndex, MemorySource, Metadata, Revision, SyncConfig, TwinSync,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const DELETE_PROBABILITY: f64 = 0.02;
const ACK_PROBABILITY: f64 = 0.1;
const TAG_PROBABILITY: f64 = 0.2;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn overrides() -> ConfigOverrides {
    let bookmark_path = parse_arg("--bookmark").map(Into::into);
    let quiet_period_ms = parse_arg("--quiet-period-ms").and_then(|v| v.parse().ok());
    let entities = parse_arg("--entities").and_then(|v| v.parse().ok());
    let duration_secs = parse_arg("--duration").and_then(|v| v.parse().ok());
    ConfigOverrides {
        reconciliation: Some(ReconciliationOverrides {
            bookmark_path,
            quiet_period_ms,
        }),
        simulation: Some(SimulationOverrides {
            entities,
            duration_secs,
        }),
    }
}

/// Mutates the canonical state of the fleet and emits the matching events.
struct Fleet {
    revisions: Vec<u64>,
    rng: StdRng,
}

impl Fleet {
    fn new(entities: usize, seed: u64) -> Self {
        Self {
            revisions: vec![0; entities.max(1)],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn entity(slot: usize) -> EntityId {
        EntityId::new(format!("twin-{:06}", slot))
    }

    fn next_change(&mut self) -> Metadata {
        let slot = self.rng.gen_range(0..self.revisions.len());
        self.revisions[slot] += 1;
        let revision = Revision(self.revisions[slot]);
        let kind = if revision.0 == 1 {
            EventKind::Created
        } else if self.rng.gen_bool(DELETE_PROBABILITY) {
            EventKind::Deleted
        } else {
            EventKind::Modified
        };
        let mut metadata = Metadata::at(Self::entity(slot), revision, kind);
        if self.rng.gen_bool(TAG_PROBABILITY) {
            metadata = metadata.with_tag("policy", self.rng.gen_range(1..100));
        }
        metadata
    }

    /// Corrupt one indexed document behind the updaters' back.
    fn drift(&mut self, index: &InMemoryIndex) {
        let slot = self.rng.gen_range(0..self.revisions.len());
        let entity_id = Self::entity(slot);
        match index.document(&entity_id) {
            Some(document) if self.rng.gen_bool(0.5) => {
                index.remove_raw(&document.entity_id);
            }
            Some(document) if document.revision.0 > 1 => {
                index.put_raw(IndexDocument::bare(
                    entity_id,
                    Revision(document.revision.0 - 1),
                ));
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = parse_arg("--config");
    let config = SyncConfig::load(config_path.as_deref(), overrides())?;
    let sim = config.simulation.clone();
    let seed: u64 = parse_arg("--seed")
        .and_then(|v| v.parse().ok())
        .unwrap_or(42);

    info!(
        entities = sim.entities,
        events_per_sec = sim.events_per_sec,
        write_failure_rate = sim.write_failure_rate,
        drift_rate = sim.drift_rate,
        "starting twinsync simulation"
    );

    let index = Arc::new(InMemoryIndex::new());
    index.set_failure_rate(sim.write_failure_rate);
    let canonical = Arc::new(MemorySource::new("canonical"));

    let mut sync = TwinSync::new(
        Arc::new(BulkWriteFlow::new(Arc::clone(&index))),
        index.clone(),
        config.clone(),
    );
    sync.start_reconciliation(canonical.clone(), index.clone());

    let (recipient, mut acks) = AckRecipient::channel();
    let acked = Arc::new(AtomicU64::new(0));
    let ack_counter = Arc::clone(&acked);
    tokio::spawn(async move {
        while acks.recv().await.is_some() {
            ack_counter.fetch_add(1, Ordering::Relaxed);
        }
    });

    let mut fleet = Fleet::new(sim.entities, seed);
    let period = Duration::from_secs_f64(1.0 / sim.events_per_sec.max(1) as f64);
    let mut events = tokio::time::interval(period);
    let mut drift = tokio::time::interval(Duration::from_secs(1));
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let deadline = sim.duration_secs.map(Duration::from_secs);
    let stop = async {
        match deadline {
            Some(after) => tokio::time::sleep(after).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(stop);

    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = events.tick() => {
                let metadata = fleet.next_change();
                canonical.record(&metadata);
                let mut notification = ChangeNotification::new(metadata);
                if fleet.rng.gen_bool(ACK_PROBABILITY) {
                    notification = notification.with_ack(recipient.clone());
                }
                if let Err(err) = sync.notify(notification).await {
                    warn!(error = %err, "notification dropped");
                }
                sent += 1;
            }
            _ = drift.tick() => {
                if fleet.rng.gen_bool(sim.drift_rate.clamp(0.0, 1.0)) {
                    fleet.drift(&index);
                }
            }
            _ = status.tick() => {
                let metrics = sync.metrics();
                let reconcile = sync.reconcile_metrics();
                let state = sync.reconciliation_status().unwrap_or_default();
                info!(
                    sent,
                    active = sync.router().active_count(),
                    indexed = index.len(),
                    persisted = metrics.persisted_ok,
                    write_failures = metrics.write_failures,
                    incorrect_patches = metrics.incorrect_patches,
                    acks = acked.load(Ordering::Relaxed),
                    lag_avg_us = metrics.lag_avg_us,
                    passes = reconcile.passes,
                    inconsistencies = reconcile.inconsistencies,
                    severity = %state.severity,
                    bookmark = %state.bookmark,
                    "simulation status"
                );
            }
        }
    }

    info!(sent, "stopping simulation");
    sync.shutdown(Duration::from_secs(5)).await;
    let stats = index.stats();
    info!(
        documents = stats.documents,
        replaces = stats.replaces,
        patches = stats.patches,
        deletes = stats.deletes,
        faults = stats.faults,
        "index totals"
    );
    Ok(())
}
