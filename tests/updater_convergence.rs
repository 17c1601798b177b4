//! Live update path: router, entity updaters and a faulty index.
//!
//! Tests cover:
//! - One write in flight per entity under heavy concurrent input
//! - Convergence to the latest revision despite write failures
//! - Acknowledgements withheld until the revision is really indexed
//! - Idle eviction, reactivation and deletion

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use twinsync_rs::index::InjectedFault;
use twinsync_rs::persistence::BulkWriteResponse;
use twinsync_rs::updater::StopReason;
use twinsync_rs::{
    AckRecipient, BulkWriteFlow, ChangeNotification, EntityId, EventKind, InMemoryIndex,
    Metadata, Revision, TwinSync,
};

mod support;

use support::{fast_config, indexed_revision, wait_until, CountingFlow};

fn change(id: &str, revision: u64) -> ChangeNotification {
    ChangeNotification::new(Metadata::at(
        EntityId::new(id),
        Revision(revision),
        EventKind::Modified,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_write_in_flight_under_concurrent_events() -> anyhow::Result<()> {
    let index = Arc::new(InMemoryIndex::new());
    let flow = Arc::new(CountingFlow::new(index.clone(), Duration::from_millis(1)));
    let sync = Arc::new(TwinSync::new(flow.clone(), index.clone(), fast_config()));

    let next = Arc::new(AtomicU64::new(0));
    let mut producers = Vec::new();
    for worker in 0..8u64 {
        let sync = Arc::clone(&sync);
        let next = Arc::clone(&next);
        producers.push(tokio::spawn(async move {
            for i in 0..500u64 {
                let revision = next.fetch_add(1, Ordering::SeqCst) + 1;
                let mut notification = change("hot", revision);
                notification.flush_now = (worker + i) % 7 == 0;
                sync.notify(notification).await?;
            }
            anyhow::Ok(())
        }));
    }
    for producer in producers {
        producer.await??;
    }

    let index_ref = index.clone();
    wait_until(Duration::from_secs(10), || {
        let index = index_ref.clone();
        async move { indexed_revision(&index, "hot") == Some(Revision(4000)) }
    })
    .await?;

    assert_eq!(flow.max_in_flight.load(Ordering::SeqCst), 1);
    // Coalescing keeps the write count far below the event count.
    assert!(flow.attempts.load(Ordering::Relaxed) < 4000);
    Ok(())
}

#[tokio::test]
async fn converges_to_latest_revision_despite_failures() -> anyhow::Result<()> {
    let index = Arc::new(InMemoryIndex::new());
    index.set_failure_rate(0.3);
    let flow = Arc::new(CountingFlow::new(index.clone(), Duration::ZERO));
    let sync = TwinSync::new(flow.clone(), index.clone(), fast_config());

    let mut rng = StdRng::seed_from_u64(7);
    let mut latest = vec![0u64; 20];
    for _ in 0..600 {
        let slot = rng.gen_range(0..latest.len());
        // Revisions may arrive out of order; the newest one must win.
        let revision = latest[slot] + rng.gen_range(1..4);
        latest[slot] = latest[slot].max(revision);
        sync.notify(change(&format!("twin-{:02}", slot), revision)).await?;
        if rng.gen_bool(0.2) {
            let stale = revision.saturating_sub(2).max(1);
            sync.notify(change(&format!("twin-{:02}", slot), stale)).await?;
        }
    }

    let index_ref = index.clone();
    let expected = latest.clone();
    wait_until(Duration::from_secs(10), || {
        let index = index_ref.clone();
        let expected = expected.clone();
        async move {
            expected.iter().enumerate().all(|(slot, revision)| {
                *revision == 0
                    || indexed_revision(&index, &format!("twin-{:02}", slot))
                        == Some(Revision(*revision))
            })
        }
    })
    .await?;

    let metrics = sync.metrics();
    assert!(metrics.write_failures > 0);
    assert_eq!(flow.max_in_flight.load(Ordering::SeqCst), 1);
    // Every failure forces the next attempt to rebuild.
    assert!(flow.full_rebuilds.load(Ordering::Relaxed) >= metrics.write_failures);
    sync.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn acknowledgement_waits_for_successful_write() -> anyhow::Result<()> {
    let index = Arc::new(InMemoryIndex::new());
    index.inject(InjectedFault::Respond(BulkWriteResponse::Unacknowledged));
    index.inject(InjectedFault::Error("connection reset".into()));
    let sync = TwinSync::new(
        Arc::new(BulkWriteFlow::new(index.clone())),
        index.clone(),
        fast_config(),
    );

    let (recipient, mut acks) = AckRecipient::channel();
    sync.notify(change("twin-1", 1).with_ack(recipient.clone()))
        .await?;

    let ack = tokio::time::timeout(Duration::from_secs(2), acks.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("ack channel closed"))?;
    assert_eq!(ack.requested, Revision(1));
    assert_eq!(ack.indexed, Revision(1));
    assert_eq!(index.stats().faults, 2);
    assert_eq!(indexed_revision(&index, "twin-1"), Some(Revision(1)));

    let metrics = sync.metrics();
    assert_eq!(metrics.write_failures, 2);
    assert_eq!(metrics.acknowledgements, 1);

    // An ack for a revision the index already covers is answered at once.
    sync.notify(change("twin-1", 1).with_ack(recipient)).await?;
    let again = tokio::time::timeout(Duration::from_secs(2), acks.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("ack channel closed"))?;
    assert_eq!(again.indexed, Revision(1));
    assert_ne!(again.correlation_id, ack.correlation_id);

    sync.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn idle_updater_is_evicted_and_reactivated() -> anyhow::Result<()> {
    let index = Arc::new(InMemoryIndex::new());
    let mut config = fast_config();
    config.updater.idle_timeout_ms = 30;
    let sync = TwinSync::new(
        Arc::new(BulkWriteFlow::new(index.clone())),
        index.clone(),
        config,
    );
    let router = sync.router().clone();

    sync.notify(change("twin-1", 1)).await?;
    let probe = router.clone();
    wait_until(Duration::from_secs(2), || {
        let router = probe.clone();
        async move { router.stopped_count(StopReason::Idle) == 1 }
    })
    .await?;
    assert_eq!(router.active_count(), 0);
    assert_eq!(indexed_revision(&index, "twin-1"), Some(Revision(1)));

    sync.notify(change("twin-1", 2)).await?;
    let index_ref = index.clone();
    wait_until(Duration::from_secs(2), || {
        let index = index_ref.clone();
        async move { indexed_revision(&index, "twin-1") == Some(Revision(2)) }
    })
    .await?;
    // The second updater recovered the first one's document and patched it.
    assert_eq!(index.stats().replaces, 1);
    assert_eq!(index.stats().patches, 1);
    sync.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn deleted_entity_is_removed_and_updater_stops() -> anyhow::Result<()> {
    let index = Arc::new(InMemoryIndex::new());
    let sync = TwinSync::new(
        Arc::new(BulkWriteFlow::new(index.clone())),
        index.clone(),
        fast_config(),
    );
    sync.notify(change("twin-1", 1)).await?;
    sync.notify(ChangeNotification::new(Metadata::at(
        EntityId::new("twin-1"),
        Revision(2),
        EventKind::Deleted,
    )))
    .await?;

    let router = sync.router().clone();
    wait_until(Duration::from_secs(2), || {
        let router = router.clone();
        async move { router.stopped_count(StopReason::Deleted) == 1 }
    })
    .await?;
    assert_eq!(indexed_revision(&index, "twin-1"), None);
    assert_eq!(sync.router().active_count(), 0);
    sync.shutdown(Duration::from_secs(1)).await;
    Ok(())
}
