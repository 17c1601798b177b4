//! Lock-free counters emitted by the updaters and the reconciliation loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared by every entity updater.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub persisted_ok: AtomicU64,
    pub incorrect_patches: AtomicU64,
    pub write_failures: AtomicU64,
    pub acknowledgements: AtomicU64,
    pub lag_count: AtomicU64,
    pub lag_sum_us: AtomicU64,
    pub lag_max_us: AtomicU64,
}

/// Plain copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub persisted_ok: u64,
    pub incorrect_patches: u64,
    pub write_failures: u64,
    pub acknowledgements: u64,
    pub lag_count: u64,
    pub lag_avg_us: u64,
    pub lag_max_us: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_ok(&self) {
        self.persisted_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_incorrect_patch(&self) {
        self.incorrect_patches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one delivered acknowledgement and its end-to-end lag.
    pub fn record_ack(&self, lag: Duration) {
        let lag_us = u64::try_from(lag.as_micros()).unwrap_or(u64::MAX);
        self.acknowledgements.fetch_add(1, Ordering::Relaxed);
        self.lag_count.fetch_add(1, Ordering::Relaxed);
        self.lag_sum_us.fetch_add(lag_us, Ordering::Relaxed);

        let mut current = self.lag_max_us.load(Ordering::Relaxed);
        while lag_us > current {
            match self.lag_max_us.compare_exchange_weak(
                current,
                lag_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        let lag_count = self.lag_count.load(Ordering::Relaxed);
        let lag_sum = self.lag_sum_us.load(Ordering::Relaxed);
        SyncMetricsSnapshot {
            persisted_ok: self.persisted_ok.load(Ordering::Relaxed),
            incorrect_patches: self.incorrect_patches.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            acknowledgements: self.acknowledgements.load(Ordering::Relaxed),
            lag_count,
            lag_avg_us: if lag_count > 0 { lag_sum / lag_count } else { 0 },
            lag_max_us: self.lag_max_us.load(Ordering::Relaxed),
        }
    }
}

/// Counters of the reconciliation loop.
#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    pub passes: AtomicU64,
    pub entries_compared: AtomicU64,
    pub inconsistencies: AtomicU64,
    pub escalations: AtomicU64,
    pub resyncs_sent: AtomicU64,
    pub stream_retries: AtomicU64,
}

/// Plain copy of [`ReconcileMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileMetricsSnapshot {
    pub passes: u64,
    pub entries_compared: u64,
    pub inconsistencies: u64,
    pub escalations: u64,
    pub resyncs_sent: u64,
    pub stream_retries: u64,
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ReconcileMetricsSnapshot {
        ReconcileMetricsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            entries_compared: self.entries_compared.load(Ordering::Relaxed),
            inconsistencies: self.inconsistencies.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            resyncs_sent: self.resyncs_sent.load(Ordering::Relaxed),
            stream_retries: self.stream_retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lag_tracks_average_and_max() {
        let metrics = SyncMetrics::new();
        metrics.record_ack(Duration::from_micros(100));
        metrics.record_ack(Duration::from_micros(300));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acknowledgements, 2);
        assert_eq!(snapshot.lag_avg_us, 200);
        assert_eq!(snapshot.lag_max_us, 300);
    }
}
