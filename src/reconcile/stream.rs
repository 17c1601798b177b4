//! Paged, throttled and self-healing scan over one [`MetadataSource`].

use super::bookmark::Bookmark;
use super::source::{MetadataEntry, MetadataSource};
use crate::backoff::ExponentialBackoff;
use crate::config::ReconciliationConfig;
use crate::metrics::ReconcileMetrics;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub page_size: usize,
    /// 0 disables throttling.
    pub max_entries_per_sec: u64,
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl From<&ReconciliationConfig> for StreamSettings {
    fn from(config: &ReconciliationConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            max_entries_per_sec: config.max_entries_per_sec,
            max_retries: config.stream_max_retries,
            backoff: config.stream_backoff(),
        }
    }
}

/// Paces consumption to a fixed number of entries per second.
#[derive(Debug)]
struct Throttle {
    rate: u64,
    started: Instant,
    granted: u64,
}

impl Throttle {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            started: Instant::now(),
            granted: 0,
        }
    }

    async fn acquire(&mut self) {
        if self.rate == 0 {
            return;
        }
        let due = self.started
            + Duration::from_secs_f64(self.granted as f64 / self.rate as f64);
        if due > Instant::now() {
            tokio::time::sleep_until(due).await;
        }
        self.granted += 1;
    }
}

/// Resumable stream over an ID-ordered source.
///
/// The fetch point (where the next page starts) and the consumed progress
/// (last entry handed to the caller) are tracked separately; buffered but
/// unconsumed entries never count as progress.
pub struct ResumableStream {
    source: Arc<dyn MetadataSource>,
    settings: StreamSettings,
    fetch_point: Bookmark,
    progress: Bookmark,
    buffer: VecDeque<MetadataEntry>,
    exhausted: bool,
    head_cleared: bool,
    throttle: Throttle,
    metrics: Option<Arc<ReconcileMetrics>>,
}

impl ResumableStream {
    pub fn new(source: Arc<dyn MetadataSource>, start: Bookmark, settings: StreamSettings) -> Self {
        let throttle = Throttle::new(settings.max_entries_per_sec);
        Self {
            source,
            settings,
            fetch_point: start.clone(),
            progress: start,
            buffer: VecDeque::new(),
            exhausted: false,
            head_cleared: false,
            throttle,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReconcileMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Last entry handed out, or the start point if none.
    pub fn progress(&self) -> &Bookmark {
        &self.progress
    }

    /// True once the source returned an empty page and the buffer is drained.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// The next entry without consuming it. Cancel-safe: an interrupted
    /// call leaves the stream where it was.
    pub async fn peek(&mut self) -> Result<Option<&MetadataEntry>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        if !self.buffer.is_empty() && !self.head_cleared {
            self.throttle.acquire().await;
            self.head_cleared = true;
        }
        Ok(self.buffer.front())
    }

    /// Consume the entry returned by the last [`peek`](Self::peek).
    pub fn take(&mut self) -> Option<MetadataEntry> {
        let entry = self.buffer.pop_front()?;
        self.head_cleared = false;
        self.progress = Bookmark::After(entry.entity_id.clone());
        Some(entry)
    }

    pub async fn next(&mut self) -> Result<Option<MetadataEntry>> {
        if self.peek().await?.is_none() {
            return Ok(None);
        }
        Ok(self.take())
    }

    async fn fill(&mut self) -> Result<()> {
        let mut failures = 0u32;
        loop {
            match self
                .source
                .fetch_after(&self.fetch_point, self.settings.page_size)
                .await
            {
                Ok(page) => {
                    match page.last() {
                        Some(last) => self.fetch_point = Bookmark::After(last.entity_id.clone()),
                        None => self.exhausted = true,
                    }
                    self.buffer.extend(page);
                    return Ok(());
                }
                Err(err) => {
                    failures += 1;
                    if failures > self.settings.max_retries {
                        return Err(err).with_context(|| {
                            format!(
                                "{} stream failed {} times at {}",
                                self.source.name(),
                                failures,
                                self.fetch_point
                            )
                        });
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.stream_retries.fetch_add(1, Ordering::Relaxed);
                    }
                    let delay = self.settings.backoff.delay(failures);
                    warn!(
                        stream = self.source.name(),
                        resume = %self.fetch_point,
                        attempt = failures,
                        ?delay,
                        error = %err,
                        "metadata stream fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
