//! # Index Module
//!
//! Thread-safe in-memory search index. It implements the bulk-write API the
//! persistence flow writes through, the recovery read used when an updater
//! starts, and the ID-ordered scan reconciliation compares against.
//!
//! Faults can be injected to exercise the retry and reconciliation paths.

use crate::model::{EntityId, Revision};
use crate::persistence::{BulkWriteResponse, IndexDocument, IndexStore, WriteModelRecovery, WriteOp};
use crate::reconcile::{Bookmark, MetadataEntry, MetadataSource};
use crate::write_model::WriteModel;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A fault returned instead of applying the next write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFault {
    Respond(BulkWriteResponse),
    Error(String),
}

#[derive(Debug, Default)]
struct FaultPlan {
    queued: VecDeque<InjectedFault>,
    failure_rate: f64,
    latency: Duration,
    recovery_failures: u32,
}

/// Counters of operations the index has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub documents: usize,
    pub replaces: u64,
    pub patches: u64,
    pub deletes: u64,
    pub faults: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryIndex {
    documents: RwLock<BTreeMap<EntityId, IndexDocument>>,
    faults: Mutex<FaultPlan>,
    replaces: AtomicU64,
    patches: AtomicU64,
    deletes: AtomicU64,
    faulted: AtomicU64,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write with `fault`. Faults queue up in order.
    pub fn inject(&self, fault: InjectedFault) {
        self.faults.lock().queued.push_back(fault);
    }

    /// Fail writes at random with probability `rate`.
    pub fn set_failure_rate(&self, rate: f64) {
        self.faults.lock().failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Delay every write by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = latency;
    }

    /// Fail the next `count` recovery reads.
    pub fn fail_recoveries(&self, count: u32) {
        self.faults.lock().recovery_failures = count;
    }

    pub fn document(&self, entity_id: &EntityId) -> Option<IndexDocument> {
        self.documents.read().get(entity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Overwrite a document behind the updaters' back, simulating drift.
    pub fn put_raw(&self, document: IndexDocument) {
        self.documents
            .write()
            .insert(document.entity_id.clone(), document);
    }

    /// Drop a document behind the updaters' back, simulating drift.
    pub fn remove_raw(&self, entity_id: &EntityId) -> Option<IndexDocument> {
        self.documents.write().remove(entity_id)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            documents: self.len(),
            replaces: self.replaces.load(Ordering::Relaxed),
            patches: self.patches.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            faults: self.faulted.load(Ordering::Relaxed),
        }
    }

    fn next_fault(&self) -> (Option<InjectedFault>, Duration) {
        let mut plan = self.faults.lock();
        let latency = plan.latency;
        if let Some(fault) = plan.queued.pop_front() {
            return (Some(fault), latency);
        }
        if plan.failure_rate > 0.0 && rand::thread_rng().gen_bool(plan.failure_rate) {
            return (
                Some(InjectedFault::Respond(BulkWriteResponse::Unacknowledged)),
                latency,
            );
        }
        (None, latency)
    }

    fn apply(&self, op: WriteOp) -> BulkWriteResponse {
        let mut documents = self.documents.write();
        match op {
            WriteOp::Replace(document) => {
                self.replaces.fetch_add(1, Ordering::Relaxed);
                if let Some(rejected) = regression(&documents, &document.entity_id, document.revision)
                {
                    return rejected;
                }
                documents.insert(document.entity_id.clone(), document);
                BulkWriteResponse::Acknowledged { modified: 1 }
            }
            WriteOp::Patch {
                expected_revision,
                expected_hash,
                document,
                ..
            } => {
                self.patches.fetch_add(1, Ordering::Relaxed);
                match documents.get_mut(&document.entity_id) {
                    Some(stored)
                        if stored.revision == expected_revision
                            && stored.content_hash == expected_hash =>
                    {
                        *stored = document;
                        BulkWriteResponse::Acknowledged { modified: 1 }
                    }
                    _ => BulkWriteResponse::PatchRejected,
                }
            }
            WriteOp::Delete {
                entity_id,
                revision,
            } => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                if let Some(rejected) = regression(&documents, &entity_id, revision) {
                    return rejected;
                }
                let modified = u64::from(documents.remove(&entity_id).is_some());
                BulkWriteResponse::Acknowledged { modified }
            }
        }
    }
}

/// Unconditional writes may not move a stored document back in revision.
fn regression(
    documents: &BTreeMap<EntityId, IndexDocument>,
    entity_id: &EntityId,
    revision: Revision,
) -> Option<BulkWriteResponse> {
    let stored = documents.get(entity_id)?.revision;
    (revision < stored).then(|| {
        BulkWriteResponse::Failed(format!(
            "{} is indexed at {}, refusing to write {}",
            entity_id, stored, revision
        ))
    })
}

#[async_trait]
impl IndexStore for InMemoryIndex {
    async fn bulk_write(&self, op: WriteOp) -> Result<BulkWriteResponse> {
        let (fault, latency) = self.next_fault();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(InjectedFault::Respond(response)) => {
                self.faulted.fetch_add(1, Ordering::Relaxed);
                Ok(response)
            }
            Some(InjectedFault::Error(message)) => {
                self.faulted.fetch_add(1, Ordering::Relaxed);
                Err(anyhow!(message))
            }
            None => Ok(self.apply(op)),
        }
    }
}

#[async_trait]
impl WriteModelRecovery for InMemoryIndex {
    async fn recover(&self, entity_id: &EntityId) -> Result<WriteModel> {
        {
            let mut plan = self.faults.lock();
            if plan.recovery_failures > 0 {
                plan.recovery_failures -= 1;
                return Err(anyhow!("index unavailable while recovering {}", entity_id));
            }
        }
        Ok(match self.documents.read().get(entity_id) {
            Some(document) => WriteModel::Document {
                entity_id: document.entity_id.clone(),
                revision: document.revision,
                tags: document.tags.clone(),
                content_hash: document.content_hash,
            },
            None => WriteModel::unwritten(entity_id.clone()),
        })
    }
}

#[async_trait]
impl MetadataSource for InMemoryIndex {
    fn name(&self) -> &str {
        "index"
    }

    async fn fetch_after(&self, after: &Bookmark, limit: usize) -> Result<Vec<MetadataEntry>> {
        let lower = match after {
            Bookmark::Beginning => Bound::Unbounded,
            Bookmark::After(id) => Bound::Excluded(id.clone()),
        };
        let documents = self.documents.read();
        Ok(documents
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, document)| MetadataEntry {
                entity_id: document.entity_id.clone(),
                revision: document.revision,
                tags: document.tags.clone(),
                deleted: false,
                modified: None,
            })
            .collect())
    }
}
