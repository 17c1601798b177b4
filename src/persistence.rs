//! # Persistence Module
//!
//! The flow that turns `(metadata, last write model)` into one index write
//! and classifies its outcome.
//!
//! Every non-`Ok` [`PersistenceResult`] means the index state is unknown;
//! the updater reacts by downgrading its write model so the next attempt
//! rebuilds the whole document.

use crate::model::{EntityId, Metadata, PendingEvent, RelatedTag, Revision, TagKey};
use crate::write_model::WriteModel;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future;
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome of one persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistenceResult {
    Ok,
    Unacknowledged,
    ConsistencyError,
    IncorrectPatch,
    WriteError,
}

impl PersistenceResult {
    pub fn is_ok(self) -> bool {
        self == PersistenceResult::Ok
    }
}

impl fmt::Display for PersistenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PersistenceResult::Ok => "ok",
            PersistenceResult::Unacknowledged => "unacknowledged",
            PersistenceResult::ConsistencyError => "consistency-error",
            PersistenceResult::IncorrectPatch => "incorrect-patch",
            PersistenceResult::WriteError => "write-error",
        };
        f.write_str(name)
    }
}

/// Sending half of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiving half of a cancellation signal, checked at suspension points.
#[derive(Debug, Clone)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    /// A cancellation that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked cancellation handle and token.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), Cancellation(rx))
}

/// One attempt to bring the index in line with `metadata`.
#[async_trait]
pub trait PersistenceFlow: Send + Sync + 'static {
    async fn persist(
        &self,
        metadata: Metadata,
        last: WriteModel,
        cancel: Cancellation,
    ) -> PersistenceResult;
}

/// Reads back the last write model of an entity when its updater starts.
#[async_trait]
pub trait WriteModelRecovery: Send + Sync + 'static {
    async fn recover(&self, entity_id: &EntityId) -> Result<WriteModel>;
}

/// Indexed representation of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub entity_id: EntityId,
    pub revision: Revision,
    pub tags: BTreeMap<TagKey, RelatedTag>,
    pub content_hash: u64,
}

impl IndexDocument {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            entity_id: metadata.entity_id.clone(),
            revision: metadata.revision,
            tags: metadata.related_tags.clone(),
            content_hash: metadata.content_hash(),
        }
    }

    /// A document at `revision` with no tags and no content hash.
    pub fn bare(entity_id: EntityId, revision: Revision) -> Self {
        Self {
            entity_id,
            revision,
            tags: BTreeMap::new(),
            content_hash: 0,
        }
    }
}

/// A single operation against the index store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Full rebuild: overwrite whatever is stored.
    Replace(IndexDocument),
    /// Incremental update whose preconditions must match the stored document.
    Patch {
        expected_revision: Revision,
        expected_hash: u64,
        events: Vec<PendingEvent>,
        document: IndexDocument,
    },
    Delete {
        entity_id: EntityId,
        revision: Revision,
    },
}

impl WriteOp {
    /// Choose the cheapest operation that is safe on top of `last`.
    pub fn plan(metadata: &Metadata, last: &WriteModel) -> Self {
        if metadata.deleted {
            return WriteOp::Delete {
                entity_id: metadata.entity_id.clone(),
                revision: metadata.revision,
            };
        }
        let document = IndexDocument::from_metadata(metadata);
        match last {
            WriteModel::Document {
                entity_id,
                revision,
                content_hash,
                ..
            } if *entity_id == metadata.entity_id && !metadata.invalidate.any() => {
                WriteOp::Patch {
                    expected_revision: *revision,
                    expected_hash: *content_hash,
                    events: metadata.pending_events.clone(),
                    document,
                }
            }
            _ => WriteOp::Replace(document),
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self, WriteOp::Patch { .. })
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            WriteOp::Replace(document) | WriteOp::Patch { document, .. } => &document.entity_id,
            WriteOp::Delete { entity_id, .. } => entity_id,
        }
    }
}

/// Raw response of the index store's bulk-write API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkWriteResponse {
    /// The store applied the operation to `modified` documents.
    Acknowledged { modified: u64 },
    /// Fire-and-forget write; the store did not confirm it.
    Unacknowledged,
    /// Patch preconditions did not match the stored document.
    PatchRejected,
    /// Applied on the primary but the write concern was not satisfied.
    WriteConcernFailed(String),
    /// The store refused or failed the write.
    Failed(String),
}

/// The concrete index store behind [`BulkWriteFlow`].
#[async_trait]
pub trait IndexStore: Send + Sync + 'static {
    async fn bulk_write(&self, op: WriteOp) -> Result<BulkWriteResponse>;
}

/// Map a bulk-write response onto the five-way result.
pub fn classify(op: &WriteOp, response: Result<BulkWriteResponse>) -> PersistenceResult {
    match response {
        Ok(BulkWriteResponse::Acknowledged { modified }) => match op {
            WriteOp::Delete { .. } => PersistenceResult::Ok,
            _ if modified == 1 => PersistenceResult::Ok,
            WriteOp::Patch { .. } => PersistenceResult::IncorrectPatch,
            WriteOp::Replace(_) => PersistenceResult::ConsistencyError,
        },
        Ok(BulkWriteResponse::Unacknowledged) => PersistenceResult::Unacknowledged,
        Ok(BulkWriteResponse::PatchRejected) => PersistenceResult::IncorrectPatch,
        Ok(BulkWriteResponse::WriteConcernFailed(_)) => PersistenceResult::ConsistencyError,
        Ok(BulkWriteResponse::Failed(_)) | Err(_) => PersistenceResult::WriteError,
    }
}

/// [`PersistenceFlow`] that plans a [`WriteOp`] and sends it to an
/// [`IndexStore`].
pub struct BulkWriteFlow<S> {
    store: Arc<S>,
}

impl<S: IndexStore> BulkWriteFlow<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<S: IndexStore> PersistenceFlow for BulkWriteFlow<S> {
    async fn persist(
        &self,
        metadata: Metadata,
        last: WriteModel,
        mut cancel: Cancellation,
    ) -> PersistenceResult {
        if cancel.is_cancelled() {
            return PersistenceResult::WriteError;
        }
        let op = WriteOp::plan(&metadata, &last);
        tracing::trace!(entity_id = %metadata.entity_id, patch = op.is_patch(), "writing to index");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PersistenceResult::WriteError,
            response = self.store.bulk_write(op.clone()) => response,
        };
        if let Err(err) = &response {
            tracing::warn!(entity_id = %metadata.entity_id, error = %err, "index write failed");
        }
        classify(&op, response)
    }
}
