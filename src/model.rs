//! # Model Module
//!
//! Identity types and the mergeable [`Metadata`] value describing the latest
//! known change for one entity.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Stable identifier of a synchronized entity.
///
/// Ordering is plain lexicographic byte order; both reconciliation streams
/// must deliver entries in this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Monotonically increasing version of the canonical entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    /// Revision of a model that has never been written to the index.
    pub const NOT_YET_WRITTEN: Revision = Revision(0);

    pub fn is_unwritten(self) -> bool {
        self == Self::NOT_YET_WRITTEN
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a secondary resource (for example an owning policy).
pub type TagKey = String;

/// Version tag of a secondary resource related to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelatedTag {
    pub version: u64,
}

/// Kind of a causal change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

/// A causal event not yet reflected in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub revision: Revision,
    pub kind: EventKind,
}

/// Marks cached enrichment data that must be re-fetched instead of patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InvalidateFlags {
    pub enrichment: bool,
    pub policy: bool,
}

impl InvalidateFlags {
    pub fn any(self) -> bool {
        self.enrichment || self.policy
    }

    pub fn or(self, other: InvalidateFlags) -> InvalidateFlags {
        InvalidateFlags {
            enrichment: self.enrichment || other.enrichment,
            policy: self.policy || other.policy,
        }
    }
}

/// Confirmation that a revision is durably reflected in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub correlation_id: Uuid,
    pub entity_id: EntityId,
    /// Revision the caller asked about.
    pub requested: Revision,
    /// Revision actually indexed, always `>= requested`.
    pub indexed: Revision,
}

/// Channel on which acknowledgements are delivered.
#[derive(Debug, Clone)]
pub struct AckRecipient(mpsc::UnboundedSender<Acknowledgement>);

impl AckRecipient {
    pub fn new(sender: mpsc::UnboundedSender<Acknowledgement>) -> Self {
        Self(sender)
    }

    /// Create a recipient together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Acknowledgement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Deliver an acknowledgement. Returns false if the caller went away.
    pub fn deliver(&self, ack: Acknowledgement) -> bool {
        self.0.send(ack).is_ok()
    }
}

/// Measures the lag between observing an event and indexing it.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyTimer {
    started: Instant,
}

impl ConsistencyTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A request to be told once a revision is durably indexed.
#[derive(Debug, Clone)]
pub struct AckRequest {
    pub correlation_id: Uuid,
    pub revision: Revision,
    pub recipient: AckRecipient,
    pub timer: ConsistencyTimer,
}

impl AckRequest {
    pub fn new(revision: Revision, recipient: AckRecipient) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            revision,
            recipient,
            timer: ConsistencyTimer::start(),
        }
    }

    pub fn acknowledgement(&self, entity_id: &EntityId, indexed: Revision) -> Acknowledgement {
        Acknowledgement {
            correlation_id: self.correlation_id,
            entity_id: entity_id.clone(),
            requested: self.revision,
            indexed,
        }
    }
}

/// Latest known change for one entity.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub entity_id: EntityId,
    pub revision: Revision,
    pub deleted: bool,
    pub related_tags: BTreeMap<TagKey, RelatedTag>,
    pub pending_events: Vec<PendingEvent>,
    pub invalidate: InvalidateFlags,
    pub acks: Vec<AckRequest>,
}

impl Metadata {
    /// The empty "deleted" sentinel an updater starts from.
    pub fn deleted(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            revision: Revision::NOT_YET_WRITTEN,
            deleted: true,
            related_tags: BTreeMap::new(),
            pending_events: Vec::new(),
            invalidate: InvalidateFlags::default(),
            acks: Vec::new(),
        }
    }

    /// Metadata describing one event at `revision`.
    pub fn at(entity_id: EntityId, revision: Revision, kind: EventKind) -> Self {
        Self {
            entity_id,
            revision,
            deleted: kind == EventKind::Deleted,
            related_tags: BTreeMap::new(),
            pending_events: vec![PendingEvent { revision, kind }],
            invalidate: InvalidateFlags::default(),
            acks: Vec::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<TagKey>, version: u64) -> Self {
        self.related_tags.insert(key.into(), RelatedTag { version });
        self
    }

    pub fn with_ack(mut self, request: AckRequest) -> Self {
        self.acks.push(request);
        self
    }

    pub fn with_invalidate(mut self, flags: InvalidateFlags) -> Self {
        self.invalidate = self.invalidate.or(flags);
        self
    }

    /// Merge `incoming` into `self`.
    ///
    /// Revision is max-wins, tags keep the higher version per key, pending
    /// events are appended in arrival order, flags are OR-ed and
    /// acknowledgement obligations are never dropped. Deletion follows the
    /// newer revision.
    pub fn merge(&mut self, incoming: Metadata) {
        debug_assert_eq!(self.entity_id, incoming.entity_id);
        if incoming.revision > self.revision {
            self.revision = incoming.revision;
            self.deleted = incoming.deleted;
        }
        merge_tags(&mut self.related_tags, incoming.related_tags);
        self.pending_events.extend(incoming.pending_events);
        self.invalidate = self.invalidate.or(incoming.invalidate);
        self.acks.extend(incoming.acks);
    }

    /// Merge a notification that is not newer than `self`.
    ///
    /// Its pending events are discarded; tags, flags and acknowledgement
    /// requests are still kept.
    pub fn merge_stale(&mut self, incoming: Metadata) {
        merge_tags(&mut self.related_tags, incoming.related_tags);
        self.invalidate = self.invalidate.or(incoming.invalidate);
        self.acks.extend(incoming.acks);
    }

    /// Hash over every fact that shapes the indexed document.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.entity_id.hash(&mut hasher);
        self.revision.hash(&mut hasher);
        self.deleted.hash(&mut hasher);
        self.related_tags.hash(&mut hasher);
        hasher.finish()
    }

    /// Drop everything a durable write of `written` has covered and return
    /// the acknowledgement requests it satisfied.
    pub fn settle(&mut self, written: &Metadata) -> Vec<AckRequest> {
        self.pending_events
            .retain(|event| event.revision > written.revision);
        if self.revision == written.revision {
            self.invalidate = InvalidateFlags::default();
        }
        let (satisfied, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.acks)
            .into_iter()
            .partition(|ack| ack.revision <= written.revision);
        self.acks = open;
        satisfied
    }
}

pub(crate) fn merge_tags(existing: &mut BTreeMap<TagKey, RelatedTag>, incoming: BTreeMap<TagKey, RelatedTag>) {
    for (key, tag) in incoming {
        existing
            .entry(key)
            .and_modify(|current| {
                if tag.version > current.version {
                    *current = tag;
                }
            })
            .or_insert(tag);
    }
}
