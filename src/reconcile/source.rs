//! ID-ordered metadata sources the reconciliation streams read from.

use super::bookmark::Bookmark;
use crate::model::{merge_tags, EntityId, Metadata, RelatedTag, Revision, TagKey};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::SystemTime;

/// One entity as seen by a metadata source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub entity_id: EntityId,
    pub revision: Revision,
    pub tags: BTreeMap<TagKey, RelatedTag>,
    /// Canonical tombstone; index sources never report deleted entries.
    pub deleted: bool,
    /// Last modification time, when the source tracks it.
    pub modified: Option<SystemTime>,
}

impl MetadataEntry {
    pub fn new(entity_id: EntityId, revision: Revision) -> Self {
        Self {
            entity_id,
            revision,
            tags: BTreeMap::new(),
            deleted: false,
            modified: None,
        }
    }

    /// Snapshot of `metadata` as a canonical store would hold it.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            entity_id: metadata.entity_id.clone(),
            revision: metadata.revision,
            tags: metadata.related_tags.clone(),
            deleted: metadata.deleted,
            modified: Some(SystemTime::now()),
        }
    }
}

/// A source that pages through entities in ascending [`EntityId`] order.
#[async_trait]
pub trait MetadataSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Up to `limit` entries strictly after `after`, in ID order. An empty
    /// page means the source is exhausted.
    async fn fetch_after(&self, after: &Bookmark, limit: usize) -> Result<Vec<MetadataEntry>>;
}

/// In-memory canonical metadata store.
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    entries: RwLock<BTreeMap<EntityId, MetadataEntry>>,
    failures: Mutex<u32>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
            failures: Mutex::new(0),
        }
    }

    pub fn upsert(&self, entry: MetadataEntry) {
        self.entries.write().insert(entry.entity_id.clone(), entry);
    }

    /// Apply a change: the stored entry follows the newer revision.
    pub fn record(&self, metadata: &Metadata) {
        let incoming = MetadataEntry::from_metadata(metadata);
        let mut entries = self.entries.write();
        match entries.get_mut(&metadata.entity_id) {
            Some(current) => {
                // Tags keep the higher version per key, like merged metadata.
                merge_tags(&mut current.tags, incoming.tags);
                if incoming.revision > current.revision {
                    current.revision = incoming.revision;
                    current.deleted = incoming.deleted;
                    current.modified = incoming.modified;
                }
            }
            None => {
                entries.insert(metadata.entity_id.clone(), incoming);
            }
        }
    }

    pub fn remove(&self, entity_id: &EntityId) -> Option<MetadataEntry> {
        self.entries.write().remove(entity_id)
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<MetadataEntry> {
        self.entries.read().get(entity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fail the next `count` fetches.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }
}

#[async_trait]
impl MetadataSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_after(&self, after: &Bookmark, limit: usize) -> Result<Vec<MetadataEntry>> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("{} source temporarily unavailable", self.name));
            }
        }
        let lower = match after {
            Bookmark::Beginning => Bound::Unbounded,
            Bookmark::After(id) => Bound::Excluded(id.clone()),
        };
        Ok(self
            .entries
            .read()
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;

    #[tokio::test]
    async fn test_record_keeps_newest_revision() {
        let source = MemorySource::new("canonical");
        let id = EntityId::new("a");
        source.record(&Metadata::at(id.clone(), Revision(4), EventKind::Modified));
        source.record(&Metadata::at(id.clone(), Revision(2), EventKind::Modified));
        assert_eq!(source.get(&id).unwrap().revision, Revision(4));

        source.record(&Metadata::at(id.clone(), Revision(5), EventKind::Deleted));
        assert!(source.get(&id).unwrap().deleted);
    }

    #[test]
    fn test_record_accumulates_related_tags() {
        let source = MemorySource::new("canonical");
        let id = EntityId::new("a");
        source.record(&Metadata::at(id.clone(), Revision(1), EventKind::Created).with_tag("policy", 3));
        source.record(&Metadata::at(id.clone(), Revision(2), EventKind::Modified).with_tag("owner", 1));
        source.record(&Metadata::at(id.clone(), Revision(3), EventKind::Modified).with_tag("policy", 2));

        let entry = source.get(&id).unwrap();
        assert_eq!(entry.revision, Revision(3));
        assert_eq!(entry.tags["policy"].version, 3);
        assert_eq!(entry.tags["owner"].version, 1);
    }

    #[tokio::test]
    async fn test_fetch_pages_and_fails_on_demand() {
        let source = MemorySource::new("canonical");
        for id in ["c", "a", "b"] {
            source.upsert(MetadataEntry::new(EntityId::new(id), Revision(1)));
        }
        let first = source.fetch_after(&Bookmark::Beginning, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].entity_id, EntityId::new("a"));

        source.fail_next(1);
        let after = Bookmark::After(first[1].entity_id.clone());
        assert!(source.fetch_after(&after, 2).await.is_err());
        let rest = source.fetch_after(&after, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].entity_id, EntityId::new("c"));
    }
}
