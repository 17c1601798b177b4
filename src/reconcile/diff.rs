//! Merge-diff of the canonical and indexed streams.

use super::source::MetadataEntry;
use super::stream::ResumableStream;
use crate::model::{EntityId, Metadata, Revision};
use anyhow::Result;
use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InconsistencyKind {
    /// Live in the canonical store, absent from the index.
    MissingInIndex,
    /// Indexed at a different revision, or with different related tags,
    /// than the canonical one.
    Stale,
    /// Indexed, but deleted or unknown in the canonical store.
    Orphaned,
}

impl fmt::Display for InconsistencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InconsistencyKind::MissingInIndex => "missing-in-index",
            InconsistencyKind::Stale => "stale",
            InconsistencyKind::Orphaned => "orphaned",
        };
        f.write_str(name)
    }
}

/// An entity whose index state disagrees with the canonical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    pub entity_id: EntityId,
    pub kind: InconsistencyKind,
    pub canonical: Option<MetadataEntry>,
    pub indexed_revision: Option<Revision>,
}

impl Inconsistency {
    /// Canonical revision, or `NOT_YET_WRITTEN` if the canonical store
    /// does not know the entity.
    pub fn canonical_revision(&self) -> Revision {
        self.canonical
            .as_ref()
            .map_or(Revision::NOT_YET_WRITTEN, |entry| entry.revision)
    }

    /// Metadata for the resync command that repairs this entity.
    ///
    /// Entities unknown to the canonical store are resynced as deleted at
    /// their indexed revision.
    pub fn resync_metadata(&self) -> Metadata {
        let mut metadata = Metadata::deleted(self.entity_id.clone());
        match &self.canonical {
            Some(entry) => {
                metadata.revision = entry.revision;
                metadata.deleted = entry.deleted;
                metadata.related_tags = entry.tags.clone();
            }
            None => {
                metadata.revision = self.indexed_revision.unwrap_or_default();
            }
        }
        metadata
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    Consistent(EntityId),
    Inconsistent(Inconsistency),
    /// Modified too recently to judge; live updates may still be in flight.
    InFlight(EntityId),
}

impl DiffEntry {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            DiffEntry::Consistent(id) | DiffEntry::InFlight(id) => id,
            DiffEntry::Inconsistent(inconsistency) => &inconsistency.entity_id,
        }
    }
}

/// Decide one entity from what each side reported for it.
pub fn compare(
    canonical: Option<MetadataEntry>,
    indexed: Option<MetadataEntry>,
    tolerance: Duration,
    now: SystemTime,
) -> Option<DiffEntry> {
    let entity_id = match (&canonical, &indexed) {
        (Some(entry), _) | (None, Some(entry)) => entry.entity_id.clone(),
        (None, None) => return None,
    };
    let recent = canonical
        .as_ref()
        .and_then(|entry| entry.modified)
        .map_or(false, |modified| {
            now.duration_since(modified).unwrap_or_default() < tolerance
        });

    let kind = match (&canonical, &indexed) {
        (Some(c), Some(_)) if c.deleted => Some(InconsistencyKind::Orphaned),
        (Some(c), Some(i)) if c.revision != i.revision => Some(InconsistencyKind::Stale),
        // A related tag moved without the entity's own revision changing.
        (Some(c), Some(i)) if c.tags != i.tags => Some(InconsistencyKind::Stale),
        (Some(_), Some(_)) => None,
        (Some(c), None) if c.deleted => None,
        (Some(_), None) => Some(InconsistencyKind::MissingInIndex),
        (None, _) => Some(InconsistencyKind::Orphaned),
    };

    Some(match kind {
        None => DiffEntry::Consistent(entity_id),
        Some(_) if recent => DiffEntry::InFlight(entity_id),
        Some(kind) => DiffEntry::Inconsistent(Inconsistency {
            entity_id,
            kind,
            indexed_revision: indexed.map(|entry| entry.revision),
            canonical,
        }),
    })
}

/// Diff two ID-sorted slices in one pass.
pub fn diff_sorted(
    canonical: &[MetadataEntry],
    indexed: &[MetadataEntry],
    tolerance: Duration,
    now: SystemTime,
) -> Vec<DiffEntry> {
    let mut out = Vec::with_capacity(canonical.len().max(indexed.len()));
    let (mut c, mut i) = (0, 0);
    loop {
        let (left, right) = match (canonical.get(c), indexed.get(i)) {
            (None, None) => break,
            (Some(left), None) => {
                c += 1;
                (Some(left), None)
            }
            (None, Some(right)) => {
                i += 1;
                (None, Some(right))
            }
            (Some(left), Some(right)) => match left.entity_id.cmp(&right.entity_id) {
                Ordering::Less => {
                    c += 1;
                    (Some(left), None)
                }
                Ordering::Greater => {
                    i += 1;
                    (None, Some(right))
                }
                Ordering::Equal => {
                    c += 1;
                    i += 1;
                    (Some(left), Some(right))
                }
            },
        };
        out.extend(compare(left.cloned(), right.cloned(), tolerance, now));
    }
    out
}

/// Streaming merge-diff over two [`ResumableStream`]s.
pub struct MergeDiff {
    canonical: ResumableStream,
    indexed: ResumableStream,
    tolerance: Duration,
}

impl MergeDiff {
    pub fn new(canonical: ResumableStream, indexed: ResumableStream, tolerance: Duration) -> Self {
        Self {
            canonical,
            indexed,
            tolerance,
        }
    }

    pub fn canonical(&self) -> &ResumableStream {
        &self.canonical
    }

    pub fn indexed(&self) -> &ResumableStream {
        &self.indexed
    }

    /// Earliest point such that every entity at or before it was decided.
    /// An exhausted stream does not hold the other one back.
    pub fn safe_point(&self) -> super::Bookmark {
        match (self.canonical.is_exhausted(), self.indexed.is_exhausted()) {
            (true, false) => self.indexed.progress().clone(),
            (false, true) => self.canonical.progress().clone(),
            _ => self
                .canonical
                .progress()
                .clone()
                .lesser(self.indexed.progress().clone()),
        }
    }

    /// Decide the next entity. `Ok(None)` once both streams are exhausted.
    ///
    /// Only the peeks await, so dropping the future never loses an entry.
    pub async fn next(&mut self) -> Result<Option<DiffEntry>> {
        loop {
            let left = self.canonical.peek().await?.map(|e| e.entity_id.clone());
            let right = self.indexed.peek().await?.map(|e| e.entity_id.clone());
            let (canonical, indexed) = match (left, right) {
                (None, None) => return Ok(None),
                (Some(_), None) => (self.canonical.take(), None),
                (None, Some(_)) => (None, self.indexed.take()),
                (Some(l), Some(r)) => match l.cmp(&r) {
                    Ordering::Less => (self.canonical.take(), None),
                    Ordering::Greater => (None, self.indexed.take()),
                    Ordering::Equal => (self.canonical.take(), self.indexed.take()),
                },
            };
            if let Some(entry) = compare(canonical, indexed, self.tolerance, SystemTime::now()) {
                return Ok(Some(entry));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::reconcile::bookmark::Bookmark;
    use crate::reconcile::source::{MemorySource, MetadataSource};
    use crate::reconcile::stream::StreamSettings;
    use std::sync::Arc;

    fn entry(id: &str, rev: u64) -> MetadataEntry {
        MetadataEntry::new(EntityId::new(id), Revision(rev))
    }

    fn tombstone(id: &str, rev: u64) -> MetadataEntry {
        MetadataEntry {
            deleted: true,
            ..entry(id, rev)
        }
    }

    fn kinds(entries: &[DiffEntry]) -> Vec<(String, Option<InconsistencyKind>)> {
        entries
            .iter()
            .map(|e| {
                let kind = match e {
                    DiffEntry::Inconsistent(i) => Some(i.kind),
                    _ => None,
                };
                (e.entity_id().as_str().to_string(), kind)
            })
            .collect()
    }

    #[test]
    fn test_diff_classifies_every_case() {
        let canonical = vec![
            entry("a", 1),
            entry("b", 5),
            entry("c", 2),
            tombstone("d", 4),
            tombstone("e", 3),
        ];
        let indexed = vec![entry("a", 1), entry("b", 3), entry("d", 3), entry("f", 2)];
        let diff = diff_sorted(&canonical, &indexed, Duration::ZERO, SystemTime::now());
        assert_eq!(
            kinds(&diff),
            vec![
                ("a".into(), None),
                ("b".into(), Some(InconsistencyKind::Stale)),
                ("c".into(), Some(InconsistencyKind::MissingInIndex)),
                ("d".into(), Some(InconsistencyKind::Orphaned)),
                ("e".into(), None),
                ("f".into(), Some(InconsistencyKind::Orphaned)),
            ]
        );
    }

    #[test]
    fn test_tag_only_drift_is_stale() {
        let tagged = |id: &str, version: u64| {
            MetadataEntry::from_metadata(
                &Metadata::at(EntityId::new(id), Revision(1), crate::model::EventKind::Modified)
                    .with_tag("policy", version),
            )
        };
        let canonical = vec![tagged("a", 2), tagged("b", 1), entry("c", 1)];
        let indexed = vec![tagged("a", 1), tagged("b", 1), tagged("c", 1)];
        let diff = diff_sorted(&canonical, &indexed, Duration::ZERO, SystemTime::now());
        assert_eq!(
            kinds(&diff),
            vec![
                ("a".into(), Some(InconsistencyKind::Stale)),
                ("b".into(), None),
                ("c".into(), Some(InconsistencyKind::Stale)),
            ]
        );

        let DiffEntry::Inconsistent(stale) = &diff[0] else {
            panic!("expected an inconsistency, got {:?}", diff[0]);
        };
        let metadata = stale.resync_metadata();
        assert_eq!(metadata.revision, Revision(1));
        assert_eq!(metadata.related_tags["policy"].version, 2);
    }

    #[test]
    fn test_recent_changes_are_in_flight() {
        let now = SystemTime::now();
        let recent = MetadataEntry {
            modified: Some(now - Duration::from_secs(1)),
            ..entry("a", 2)
        };
        let old = MetadataEntry {
            modified: Some(now - Duration::from_secs(60)),
            ..entry("b", 2)
        };
        let diff = diff_sorted(&[recent, old], &[], Duration::from_secs(10), now);
        assert_eq!(diff[0], DiffEntry::InFlight(EntityId::new("a")));
        assert!(matches!(diff[1], DiffEntry::Inconsistent(_)));
    }

    #[test]
    fn test_resync_metadata_follows_canonical() {
        let stale = Inconsistency {
            entity_id: EntityId::new("e1"),
            kind: InconsistencyKind::Stale,
            canonical: Some(entry("e1", 5)),
            indexed_revision: Some(Revision(3)),
        };
        let metadata = stale.resync_metadata();
        assert_eq!(metadata.revision, Revision(5));
        assert!(!metadata.deleted);

        let orphan = Inconsistency {
            entity_id: EntityId::new("e9"),
            kind: InconsistencyKind::Orphaned,
            canonical: None,
            indexed_revision: Some(Revision(7)),
        };
        let metadata = orphan.resync_metadata();
        assert_eq!(orphan.canonical_revision(), Revision::NOT_YET_WRITTEN);
        assert_eq!(metadata.revision, Revision(7));
        assert!(metadata.deleted);
    }

    #[tokio::test]
    async fn test_streaming_diff_matches_slice_diff() {
        let canonical = Arc::new(MemorySource::new("canonical"));
        let indexed = Arc::new(MemorySource::new("index"));
        for i in 0..40u64 {
            let id = format!("e{:03}", i);
            if i % 7 != 0 {
                canonical.upsert(entry(&id, i + 1));
            }
            if i % 5 != 0 {
                indexed.upsert(entry(&id, if i % 3 == 0 { i } else { i + 1 }));
            }
        }
        let settings = StreamSettings {
            page_size: 6,
            max_entries_per_sec: 0,
            max_retries: 0,
            backoff: ExponentialBackoff::default(),
        };
        let mut diff = MergeDiff::new(
            ResumableStream::new(canonical.clone(), Bookmark::Beginning, settings.clone()),
            ResumableStream::new(indexed.clone(), Bookmark::Beginning, settings.clone()),
            Duration::ZERO,
        );
        let mut streamed = Vec::new();
        while let Some(entry) = diff.next().await.unwrap() {
            streamed.push(entry);
        }

        let all_c = canonical.fetch_after(&Bookmark::Beginning, 100).await.unwrap();
        let all_i = indexed.fetch_after(&Bookmark::Beginning, 100).await.unwrap();
        let expected = diff_sorted(&all_c, &all_i, Duration::ZERO, SystemTime::now());
        assert_eq!(streamed, expected);
        assert_eq!(diff.safe_point(), Bookmark::After(EntityId::new("e039")));
    }
}
