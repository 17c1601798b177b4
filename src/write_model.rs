//! # Write Model Module
//!
//! Snapshot of what was last durably written to the index for one entity.

use crate::model::{EntityId, Metadata, RelatedTag, Revision, TagKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What is currently believed to be in the index for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WriteModel {
    /// A full document at `revision`.
    Document {
        entity_id: EntityId,
        revision: Revision,
        tags: BTreeMap<TagKey, RelatedTag>,
        content_hash: u64,
    },
    /// A delete. Also the pessimistic stand-in after an ambiguous write.
    Tombstone {
        entity_id: EntityId,
        revision: Revision,
    },
}

impl WriteModel {
    /// Tombstone for an entity that was never written.
    pub fn unwritten(entity_id: EntityId) -> Self {
        WriteModel::Tombstone {
            entity_id,
            revision: Revision::NOT_YET_WRITTEN,
        }
    }

    /// The model a successful write of `metadata` leaves in the index.
    pub fn target(metadata: &Metadata) -> Self {
        if metadata.deleted {
            WriteModel::Tombstone {
                entity_id: metadata.entity_id.clone(),
                revision: metadata.revision,
            }
        } else {
            WriteModel::Document {
                entity_id: metadata.entity_id.clone(),
                revision: metadata.revision,
                tags: metadata.related_tags.clone(),
                content_hash: metadata.content_hash(),
            }
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            WriteModel::Document { entity_id, .. } | WriteModel::Tombstone { entity_id, .. } => {
                entity_id
            }
        }
    }

    pub fn revision(&self) -> Revision {
        match self {
            WriteModel::Document { revision, .. } | WriteModel::Tombstone { revision, .. } => {
                *revision
            }
        }
    }

    /// True when the next write on top of this model must rebuild the
    /// whole document instead of patching it.
    pub fn is_full_rebuild(&self) -> bool {
        matches!(self, WriteModel::Tombstone { .. })
    }

    /// Downgrade to an unwritten tombstone: the index state is unknown from
    /// here on, so the next write is a full rebuild and nothing is covered.
    pub fn downgrade(&self) -> Self {
        WriteModel::unwritten(self.entity_id().clone())
    }

    /// Whether `metadata` carries anything this model does not already
    /// reflect in the index.
    pub fn needs_write(&self, metadata: &Metadata) -> bool {
        if self.revision().is_unwritten() {
            // Nothing ever written: a deleted sentinel has nothing to write.
            return !(metadata.deleted && metadata.revision.is_unwritten());
        }
        if metadata.invalidate.any() {
            return true;
        }
        match self {
            WriteModel::Document {
                revision,
                content_hash,
                ..
            } => *revision != metadata.revision || *content_hash != metadata.content_hash(),
            // A tombstone only reflects metadata that is itself a deletion at
            // the same revision.
            WriteModel::Tombstone { revision, .. } => {
                !(metadata.deleted && *revision == metadata.revision)
            }
        }
    }

    /// Whether the indexed state already covers `revision`.
    pub fn covers(&self, revision: Revision) -> bool {
        !self.revision().is_unwritten() && self.revision() >= revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;

    fn id() -> EntityId {
        EntityId::new("twin-7")
    }

    #[test]
    fn test_unwritten_model_needs_write_for_live_metadata() {
        let model = WriteModel::unwritten(id());
        let meta = Metadata::at(id(), Revision(1), EventKind::Created);
        assert!(model.needs_write(&meta));
        assert!(!model.needs_write(&Metadata::deleted(id())));
    }

    #[test]
    fn test_document_detects_tag_change_at_same_revision() {
        let meta = Metadata::at(id(), Revision(3), EventKind::Modified).with_tag("policy", 1);
        let model = WriteModel::target(&meta);
        assert!(!model.needs_write(&meta));

        let changed = meta.clone().with_tag("policy", 2);
        assert!(model.needs_write(&changed));
    }

    #[test]
    fn test_downgrade_forces_rebuild() {
        let meta = Metadata::at(id(), Revision(3), EventKind::Modified);
        let model = WriteModel::target(&meta).downgrade();
        assert!(model.is_full_rebuild());
        assert!(model.needs_write(&meta));
        assert!(!model.covers(Revision(1)));
    }

    #[test]
    fn test_tombstone_covers_deleted_metadata() {
        let meta = Metadata::at(id(), Revision(9), EventKind::Deleted);
        let model = WriteModel::target(&meta);
        assert!(model.is_full_rebuild());
        assert!(!model.needs_write(&meta));
        assert!(model.covers(Revision(9)));
        assert!(!model.covers(Revision(10)));
    }
}
