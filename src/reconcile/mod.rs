//! # Reconciliation
//!
//! Background detection of entities whose canonical revision and indexed
//! revision diverged. Two ID-ordered streams are merged and diffed; every
//! inconsistency becomes a targeted resync through the regular per-entity
//! update path.

pub mod bookmark;
pub mod coordinator;
pub mod diff;
pub mod source;
pub mod stream;

pub use bookmark::{Bookmark, BookmarkStore, FileBookmarkStore, MemoryBookmarkStore};
pub use coordinator::{
    CoordinatorSettings, CoordinatorStopper, PassSummary, ReconciliationCoordinator,
    ReconciliationStatus, ResyncSink, Severity, StatusBoard,
};
pub use diff::{compare, diff_sorted, DiffEntry, Inconsistency, InconsistencyKind, MergeDiff};
pub use source::{MemorySource, MetadataEntry, MetadataSource};
pub use stream::{ResumableStream, StreamSettings};
