//! Default constants for twinsync configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Entity Updater Defaults
// =============================================================================

/// Capacity of each entity updater's mailbox.
/// Senders wait once it is full, which throttles producers per entity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Coalescing window between the first change and the flush (milliseconds)
pub const DEFAULT_COALESCE_MS: u64 = 100;

/// Idle time after which a clean updater stops (milliseconds)
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Grace period between a deletion and persisting the tombstone (milliseconds)
pub const DEFAULT_DELETION_GRACE_MS: u64 = 30 * 1000;

// =============================================================================
// Backoff Defaults
// =============================================================================

/// First retry delay (milliseconds)
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 200;

/// Maximum retry delay (milliseconds)
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 60 * 1000;

/// Random spread applied to each delay, as a fraction of the delay
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

// =============================================================================
// Persistence Defaults
// =============================================================================

/// A persistence attempt without result after this long is a write error (milliseconds)
pub const DEFAULT_PERSISTENCE_TIMEOUT_MS: u64 = 10 * 1000;

// =============================================================================
// Reconciliation Defaults
// =============================================================================

/// Entries fetched per page from each metadata source
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Rate cap per metadata stream (entries per second, 0 = unlimited)
pub const DEFAULT_MAX_ENTRIES_PER_SEC: u64 = 2_000;

/// Consecutive failed fetches a stream tolerates before giving up the pass
pub const DEFAULT_STREAM_MAX_RETRIES: u32 = 5;

/// First stream retry delay (milliseconds)
pub const DEFAULT_STREAM_BACKOFF_BASE_MS: u64 = 500;

/// Maximum stream retry delay (milliseconds)
pub const DEFAULT_STREAM_BACKOFF_CAP_MS: u64 = 30 * 1000;

/// Persist the bookmark after this many decided entries
pub const DEFAULT_BOOKMARK_EVERY_ENTRIES: u64 = 1_000;

/// Persist the bookmark at least this often while a pass is running (milliseconds)
pub const DEFAULT_BOOKMARK_INTERVAL_MS: u64 = 10 * 1000;

/// Pause between two full reconciliation passes (milliseconds)
pub const DEFAULT_QUIET_PERIOD_MS: u64 = 60 * 1000;

/// Entities modified more recently than this are considered in flight (milliseconds)
pub const DEFAULT_TOLERANCE_WINDOW_MS: u64 = 20 * 1000;

// =============================================================================
// Simulation Defaults
// =============================================================================

/// Number of simulated entities
pub const DEFAULT_SIM_ENTITIES: usize = 1_000;

/// Change events generated per second
pub const DEFAULT_SIM_EVENTS_PER_SEC: u64 = 500;
