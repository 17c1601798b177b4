//! Unified configuration for twinsync components.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (twinsync.toml)
//! ```toml
//! [updater]
//! coalesce_ms = 50
//! idle_timeout_ms = 120000
//!
//! [reconciliation]
//! page_size = 1000
//! quiet_period_ms = 30000
//! bookmark_path = "/var/lib/twinsync/bookmark.json"
//! ```

mod defaults;

pub use defaults::*;

use crate::backoff::ExponentialBackoff;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for twinsync components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Per-entity updater behaviour
    pub updater: UpdaterConfig,
    /// Index write behaviour
    pub persistence: PersistenceConfig,
    /// Background reconciliation
    pub reconciliation: ReconciliationConfig,
    /// Simulation binary settings
    pub simulation: SimulationConfig,
}

impl SyncConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(SyncConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Env vars: TWINSYNC_UPDATER__COALESCE_MS=50
        figment = figment.merge(Env::prefixed("TWINSYNC_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Entity updater configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Mailbox capacity per entity
    pub mailbox_capacity: usize,
    /// Coalescing window (ms)
    pub coalesce_ms: u64,
    /// Idle timeout (ms)
    pub idle_timeout_ms: u64,
    /// Grace period before a deletion is persisted and the updater stops (ms)
    pub deletion_grace_ms: u64,
    /// First retry delay (ms)
    pub backoff_base_ms: u64,
    /// Maximum retry delay (ms)
    pub backoff_cap_ms: u64,
    /// Random spread of each retry delay
    pub backoff_jitter: f64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            coalesce_ms: DEFAULT_COALESCE_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            deletion_grace_ms: DEFAULT_DELETION_GRACE_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl UpdaterConfig {
    pub fn coalesce(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn deletion_grace(&self) -> Duration {
        Duration::from_millis(self.deletion_grace_ms)
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
        .with_jitter(self.backoff_jitter)
    }
}

/// Index write configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// A write without result after this long counts as a write error (ms)
    pub timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_PERSISTENCE_TIMEOUT_MS,
        }
    }
}

impl PersistenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Background reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Entries per fetched page
    pub page_size: usize,
    /// Rate cap per stream (entries/s, 0 = unlimited)
    pub max_entries_per_sec: u64,
    /// Consecutive fetch failures tolerated per stream
    pub stream_max_retries: u32,
    /// First stream retry delay (ms)
    pub stream_backoff_base_ms: u64,
    /// Maximum stream retry delay (ms)
    pub stream_backoff_cap_ms: u64,
    /// Persist the bookmark after this many decided entries
    pub bookmark_every_entries: u64,
    /// Persist the bookmark at least this often during a pass (ms)
    pub bookmark_interval_ms: u64,
    /// Pause between full passes (ms)
    pub quiet_period_ms: u64,
    /// Recently modified entities are skipped (ms)
    pub tolerance_window_ms: u64,
    /// Bookmark file; in-memory bookmark when unset
    pub bookmark_path: Option<PathBuf>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_entries_per_sec: DEFAULT_MAX_ENTRIES_PER_SEC,
            stream_max_retries: DEFAULT_STREAM_MAX_RETRIES,
            stream_backoff_base_ms: DEFAULT_STREAM_BACKOFF_BASE_MS,
            stream_backoff_cap_ms: DEFAULT_STREAM_BACKOFF_CAP_MS,
            bookmark_every_entries: DEFAULT_BOOKMARK_EVERY_ENTRIES,
            bookmark_interval_ms: DEFAULT_BOOKMARK_INTERVAL_MS,
            quiet_period_ms: DEFAULT_QUIET_PERIOD_MS,
            tolerance_window_ms: DEFAULT_TOLERANCE_WINDOW_MS,
            bookmark_path: None,
        }
    }
}

impl ReconciliationConfig {
    pub fn stream_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.stream_backoff_base_ms),
            Duration::from_millis(self.stream_backoff_cap_ms),
        )
    }

    pub fn bookmark_interval(&self) -> Duration {
        Duration::from_millis(self.bookmark_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn tolerance_window(&self) -> Duration {
        Duration::from_millis(self.tolerance_window_ms)
    }
}

/// Simulation binary configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of simulated entities
    pub entities: usize,
    /// Change events per second
    pub events_per_sec: u64,
    /// Probability that an index write fails
    pub write_failure_rate: f64,
    /// Probability per second that an indexed entry silently drifts
    pub drift_rate: f64,
    /// Stop after this many seconds (run until Ctrl-C when unset)
    pub duration_secs: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            entities: DEFAULT_SIM_ENTITIES,
            events_per_sec: DEFAULT_SIM_EVENTS_PER_SEC,
            write_failure_rate: 0.01,
            drift_rate: 0.5,
            duration_secs: None,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<SimulationOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmark_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet_period_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
