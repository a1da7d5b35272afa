//! Configuration for the state engine.
//!
//! # Example
//!
//! ```
//! use state_engine::{EngineConfig, QueueConfig};
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.lock_timeout_ms, 5_000);
//!
//! // Custom data directory and a faster player queue
//! let config = EngineConfig {
//!     data_dir: "/var/lib/game/state".into(),
//!     player_queue: QueueConfig {
//!         flush_interval_ms: 250,
//!         ..QueueConfig::player_state()
//!     },
//!     ..Default::default()
//! };
//! assert_eq!(config.player_queue.batch_size, 10);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::record::Document;

/// Configuration for the state engine.
///
/// All fields have defaults. Production deployments usually only set
/// `data_dir`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Root of the primary store (exclusively owned by the engine)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Max wait for a per-path lock before failing with `LockTimeout`
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Max duration of any single secondary-store call
    #[serde(default = "default_secondary_timeout_ms")]
    pub secondary_timeout_ms: u64,

    /// Bounded grace period for draining replication at shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Completed replications kept per queue for diagnostics
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Player-state queue tuning (high volume, low per-item risk)
    #[serde(default = "QueueConfig::player_state")]
    pub player_queue: QueueConfig,

    /// Catalog collection queue tuning (rare, admin-driven, high value)
    #[serde(default = "QueueConfig::catalog")]
    pub catalog_queue: QueueConfig,

    /// Document used for a player absent from both stores
    #[serde(default = "default_player_document")]
    pub player_defaults: Document,
}

fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_lock_timeout_ms() -> u64 { 5_000 }
fn default_secondary_timeout_ms() -> u64 { 10_000 }
fn default_shutdown_grace_ms() -> u64 { 10_000 }
fn default_history_capacity() -> usize { 256 }

/// Built-in defaults for a fresh player.
pub fn default_player_document() -> Document {
    let value = json!({
        "points": 0,
        "energy": 1000,
        "maxEnergy": 1000,
        "level": 1,
        "experience": 0,
        "totalTaps": 0,
        "currentCharacter": "default",
        "unlockedCharacters": ["default"],
        "upgrades": {},
        "completedTasks": [],
    });
    match value {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
            secondary_timeout_ms: default_secondary_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            history_capacity: default_history_capacity(),
            player_queue: QueueConfig::player_state(),
            catalog_queue: QueueConfig::catalog(),
            player_defaults: default_player_document(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn secondary_timeout(&self) -> Duration {
        Duration::from_millis(self.secondary_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Tuning for one replication queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Pending entries that trigger an immediate flush
    pub batch_size: usize,
    /// Periodic flush interval
    pub flush_interval_ms: u64,
    /// Attempts before an entry is marked permanently failed
    pub max_retries: u32,
    /// Base retry delay; the n-th retry waits `retry_delay_ms * n`
    pub retry_delay_ms: u64,
    /// Upper bound for the computed retry delay
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

fn default_max_retry_delay_ms() -> u64 { 60_000 }

impl QueueConfig {
    /// Small batches, short interval.
    #[must_use]
    pub fn player_state() -> Self {
        Self {
            batch_size: 10,
            flush_interval_ms: 1_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }

    /// Larger batches, longer interval, more retries.
    #[must_use]
    pub fn catalog() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 5_000,
            max_retries: 5,
            retry_delay_ms: 2_000,
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
