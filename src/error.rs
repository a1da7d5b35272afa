//! Error taxonomy for the engine.
//!
//! Validation and not-found errors surface to the caller. Corrupt state is
//! recovered internally (quarantine + rebuild) and only surfaces when the
//! recovery itself fails. Replication errors live in
//! [`crate::storage::traits::ReplicationError`] and never reach `update()`
//! callers.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad key or patch, rejected before any mutation
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// A document on disk could not be decoded
    #[error("corrupt state in {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    /// The per-key lock could not be acquired within its budget
    #[error("lock timeout on '{key}' after {waited_ms}ms ({queue_depth} waiting)")]
    LockTimeout {
        key: String,
        waited_ms: u64,
        queue_depth: usize,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Engine used before `init()` or after `shutdown()`
    #[error("engine is not running (state={0})")]
    NotRunning(String),
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short label used for metrics and structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::CorruptState { .. } => "corrupt",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Io { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::NotRunning(_) => "not_running",
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
