//! Entries held by a sync queue and the records they leave behind.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::batching::BatchableItem;
use crate::record::now_millis;

/// Kind of change to replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Create,
    Update,
    Delete,
}

impl OpType {
    /// Operation to send when `incoming` arrives for a key already pending as `self`.
    ///
    /// A pending create stays a create (the row does not exist yet). A delete
    /// always wins. A create or update arriving after a pending delete
    /// replaces it, since the record exists again.
    #[must_use]
    pub fn coalesce(self, incoming: OpType) -> OpType {
        match (self, incoming) {
            (_, OpType::Delete) => OpType::Delete,
            (OpType::Create, OpType::Update) => OpType::Create,
            (_, incoming) => incoming,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending replication for a key.
///
/// Lifecycle: pending, in flight, then either done (recorded in history),
/// back to pending with a retry delay, or permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation<T> {
    pub key: String,
    pub payload: T,
    pub op_type: OpType,
    /// Epoch millis of the first enqueue for this key
    pub enqueued_at: i64,
    /// Failed attempts so far; never reset by coalescing
    pub retries: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    not_before: Option<Instant>,
}

impl<T> QueuedOperation<T> {
    pub fn new(key: impl Into<String>, payload: T, op_type: OpType) -> Self {
        Self {
            key: key.into(),
            payload,
            op_type,
            enqueued_at: now_millis(),
            retries: 0,
            last_error: None,
            not_before: None,
        }
    }

    /// Hold the entry back for `delay`.
    pub fn defer(&mut self, delay: Duration) {
        self.not_before = Some(Instant::now() + delay);
    }

    /// Make the entry eligible for the next flush.
    pub fn clear_delay(&mut self) {
        self.not_before = None;
    }

    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.not_before.is_some_and(|t| t > Instant::now())
    }

    /// Fold a failed in-flight attempt into this newer entry for the same key.
    ///
    /// The newer payload wins; the operation type, retry count, error, and
    /// backoff of the older attempt carry over.
    pub(crate) fn absorb_failed_attempt(&mut self, older: &QueuedOperation<T>) {
        self.op_type = older.op_type.coalesce(self.op_type);
        if older.retries > self.retries {
            self.retries = older.retries;
        }
        if older.last_error.is_some() {
            self.last_error.clone_from(&older.last_error);
        }
        if older.not_before > self.not_before {
            self.not_before = older.not_before;
        }
    }
}

impl<T> BatchableItem for QueuedOperation<T> {
    fn id(&self) -> &str {
        &self.key
    }

    // Keeps the first enqueue time, retry count, and backoff; takes the
    // newest payload.
    fn coalesce(&mut self, newer: Self) {
        self.op_type = self.op_type.coalesce(newer.op_type);
        self.payload = newer.payload;
        if newer.retries > self.retries {
            self.retries = newer.retries;
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| now >= t)
    }
}

/// Diagnostic left behind by an entry that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub queue: String,
    pub key: String,
    pub op_type: OpType,
    pub retries: u32,
    pub last_error: String,
    /// Set for integrity failures that need a dependency cleared first
    pub requires_remediation: bool,
    pub failed_at: i64,
}

/// A successfully replicated entry, kept in a bounded history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub key: String,
    pub op_type: OpType,
    /// Failed attempts before the one that succeeded
    pub retries: u32,
    pub batch_id: String,
    pub completed_at: i64,
}
