//! Asynchronous replication from the primary store to the secondary store.
//!
//! One [`SyncQueue`] per entity type, owned by the [`SyncQueueManager`].
//! Entries coalesce by key, flush in batches through a [`SyncFunction`], and
//! retry transient failures with a linear backoff.

pub mod manager;
pub mod operation;
pub mod queue;
pub mod sync_fn;

pub use manager::{BacklogEntry, ManagerStatus, SyncQueueManager};
pub use operation::{FailedEntry, OpType, QueuedOperation, SyncOutcome};
pub use queue::{FlushSummary, QueueStatus, SyncQueue};
pub use sync_fn::{BatchReport, StoreSyncFunction, SyncFunction};
