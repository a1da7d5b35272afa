//! Storage backends.
//!
//! - [`file_store`]: the primary store, atomic JSON files on local disk
//! - [`traits`]: the narrow interface to the secondary (relational) store
//! - [`memory`]: an in-process secondary store for development and tests

pub mod file_store;
pub mod memory;
pub mod traits;

pub use file_store::AtomicFileStore;
pub use memory::{CallKind, InMemorySecondaryStore, RecordedCall};
pub use traits::{RemediationHook, RemediationOutcome, ReplicationError, SecondaryStore};
