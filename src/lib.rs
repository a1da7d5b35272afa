//! # Player State Engine
//!
//! A dual-store consistency engine for game backends: a local file store is
//! the source of truth, and a remote secondary store is kept eventually
//! consistent by asynchronous, batched, retrying replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         StateEngine                         │
//! │  • load / update / remove player state                     │
//! │  • catalog collection CRUD                                 │
//! │  • init / shutdown lifecycle                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 (PathMutex: one writer per file)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 StateCache / CollectionStore                │
//! │  • DashMap write-through cache keyed by file path          │
//! │  • Fallback: primary → secondary → defaults                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                (atomic write, then enqueue; never blocks)
//!                              ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │    AtomicFileStore (primary) │   │  SyncQueueManager        │
//! │  • temp file + fsync + rename│   │  • one queue per entity  │
//! │  • corrupt file quarantine   │   │  • coalescing by key     │
//! └──────────────────────────────┘   │  • retry, circuit breaker│
//!                                    └──────────────────────────┘
//!                                                 │
//!                                                 ▼
//!                                    ┌──────────────────────────┐
//!                                    │  SecondaryStore (remote) │
//!                                    └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use state_engine::{EngineConfig, InMemorySecondaryStore, PlayerKey, StateEngine};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> state_engine::Result<()> {
//!     let config = EngineConfig {
//!         data_dir: "./data".into(),
//!         ..Default::default()
//!     };
//!     let engine = StateEngine::new(config, Arc::new(InMemorySecondaryStore::new()));
//!     engine.init().await?;
//!
//!     let player = PlayerKey::new("123456789").with_username("alice");
//!     let state = engine.update(&player, json!({"points": 150})).await?;
//!     println!("points = {}", state.data["points"]);
//!
//!     let report = engine.shutdown().await?;
//!     assert!(report.fully_drained());
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees
//!
//! - **Primary first**: `update()` returns only after the primary store holds
//!   the merged record; replication failures never surface to callers
//! - **No lost updates**: concurrent writers of one file are serialized
//! - **Crash safety**: a file is either the old or the new document, never torn
//! - **Coalescing**: many updates to one key replicate as one call with the
//!   latest payload
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`StateEngine`] and its lifecycle
//! - [`cache`]: Write-through player state cache
//! - [`collections`]: Catalog collection CRUD
//! - [`sync_queue`]: Replication queues, retries, remediation
//! - [`storage`]: Primary file store and the secondary store contract
//! - [`path_mutex`]: Keyed async mutex with bounded waits
//! - [`batching`]: Coalescing batcher behind each queue
//! - [`resilience`]: Circuit breaker and retry delays

pub mod batching;
pub mod cache;
pub mod collections;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod path_mutex;
pub mod record;
pub mod resilience;
pub mod storage;
pub mod sync_queue;

pub use cache::{LoadSource, StateCache};
pub use collections::CollectionStore;
pub use config::{EngineConfig, QueueConfig};
pub use coordinator::{Collections, EngineState, EngineStatus, ShutdownReport, StateEngine};
pub use error::{EngineError, Result};
pub use metrics::LatencyTimer;
pub use path_mutex::PathMutex;
pub use record::{CollectionKind, Document, EntityKind, PlayerKey, Record};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryPolicy;
pub use storage::{
    AtomicFileStore, CallKind, InMemorySecondaryStore, RecordedCall, RemediationHook, RemediationOutcome,
    ReplicationError, SecondaryStore,
};
pub use sync_queue::{
    BatchReport, FailedEntry, FlushSummary, ManagerStatus, OpType, QueueStatus, QueuedOperation, SyncFunction,
    SyncOutcome, SyncQueue, SyncQueueManager,
};
