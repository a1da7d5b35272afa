// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! State engine coordinator.
//!
//! The [`StateEngine`] is the single entry point that ties together all
//! components:
//! - [`AtomicFileStore`]: the primary store, source of truth
//! - [`PathMutex`]: per-path serialization of read-modify-write cycles
//! - [`StateCache`]: write-through player state cache
//! - [`CollectionStore`]: catalog collection CRUD
//! - [`SyncQueueManager`]: asynchronous replication to the secondary store
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use state_engine::{EngineConfig, EngineState, InMemorySecondaryStore, PlayerKey, StateEngine};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> state_engine::Result<()> {
//! let engine = StateEngine::new(EngineConfig::default(), Arc::new(InMemorySecondaryStore::new()));
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.init().await?;
//! let player = PlayerKey::new("1");
//! engine.update(&player, json!({"points": 150})).await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{EngineState, EngineStatus, ShutdownReport};

use std::ops::Deref;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Semaphore, SemaphorePermit};
use tracing::info;

use crate::cache::StateCache;
use crate::collections::CollectionStore;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::path_mutex::PathMutex;
use crate::record::{EntityKind, PlayerKey, Record};
use crate::storage::file_store::AtomicFileStore;
use crate::storage::traits::{RemediationHook, SecondaryStore};
use crate::sync_queue::SyncQueueManager;

/// Backlog file left by a shutdown that could not drain every queue.
pub(crate) const BACKLOG_FILE: &str = ".sync-backlog.json";

/// Upper bound on concurrently admitted engine calls.
const MAX_REQUESTS: u32 = 1 << 20;

/// Access to catalog collection CRUD, counted as an in-flight engine call
/// until dropped. Shutdown waits for it before draining replication.
pub struct Collections<'a> {
    store: &'a CollectionStore,
    _permit: SemaphorePermit<'a>,
}

impl Deref for Collections<'_> {
    type Target = CollectionStore;

    fn deref(&self) -> &CollectionStore {
        self.store
    }
}

/// Main coordinator for player state and catalog collections.
///
/// One instance owns one data directory. All methods take `&self`, so the
/// engine is typically shared as `Arc<StateEngine>` across request handlers.
pub struct StateEngine {
    pub(super) config: EngineConfig,

    /// Lifecycle state, observable through `state_receiver()`
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) files: Arc<AtomicFileStore>,
    pub(super) locks: Arc<PathMutex>,
    pub(super) cache: StateCache,
    pub(super) collections: CollectionStore,
    pub(super) queues: Arc<SyncQueueManager>,

    /// One permit per admitted call; shutdown takes them all back
    pub(super) requests: Semaphore,
}

impl StateEngine {
    /// Create an engine over `config.data_dir`. Nothing touches the disk or
    /// the secondary store until [`init()`](Self::init).
    pub fn new(config: EngineConfig, secondary: Arc<dyn SecondaryStore>) -> Self {
        let (state, state_rx) = watch::channel(EngineState::Created);
        let files = Arc::new(AtomicFileStore::new(config.data_dir.clone()));
        let locks = Arc::new(PathMutex::new(config.lock_timeout()));
        let queues = Arc::new(SyncQueueManager::new(&config, Arc::clone(&secondary), Arc::clone(&locks)));

        let cache = StateCache::new(
            Arc::clone(&files),
            Arc::clone(&locks),
            Arc::clone(&queues),
            secondary,
            config.player_defaults.clone(),
            config.secondary_timeout(),
        );
        let collections = CollectionStore::new(Arc::clone(&files), Arc::clone(&locks), Arc::clone(&queues));

        info!(data_dir = %config.data_dir.display(), "State engine created");

        Self {
            config,
            state,
            state_rx,
            files,
            locks,
            cache,
            collections,
            queues,
            requests: Semaphore::new(MAX_REQUESTS as usize),
        }
    }

    /// Builder form of [`set_remediation_hook`](Self::set_remediation_hook).
    #[must_use]
    pub fn with_remediation_hook(self, entity: EntityKind, hook: Arc<dyn RemediationHook>) -> Self {
        self.set_remediation_hook(entity, hook);
        self
    }

    /// Install the hook consulted when `entity` replication fails permanently.
    pub fn set_remediation_hook(&self, entity: EntityKind, hook: Arc<dyn RemediationHook>) {
        self.queues.set_remediation_hook(entity, hook);
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Admit a call while `Running`. The permit is taken before the state is
    /// checked, so a shutdown that has begun either refuses the call or waits
    /// for it.
    fn admit(&self) -> Result<SemaphorePermit<'_>> {
        let permit = self
            .requests
            .try_acquire()
            .map_err(|_| EngineError::NotRunning(self.state().to_string()))?;
        match self.state() {
            EngineState::Running => Ok(permit),
            other => Err(EngineError::NotRunning(other.to_string())),
        }
    }

    /// Engine calls admitted and not yet finished.
    #[must_use]
    pub fn active_requests(&self) -> usize {
        (MAX_REQUESTS as usize).saturating_sub(self.requests.available_permits())
    }

    fn set_state(&self, next: EngineState) {
        self.state.send_replace(next);
        crate::metrics::set_engine_state(&next.to_string());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Player state
    // ═══════════════════════════════════════════════════════════════════════

    /// Current state of a player, created from defaults on first contact.
    #[tracing::instrument(skip(self, key), fields(player = %key))]
    pub async fn load(&self, key: &PlayerKey) -> Result<Record> {
        let _permit = self.admit()?;
        self.cache.load(key).await
    }

    /// Shallow-merge `patch` into the player's state.
    ///
    /// Returns once the primary store holds the merged record. Replication
    /// happens later and its failures never surface here.
    #[tracing::instrument(skip(self, key, patch), fields(player = %key))]
    pub async fn update(&self, key: &PlayerKey, patch: Value) -> Result<Record> {
        let _permit = self.admit()?;
        self.cache.update(key, patch).await
    }

    /// Delete a player from the primary store and replicate the delete.
    pub async fn remove(&self, key: &PlayerKey) -> Result<Record> {
        let _permit = self.admit()?;
        self.cache.remove(key).await
    }

    /// Drop a cached player so the next load re-reads the primary store.
    pub fn invalidate(&self, key: &PlayerKey) -> bool {
        self.cache.invalidate(key)
    }

    #[must_use]
    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Collections and replication
    // ═══════════════════════════════════════════════════════════════════════

    /// Catalog collection CRUD. Returns `NotRunning` outside `Running`.
    ///
    /// Keep the handle only as long as the calls made through it; shutdown
    /// waits for it to drop.
    pub fn collections(&self) -> Result<Collections<'_>> {
        let permit = self.admit()?;
        Ok(Collections {
            store: &self.collections,
            _permit: permit,
        })
    }

    #[must_use]
    pub fn queues(&self) -> &Arc<SyncQueueManager> {
        &self.queues
    }

    /// Force one flush of every queue, ignoring batch thresholds.
    pub async fn flush_all(&self) -> Result<crate::sync_queue::FlushSummary> {
        self.queues.flush_all().await
    }

    /// Give a failed entry a fresh retry budget. Returns false if `key` has
    /// no failed entry on that queue.
    pub fn retry_failed(&self, entity: EntityKind, key: &str) -> bool {
        self.queues.queue(entity).retry_failed(key)
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            cached_players: self.cache.len(),
            active_locks: self.locks.active_keys(),
            active_requests: self.active_requests(),
            replication: self.queues.status(),
        }
    }
}
