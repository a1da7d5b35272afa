use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use super::operation::{FailedEntry, OpType, QueuedOperation};
use super::queue::{FlushSummary, QueueStatus, SyncQueue};
use super::sync_fn::{StoreSyncFunction, SyncFunction};
use crate::batching::FlushReason;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::path_mutex::PathMutex;
use crate::record::{Document, EntityKind};
use crate::storage::traits::{RemediationHook, SecondaryStore};

/// An entry that outlived shutdown, persisted for the next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogEntry {
    pub entity: EntityKind,
    pub operation: QueuedOperation<Document>,
    /// Set for entries that were parked as failed; they are restored parked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailedEntry>,
}

/// Status of every queue.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub queues: Vec<QueueStatus>,
    pub total_pending: usize,
    pub total_failed: usize,
}

/// Owns one [`SyncQueue`] per entity type and their workers.
pub struct SyncQueueManager {
    queues: [Arc<SyncQueue<Document>>; EntityKind::ALL.len()],
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncQueueManager {
    pub fn new(config: &EngineConfig, store: Arc<dyn SecondaryStore>, locks: Arc<PathMutex>) -> Self {
        let queues = EntityKind::ALL.map(|entity| {
            let queue_config = if entity.is_catalog() {
                config.catalog_queue.clone()
            } else {
                config.player_queue.clone()
            };
            let sync_fn: Arc<dyn SyncFunction<Document>> =
                Arc::new(StoreSyncFunction::new(entity, Arc::clone(&store), config.secondary_timeout()));
            Arc::new(
                SyncQueue::new(entity.as_str(), queue_config, sync_fn, Arc::clone(&locks), config.secondary_timeout())
                    .with_history_capacity(config.history_capacity),
            )
        });
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            queues,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn queue(&self, entity: EntityKind) -> &Arc<SyncQueue<Document>> {
        &self.queues[entity.index()]
    }

    pub fn enqueue(&self, entity: EntityKind, key: impl Into<String>, payload: Document, op_type: OpType) {
        self.queue(entity).enqueue(key, payload, op_type);
    }

    pub fn set_remediation_hook(&self, entity: EntityKind, hook: Arc<dyn RemediationHook>) {
        self.queue(entity).set_remediation_hook(hook);
    }

    /// Spawn the flush workers. Returns false if they are already running.
    pub fn start(&self) -> bool {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return false;
        }
        self.shutdown_tx.send_replace(false);
        for queue in &self.queues {
            workers.push(queue.spawn_worker(self.shutdown_tx.subscribe()));
        }
        info!(queues = self.queues.len(), "Sync workers started");
        true
    }

    /// Flush every queue once, in entity order.
    pub async fn flush_all(&self) -> Result<FlushSummary> {
        let mut total = FlushSummary::default();
        for queue in &self.queues {
            let summary = queue.flush(FlushReason::Manual).await?;
            total.attempted += summary.attempted;
            total.synced += summary.synced;
            total.retrying += summary.retrying;
            total.failed += summary.failed;
        }
        Ok(total)
    }

    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        let queues: Vec<QueueStatus> = self.queues.iter().map(|q| q.status()).collect();
        ManagerStatus {
            total_pending: queues.iter().map(|q| q.pending + q.in_flight).sum(),
            total_failed: queues.iter().map(|q| q.failed.len()).sum(),
            queues,
        }
    }

    /// Stop the workers, drain every queue concurrently within `grace`, and
    /// return whatever is left (pending or failed).
    ///
    /// A worker whose flush is still running at the deadline is aborted; the
    /// entries that flush had not settled stay in the backlog.
    pub async fn shutdown(&self, grace: Duration) -> Vec<BacklogEntry> {
        let start = Instant::now();
        self.shutdown_tx.send_replace(true);
        let workers = std::mem::take(&mut *self.workers.lock());
        for mut worker in workers {
            let left = grace.saturating_sub(start.elapsed());
            match tokio::time::timeout(left, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Sync worker ended abnormally"),
                Err(_) => {
                    warn!("Sync worker still running at the grace deadline, aborting");
                    worker.abort();
                    // Resolves once the task is dropped and its flush has
                    // handed its entries back
                    let _ = worker.await;
                }
            }
        }

        let left = grace.saturating_sub(start.elapsed());
        let mut drains = JoinSet::new();
        for queue in &self.queues {
            let queue = Arc::clone(queue);
            drains.spawn(async move { queue.drain(left).await });
        }
        while let Some(result) = drains.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Queue drain task failed");
            }
        }

        let mut backlog = Vec::new();
        for (entity, queue) in EntityKind::ALL.iter().zip(&self.queues) {
            backlog.extend(queue.take_backlog().into_iter().map(|(operation, failure)| BacklogEntry {
                entity: *entity,
                operation,
                failure,
            }));
        }
        if backlog.is_empty() {
            info!(elapsed_ms = start.elapsed().as_millis() as u64, "Sync queues drained");
        } else {
            warn!(remaining = backlog.len(), "Sync queues not fully drained within grace period");
        }
        backlog
    }

    /// Put back entries persisted by an earlier shutdown: pending ones are
    /// re-enqueued, failed ones stay parked with their diagnostic.
    pub fn restore(&self, backlog: Vec<BacklogEntry>) -> usize {
        let count = backlog.len();
        for entry in backlog {
            let queue = self.queue(entry.entity);
            match entry.failure {
                Some(failure) => queue.restore_failed(entry.operation, failure),
                None => queue.restore(entry.operation),
            }
        }
        count
    }
}
