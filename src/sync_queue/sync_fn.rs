use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::operation::{OpType, QueuedOperation};
use crate::record::{Document, EntityKind};
use crate::storage::traits::{ReplicationError, SecondaryStore};

/// Per-key result of a batch that was at least partly applied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Keys that failed, with the classified error. Missing keys succeeded.
    pub failures: HashMap<String, ReplicationError>,
}

impl BatchReport {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, key: impl Into<String>, error: ReplicationError) {
        self.failures.insert(key.into(), error);
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sends one batch of coalesced operations to the secondary store.
///
/// `Err` means the whole batch failed and every entry is retried with the
/// given classification. `Ok` carries per-key failures.
#[async_trait]
pub trait SyncFunction<T>: Send + Sync {
    async fn sync_batch(&self, batch: &[QueuedOperation<T>]) -> Result<BatchReport, ReplicationError>;
}

/// Applies queued documents to a [`SecondaryStore`], one call per entry.
///
/// Every call is bounded by `call_timeout` on its own, so a hung call fails
/// only its entry and the entries already applied stay applied.
pub struct StoreSyncFunction {
    entity: EntityKind,
    store: Arc<dyn SecondaryStore>,
    call_timeout: Duration,
}

impl StoreSyncFunction {
    pub fn new(entity: EntityKind, store: Arc<dyn SecondaryStore>, call_timeout: Duration) -> Self {
        Self {
            entity,
            store,
            call_timeout,
        }
    }

    async fn apply(&self, op: &QueuedOperation<Document>) -> Result<(), ReplicationError> {
        let call = async {
            match op.op_type {
                OpType::Create => self.store.create_record(self.entity, &op.key, &op.payload).await,
                OpType::Update => self.store.update_record(self.entity, &op.key, &op.payload).await,
                OpType::Delete => self.store.delete_record(self.entity, &op.key).await,
            }
        };
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_timeout(self.entity.as_str());
                Err(ReplicationError::Transient(format!(
                    "secondary store timed out after {}ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl SyncFunction<Document> for StoreSyncFunction {
    async fn sync_batch(&self, batch: &[QueuedOperation<Document>]) -> Result<BatchReport, ReplicationError> {
        let mut report = BatchReport::success();

        for op in batch {
            if let Err(e) = self.apply(op).await {
                debug!(entity = %self.entity, key = %op.key, op = %op.op_type, error = %e, "Secondary call failed");
                report.fail(op.key.clone(), e);
            }
        }

        // Nothing landed and nothing is integrity related: treat as an outage
        // so the circuit breaker sees it
        if !batch.is_empty()
            && report.failures.len() == batch.len()
            && report.failures.values().all(ReplicationError::is_transient)
        {
            let first = batch
                .iter()
                .find_map(|op| report.failures.remove(&op.key));
            if let Some(err) = first {
                return Err(err);
            }
        }
        Ok(report)
    }
}
