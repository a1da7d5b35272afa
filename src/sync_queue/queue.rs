//! A single coalescing replication queue.
//!
//! Writers call [`SyncQueue::enqueue`], which never touches the secondary
//! store and never blocks on I/O. A background worker flushes on a fixed
//! interval, or early once `batch_size` distinct keys are pending. Flushes of
//! one queue never overlap: they are serialized through the engine's
//! [`PathMutex`] under the key `sync-queue:<name>`.
//!
//! Failure handling per entry:
//! - transient: retried after `retry_delay * retries`, up to `max_retries`
//! - permanent: parked as a [`FailedEntry`] needing remediation, then handed
//!   to the queue's [`RemediationHook`] if one is registered
//! - rejected by the open circuit breaker: deferred until the breaker may
//!   half-open, without using up a retry
//!
//! A dispatched batch is left to finish. Only shutdown cuts one short, at
//! its grace deadline; entries a flush had taken but not yet settled then go
//! back to pending unchanged, for the backlog.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::operation::{FailedEntry, OpType, QueuedOperation, SyncOutcome};
use super::sync_fn::SyncFunction;
use crate::batching::{BatchConfig, CoalescingBatcher, FlushReason};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::path_mutex::PathMutex;
use crate::record::now_millis;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitStats};
use crate::resilience::retry::RetryPolicy;
use crate::storage::traits::{RemediationHook, RemediationOutcome, ReplicationError};

const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// What one flush did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub attempted: usize,
    pub synced: usize,
    /// Re-queued after a transient failure
    pub retrying: usize,
    /// Moved to the failed set
    pub failed: usize,
}

impl FlushSummary {
    fn absorb(&mut self, other: FlushSummary) {
        self.attempted += other.attempted;
        self.synced += other.synced;
        self.retrying += other.retrying;
        self.failed += other.failed;
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub pending: usize,
    pub in_flight: usize,
    pub failed: Vec<FailedEntry>,
    /// Completed entries currently kept in history
    pub history: usize,
    pub synced_total: u64,
    pub failed_total: u64,
    pub oldest_pending_ms: Option<u64>,
    pub circuit: CircuitStats,
}

struct FailedSlot<T> {
    entry: FailedEntry,
    op: QueuedOperation<T>,
}

struct QueueState<T> {
    pending: CoalescingBatcher<QueuedOperation<T>>,
    in_flight: HashMap<String, OpType>,
    failed: BTreeMap<String, FailedSlot<T>>,
    history: VecDeque<SyncOutcome>,
}

impl<T> QueueState<T> {
    // A newer payload enqueued while this one was in flight takes precedence.
    fn requeue(&mut self, op: QueuedOperation<T>) {
        if let Some(newer) = self.pending.get_mut(&op.key) {
            newer.absorb_failed_attempt(&op);
        } else {
            self.pending.push(op);
        }
    }
}

/// Entries a flush has taken out of pending and not yet settled.
struct InFlight<'a, T> {
    state: &'a Mutex<QueueState<T>>,
    ops: Vec<QueuedOperation<T>>,
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if self.ops.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for op in self.ops.drain(..) {
            state.in_flight.remove(&op.key);
            state.requeue(op);
        }
    }
}

pub struct SyncQueue<T> {
    name: String,
    config: QueueConfig,
    retry: RetryPolicy,
    state: Mutex<QueueState<T>>,
    sync_fn: Arc<dyn SyncFunction<T>>,
    remediation: RwLock<Option<Arc<dyn RemediationHook>>>,
    circuit: CircuitBreaker,
    locks: Arc<PathMutex>,
    call_timeout: Duration,
    history_capacity: usize,
    wake: Notify,
    synced_total: AtomicU64,
    failed_total: AtomicU64,
}

impl<T: Send + Sync + 'static> SyncQueue<T> {
    pub fn new(
        name: impl Into<String>,
        config: QueueConfig,
        sync_fn: Arc<dyn SyncFunction<T>>,
        locks: Arc<PathMutex>,
        call_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let batcher = CoalescingBatcher::new(BatchConfig {
            flush_count: config.batch_size.max(1),
        });
        Self {
            circuit: CircuitBreaker::new(name.clone(), CircuitConfig::default()),
            retry: RetryPolicy::from(&config),
            name,
            config,
            state: Mutex::new(QueueState {
                pending: batcher,
                in_flight: HashMap::new(),
                failed: BTreeMap::new(),
                history: VecDeque::new(),
            }),
            sync_fn,
            remediation: RwLock::new(None),
            locks,
            call_timeout,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            wake: Notify::new(),
            synced_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = CircuitBreaker::new(self.name.clone(), config);
        self
    }

    pub fn set_remediation_hook(&self, hook: Arc<dyn RemediationHook>) {
        *self.remediation.write() = Some(hook);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Record a change for replication, coalescing with any pending entry
    /// for the same key.
    pub fn enqueue(&self, key: impl Into<String>, payload: T, op_type: OpType) {
        let key = key.into();
        let (trigger, pending) = {
            let mut state = self.state.lock();
            // The new payload supersedes a failed one, but not its operation:
            // a create that never landed must still go out as a create
            let superseded = state.failed.remove(&key);
            let trigger = state.pending.push(QueuedOperation::new(key.clone(), payload, op_type));
            if let Some(slot) = superseded {
                if let Some(op) = state.pending.get_mut(&key) {
                    op.op_type = slot.op.op_type.coalesce(op.op_type);
                }
            }
            (trigger, state.pending.len())
        };
        debug!(queue = %self.name, key = %key, op = %op_type, pending, "Enqueued for replication");
        if trigger.is_some() {
            self.wake.notify_one();
        }
    }

    /// Put back an entry carried over from a previous run, keeping its retry count.
    pub fn restore(&self, mut op: QueuedOperation<T>) {
        op.clear_delay();
        let mut state = self.state.lock();
        state.pending.push(op);
    }

    /// Put back a failed entry carried over from a previous run. It stays
    /// parked until [`retry_failed`](Self::retry_failed) or a newer enqueue.
    pub fn restore_failed(&self, op: QueuedOperation<T>, entry: FailedEntry) {
        let mut state = self.state.lock();
        state.failed.insert(op.key.clone(), FailedSlot { entry, op });
    }

    /// Flush everything that is due. Waits for any flush already running.
    pub async fn flush(&self, reason: FlushReason) -> Result<FlushSummary> {
        let gate = format!("sync-queue:{}", self.name);
        self.locks.with_lock(&gate, || self.flush_locked(reason)).await
    }

    async fn flush_locked(&self, reason: FlushReason) -> FlushSummary {
        let start = Instant::now();
        let mut taken = {
            let mut state = self.state.lock();
            let batch = state.pending.take_due(Instant::now(), reason);
            for op in &batch {
                state.in_flight.insert(op.key.clone(), op.op_type);
            }
            InFlight {
                state: &self.state,
                ops: batch,
            }
        };

        let mut summary = FlushSummary::default();
        if taken.ops.is_empty() {
            return summary;
        }

        let chunk_size = self.config.batch_size.max(1);
        while !taken.ops.is_empty() {
            let n = taken.ops.len().min(chunk_size);
            summary.absorb(self.dispatch(&mut taken, n, reason).await);
        }

        crate::metrics::record_flush_duration(&self.name, start.elapsed());
        self.publish_depths();
        debug!(
            queue = %self.name,
            %reason,
            attempted = summary.attempted,
            synced = summary.synced,
            retrying = summary.retrying,
            failed = summary.failed,
            "Flush complete"
        );
        summary
    }

    /// Send the first `n` taken entries as one batch and settle them.
    async fn dispatch(&self, taken: &mut InFlight<'_, T>, n: usize, reason: FlushReason) -> FlushSummary {
        let batch_id = Uuid::new_v4().to_string();
        crate::metrics::record_batch_size(&self.name, n);

        // Store calls carry their own timeout; this bounds sync functions that do not
        let ceiling = self
            .call_timeout
            .saturating_mul(u32::try_from(n).unwrap_or(u32::MAX).saturating_add(1));
        let outcome = {
            let batch = &taken.ops[..n];
            self.circuit
                .call(|| async {
                    match tokio::time::timeout(ceiling, self.sync_fn.sync_batch(batch)).await {
                        Ok(result) => result,
                        Err(_) => {
                            crate::metrics::record_timeout(&self.name);
                            Err(ReplicationError::Transient(format!(
                                "batch timed out after {}ms",
                                ceiling.as_millis()
                            )))
                        }
                    }
                })
                .await
        };
        let chunk: Vec<QueuedOperation<T>> = taken.ops.drain(..n).collect();

        let (batch_error, mut failures) = match outcome {
            Ok(report) => (None, report.failures),
            Err(CircuitError::Inner(e)) => (Some(e), HashMap::new()),
            Err(CircuitError::Rejected) => return self.defer_rejected(chunk),
        };
        if let Some(err) = &batch_error {
            warn!(queue = %self.name, batch_id = %batch_id, size = chunk.len(), error = %err, "Batch replication failed");
        }

        let mut summary = FlushSummary {
            attempted: chunk.len(),
            ..Default::default()
        };
        let mut to_remediate = Vec::new();
        {
            let mut state = self.state.lock();
            for mut op in chunk {
                state.in_flight.remove(&op.key);
                let error = batch_error.clone().or_else(|| failures.remove(&op.key));

                let Some(err) = error else {
                    self.record_success(&mut state, op, &batch_id);
                    summary.synced += 1;
                    continue;
                };

                op.retries += 1;
                op.last_error = Some(err.message().to_string());
                match err {
                    // Shutdown leaves transient failures pending for the backlog
                    ReplicationError::Transient(_) if reason.ignores_delay() || self.retry.should_retry(op.retries) => {
                        op.defer(self.retry.delay_for(op.retries));
                        debug!(queue = %self.name, key = %op.key, retries = op.retries, "Retrying after transient failure");
                        state.requeue(op);
                        summary.retrying += 1;
                    }
                    ReplicationError::Transient(_) => {
                        self.park_failed(&mut state, op, false);
                        summary.failed += 1;
                    }
                    ReplicationError::Permanent(_) => {
                        to_remediate.push(self.park_failed(&mut state, op, true));
                        summary.failed += 1;
                    }
                }
            }
        }

        crate::metrics::record_replication(&self.name, "synced", summary.synced);
        crate::metrics::record_replication(&self.name, "retrying", summary.retrying);
        crate::metrics::record_replication(&self.name, "failed", summary.failed);

        for entry in to_remediate {
            self.remediate(entry).await;
        }
        summary
    }

    fn record_success(&self, state: &mut QueueState<T>, op: QueuedOperation<T>, batch_id: &str) {
        state.failed.remove(&op.key);
        state.history.push_back(SyncOutcome {
            key: op.key,
            op_type: op.op_type,
            retries: op.retries,
            batch_id: batch_id.to_string(),
            completed_at: now_millis(),
        });
        while state.history.len() > self.history_capacity {
            state.history.pop_front();
        }
        self.synced_total.fetch_add(1, Ordering::Relaxed);
    }

    // The store never saw the batch, so no retry is charged.
    fn defer_rejected(&self, chunk: Vec<QueuedOperation<T>>) -> FlushSummary {
        let delay = self.circuit.recovery_timeout();
        let count = chunk.len();
        {
            let mut state = self.state.lock();
            for mut op in chunk {
                state.in_flight.remove(&op.key);
                op.defer(delay);
                state.requeue(op);
            }
        }
        debug!(
            queue = %self.name,
            entries = count,
            delay_ms = delay.as_millis() as u64,
            "Circuit open, batch deferred"
        );
        crate::metrics::record_replication(&self.name, "deferred", count);
        FlushSummary {
            attempted: count,
            retrying: count,
            ..Default::default()
        }
    }

    fn park_failed(&self, state: &mut QueueState<T>, op: QueuedOperation<T>, requires_remediation: bool) -> FailedEntry {
        let entry = FailedEntry {
            queue: self.name.clone(),
            key: op.key.clone(),
            op_type: op.op_type,
            retries: op.retries,
            last_error: op.last_error.clone().unwrap_or_default(),
            requires_remediation,
            failed_at: now_millis(),
        };
        if requires_remediation {
            error!(
                queue = %self.name,
                key = %entry.key,
                retries = entry.retries,
                error = %entry.last_error,
                "Integrity failure, entry needs remediation"
            );
        } else {
            error!(
                queue = %self.name,
                key = %entry.key,
                retries = entry.retries,
                error = %entry.last_error,
                "Retries exhausted, entry permanently failed"
            );
        }

        if let Some(newer) = state.pending.get_mut(&op.key) {
            newer.absorb_failed_attempt(&op);
        }
        state.failed.insert(
            op.key.clone(),
            FailedSlot {
                entry: entry.clone(),
                op,
            },
        );
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        entry
    }

    async fn remediate(&self, entry: FailedEntry) {
        let hook = self.remediation.read().clone();
        let Some(hook) = hook else {
            return;
        };

        let outcome = match tokio::time::timeout(self.call_timeout, hook.remediate(&entry)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(queue = %self.name, key = %entry.key, error = %e, "Remediation hook failed");
                RemediationOutcome::Unresolved
            }
            Err(_) => {
                warn!(queue = %self.name, key = %entry.key, "Remediation hook timed out");
                RemediationOutcome::Unresolved
            }
        };

        if outcome == RemediationOutcome::Resolved && self.retry.should_retry(entry.retries) {
            let mut state = self.state.lock();
            if let Some(slot) = state.failed.remove(&entry.key) {
                let mut op = slot.op;
                op.defer(self.retry.delay_for(op.retries));
                state.requeue(op);
                info!(queue = %self.name, key = %entry.key, retries = entry.retries, "Remediated, entry re-enqueued");
            }
        } else {
            info!(
                queue = %self.name,
                key = %entry.key,
                outcome = ?outcome,
                "Entry left for manual retry"
            );
        }
    }

    /// Move a failed entry back to pending with a fresh retry budget.
    pub fn retry_failed(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.failed.remove(key) else {
            return false;
        };
        let mut op = slot.op;
        op.retries = 0;
        op.clear_delay();
        state.requeue(op);
        info!(queue = %self.name, key = %key, "Failed entry manually re-enqueued");
        true
    }

    /// Flush repeatedly, ignoring retry delays, until nothing is pending or
    /// `grace` runs out. A flush still running at the deadline is cut off.
    /// Returns whether the queue drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.is_idle() {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            match tokio::time::timeout(left, self.flush(FlushReason::Shutdown)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(queue = %self.name, error = %e, "Drain flush skipped"),
                Err(_) => {
                    warn!(queue = %self.name, "Drain flush cut off at the grace deadline");
                    return self.is_idle();
                }
            }
            if !self.is_idle() {
                tokio::time::sleep(left.min(Duration::from_millis(20))).await;
            }
        }
    }

    /// Remove every pending and failed entry for persistence: pending ones
    /// oldest first, then failed ones with their diagnostic.
    pub fn take_backlog(&self) -> Vec<(QueuedOperation<T>, Option<FailedEntry>)> {
        let mut state = self.state.lock();
        let mut backlog: Vec<_> = state.pending.take_all().into_iter().map(|op| (op, None)).collect();
        let failed = std::mem::take(&mut state.failed);
        backlog.extend(failed.into_values().map(|slot| (slot.op, Some(slot.entry))));
        backlog
    }

    /// Start the periodic flush task. It exits when `shutdown` turns true,
    /// once any flush in progress has finished.
    pub fn spawn_worker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.flush_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let reason = tokio::select! {
                    _ = ticker.tick() => FlushReason::Time,
                    _ = queue.wake.notified() => FlushReason::Count,
                    _ = shutdown.changed() => break,
                };
                if let Err(e) = queue.flush(reason).await {
                    debug!(queue = %queue.name, %reason, error = %e, "Flush skipped");
                }
            }
            debug!(queue = %queue.name, "Sync worker stopped");
        })
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        QueueStatus {
            name: self.name.clone(),
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            failed: state.failed.values().map(|slot| slot.entry.clone()).collect(),
            history: state.history.len(),
            synced_total: self.synced_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            oldest_pending_ms: state.pending.oldest_age().map(|d| d.as_millis() as u64),
            circuit: self.circuit.stats(),
        }
    }

    /// Recently completed entries, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<SyncOutcome> {
        self.state.lock().history.iter().cloned().collect()
    }

    #[must_use]
    pub fn failed_entries(&self) -> Vec<FailedEntry> {
        self.state.lock().failed.values().map(|slot| slot.entry.clone()).collect()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    fn publish_depths(&self) {
        let state = self.state.lock();
        crate::metrics::set_queue_depths(&self.name, state.pending.len(), state.in_flight.len(), state.failed.len());
    }
}
