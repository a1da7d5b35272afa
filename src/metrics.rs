// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the state engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for installing an exporter.
//!
//! # Metric Naming Convention
//! - `state_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: primary, cache, lock, engine, collections
//! - `queue`: sync queue name (player_state, upgrades, ...)
//! - `status` / `outcome`: success, error, retry, failed, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an engine operation outcome
pub fn record_operation(component: &str, operation: &str, status: &str) {
    counter!(
        "state_engine_operations_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "state_engine_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// PRIMARY STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Record bytes committed to the primary store
pub fn record_bytes_written(bytes: usize) {
    counter!("state_engine_primary_bytes_written_total").increment(bytes as u64);
}

/// Record bytes read from the primary store
pub fn record_bytes_read(bytes: usize) {
    counter!("state_engine_primary_bytes_read_total").increment(bytes as u64);
}

/// Record a corrupt file moved aside
pub fn record_quarantine() {
    counter!("state_engine_quarantined_files_total").increment(1);
}

/// Set number of cached documents
pub fn set_cache_entries(count: usize) {
    gauge!("state_engine_cache_entries").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// PATH MUTEX
// ═══════════════════════════════════════════════════════════════════════════

/// Record time spent waiting for a per-path lock
pub fn record_lock_wait(duration: Duration) {
    histogram!("state_engine_lock_wait_seconds").record(duration.as_secs_f64());
}

/// Record a lock acquisition that exceeded its budget
pub fn record_lock_timeout() {
    counter!("state_engine_lock_timeouts_total").increment(1);
}

/// Record a critical section that ran past its budget
pub fn record_lock_overrun() {
    counter!("state_engine_lock_overruns_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC QUEUES
// ═══════════════════════════════════════════════════════════════════════════

/// Set queue depths for one queue
pub fn set_queue_depths(queue: &str, pending: usize, in_flight: usize, failed: usize) {
    gauge!("state_engine_queue_pending", "queue" => queue.to_string()).set(pending as f64);
    gauge!("state_engine_queue_in_flight", "queue" => queue.to_string()).set(in_flight as f64);
    gauge!("state_engine_queue_failed", "queue" => queue.to_string()).set(failed as f64);
}

/// Record replication outcomes (success, retry, failed, remediated)
pub fn record_replication(queue: &str, outcome: &str, count: usize) {
    counter!(
        "state_engine_replications_total",
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(count as u64);
}

/// Record flushed batch size
pub fn record_batch_size(queue: &str, count: usize) {
    histogram!(
        "state_engine_batch_size",
        "queue" => queue.to_string()
    )
    .record(count as f64);
}

/// Record batch flush duration
pub fn record_flush_duration(queue: &str, duration: Duration) {
    histogram!(
        "state_engine_flush_seconds",
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a secondary-store call that exceeded its timeout
pub fn record_timeout(queue: &str) {
    counter!(
        "state_engine_secondary_timeouts_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "state_engine_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record lifecycle phase duration (init, drain, shutdown)
pub fn record_lifecycle_phase(phase: &str, duration: Duration) {
    histogram!(
        "state_engine_lifecycle_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Track engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "state_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
