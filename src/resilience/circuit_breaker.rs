// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker around secondary-store batches, using the recloser crate.
//!
//! Each sync queue owns one breaker. When the secondary store keeps failing
//! whole batches, the breaker opens and subsequent flushes fail fast instead
//! of stacking timeouts. A rejected batch never reached the store, so the
//! queue defers its entries until the breaker half-opens without charging
//! them a retry.
//!
//! States (tracked inside recloser):
//! - Closed: batches pass through
//! - Open: batches are rejected without calling the store
//! - HalfOpen: a few trial batches decide whether to close again

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker is open and the call was not attempted
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure rate (0.0 - 1.0) over the closed window that trips the breaker
    pub failure_rate: f32,
    /// Calls observed while closed before the rate is evaluated
    pub closed_window: usize,
    /// Trial calls allowed while half-open
    pub half_open_window: usize,
    /// How long the breaker stays open before half-opening
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.5,
            closed_window: 10,
            half_open_window: 2,
            recovery_timeout: Duration::from_secs(15),
        }
    }
}

impl CircuitConfig {
    /// Never trips in practice
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            failure_rate: 1.0,
            closed_window: 1024,
            half_open_window: 1,
            recovery_timeout: Duration::from_millis(1),
        }
    }

    /// Trips fast and recovers fast, for tests
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_rate: 0.5,
            closed_window: 2,
            half_open_window: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    recovery_timeout: Duration,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate)
            .closed_len(config.closed_window)
            .half_open_len(config.half_open_window)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            recovery_timeout: config.recovery_timeout,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How long the breaker stays open before letting a trial call through
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Run an async operation through the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls refused while open
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Failure rate (0.0 - 1.0) over the breaker's lifetime
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            calls: self.calls_total(),
            successes: self.successes(),
            failures: self.failures(),
            rejections: self.rejections(),
        }
    }
}

/// Snapshot of a breaker's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}
