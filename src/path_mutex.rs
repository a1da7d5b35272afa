//! Per-key serialization with a bounded wait.
//!
//! [`PathMutex`] admits one critical section per key at a time, in FIFO
//! order, while unrelated keys proceed fully in parallel. It is the only lock
//! in the engine that may be held across an `.await`.
//!
//! Waiting is bounded: a caller that cannot acquire the key within the
//! budget gets [`EngineError::LockTimeout`] instead of hanging. A critical
//! section that itself runs past the budget is reported but never cancelled,
//! because primary-store writes must run to completion.
//!
//! Re-entering the same key from inside its own critical section cannot
//! succeed; it times out after the budget.
//!
//! # Example
//!
//! ```
//! use state_engine::PathMutex;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let locks = PathMutex::new(Duration::from_secs(1));
//! let value = locks.with_lock("players/1.json", || async { 40 + 2 }).await.unwrap();
//! assert_eq!(value, 42);
//! assert_eq!(locks.active_keys(), 0);
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

#[derive(Default)]
struct Slot {
    /// tokio's mutex grants the lock in request order
    mutex: Mutex<()>,
    /// Holder plus queued waiters
    waiters: AtomicUsize,
}

pub struct PathMutex {
    slots: DashMap<String, Arc<Slot>>,
    budget: Duration,
}

/// Registration of one caller on a key; releases the slot on drop, even if
/// the caller's future is dropped mid-wait.
struct Ticket<'a> {
    owner: &'a PathMutex,
    key: &'a str,
    slot: Arc<Slot>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.slot.waiters.fetch_sub(1, Ordering::AcqRel);
        // Registration happens under the shard lock, so a zero count here
        // means nobody holds or waits for this key
        self.owner
            .slots
            .remove_if(self.key, |_, slot| slot.waiters.load(Ordering::Acquire) == 0);
    }
}

impl PathMutex {
    pub fn new(budget: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            budget,
        }
    }

    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Run `f` while holding the lock for `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (slot, depth) = {
            let entry = self.slots.entry(key.to_string()).or_default();
            let depth = entry.waiters.fetch_add(1, Ordering::AcqRel) + 1;
            (entry.clone(), depth)
        };
        let ticket = Ticket {
            owner: self,
            key,
            slot,
        };

        let wait_start = Instant::now();
        let guard = match tokio::time::timeout(self.budget, ticket.slot.mutex.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                let queue_depth = ticket.slot.waiters.load(Ordering::Acquire);
                let waited_ms = wait_start.elapsed().as_millis() as u64;
                warn!(key = %key, queue_depth, waited_ms, "Lock acquisition exceeded budget");
                crate::metrics::record_lock_timeout();
                return Err(EngineError::LockTimeout {
                    key: key.to_string(),
                    waited_ms,
                    queue_depth,
                });
            }
        };
        let waited = wait_start.elapsed();
        crate::metrics::record_lock_wait(waited);
        if depth > 1 {
            debug!(key = %key, depth, waited_ms = waited.as_millis() as u64, "Lock acquired after queueing");
        }

        let held_since = Instant::now();
        let fut = f();
        tokio::pin!(fut);
        let output = match tokio::time::timeout(self.budget, &mut fut).await {
            Ok(output) => output,
            Err(_) => {
                warn!(
                    key = %key,
                    queue_depth = ticket.slot.waiters.load(Ordering::Acquire),
                    elapsed_ms = held_since.elapsed().as_millis() as u64,
                    "Critical section exceeded lock budget, waiting for it to complete"
                );
                crate::metrics::record_lock_overrun();
                fut.await
            }
        };

        drop(guard);
        drop(ticket);
        Ok(output)
    }

    /// Callers holding or waiting for `key`.
    #[must_use]
    pub fn queue_depth(&self, key: &str) -> usize {
        self.slots
            .get(key)
            .map_or(0, |slot| slot.waiters.load(Ordering::Acquire))
    }

    /// Keys with a holder or waiter.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.slots.len()
    }
}
