// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coalescing batching for replication.
//!
//! The [`CoalescingBatcher`] holds at most one pending item per id. Pushing
//! an item whose id is already pending merges the two (see
//! [`BatchableItem::coalesce`]) instead of queueing both, so only the latest
//! state of a record is ever replicated.
//!
//! # Example
//!
//! ```
//! use state_engine::batching::{BatchConfig, BatchableItem, CoalescingBatcher, FlushReason};
//! use std::time::Instant;
//!
//! #[derive(Debug)]
//! struct Item { id: String, value: u32 }
//! impl BatchableItem for Item {
//!     fn id(&self) -> &str { &self.id }
//!     fn coalesce(&mut self, newer: Self) { self.value = newer.value; }
//!     fn is_due(&self, _now: Instant) -> bool { true }
//! }
//!
//! let mut batcher = CoalescingBatcher::new(BatchConfig { flush_count: 2 });
//! assert_eq!(batcher.push(Item { id: "a".into(), value: 1 }), None);
//! assert_eq!(batcher.push(Item { id: "a".into(), value: 2 }), None); // coalesced
//! assert_eq!(batcher.len(), 1);
//! assert_eq!(batcher.push(Item { id: "b".into(), value: 3 }), Some(FlushReason::Count));
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Periodic interval elapsed
    Time,
    /// Pending count reached the batch size
    Count,
    /// Manual flush requested
    Manual,
    /// Shutdown drain (ignores retry delays)
    Shutdown,
}

impl FlushReason {
    /// Whether entries still waiting out a retry delay are included
    #[must_use]
    pub fn ignores_delay(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Time => write!(f, "time"),
            Self::Count => write!(f, "count"),
            Self::Manual => write!(f, "manual"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Configuration for coalescing batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Signal a flush once this many distinct ids are pending
    pub flush_count: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { flush_count: 100 }
    }
}

/// Trait for items that can be merged by id
pub trait BatchableItem {
    fn id(&self) -> &str;

    /// Fold a newer item for the same id into this one
    fn coalesce(&mut self, newer: Self);

    /// Whether the item may be sent now (false while backing off)
    fn is_due(&self, now: Instant) -> bool;
}

struct Slot<T> {
    seq: u64,
    /// First enqueue of this id; coalescing keeps it
    since: Instant,
    item: T,
}

/// Pending items keyed by id, drained in first-enqueued order.
pub struct CoalescingBatcher<T> {
    config: BatchConfig,
    pending: HashMap<String, Slot<T>>,
    next_seq: u64,
    oldest: Option<Instant>,
}

impl<T: BatchableItem> CoalescingBatcher<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            next_seq: 0,
            oldest: None,
        }
    }

    /// Add or coalesce an item, returns flush reason if the count threshold is hit
    pub fn push(&mut self, item: T) -> Option<FlushReason> {
        if let Some(slot) = self.pending.get_mut(item.id()) {
            slot.item.coalesce(item);
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            let since = Instant::now();
            self.oldest.get_or_insert(since);
            self.pending.insert(item.id().to_string(), Slot { seq, since, item });
        }

        (self.pending.len() >= self.config.flush_count).then_some(FlushReason::Count)
    }

    /// Remove and return the items that may be sent, oldest first.
    ///
    /// Shutdown flushes take everything regardless of retry delays.
    pub fn take_due(&mut self, now: Instant, reason: FlushReason) -> Vec<T> {
        let due_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, slot)| reason.ignores_delay() || slot.item.is_due(now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut slots: Vec<Slot<T>> = due_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        slots.sort_by_key(|slot| slot.seq);

        self.oldest = self.pending.values().map(|slot| slot.since).min();
        debug!(count = slots.len(), remaining = self.pending.len(), %reason, "Batch taken for flush");
        slots.into_iter().map(|slot| slot.item).collect()
    }

    /// Remove everything, oldest first
    pub fn take_all(&mut self) -> Vec<T> {
        let mut slots: Vec<Slot<T>> = self.pending.drain().map(|(_, slot)| slot).collect();
        slots.sort_by_key(|slot| slot.seq);
        self.oldest = None;
        slots.into_iter().map(|slot| slot.item).collect()
    }

    /// Pending item for `id`
    #[must_use]
    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.pending.get_mut(id).map(|slot| &mut slot.item)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Age of the oldest pending item
    #[must_use]
    pub fn oldest_age(&self) -> Option<Duration> {
        self.oldest.map(|t| t.elapsed())
    }
}
