pub mod coalescing;

pub use coalescing::{BatchConfig, BatchableItem, CoalescingBatcher, FlushReason};
