// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry policy for replication failures.
//!
//! Replication retries are not loops: a failed entry goes back into its
//! queue with a `not_before` deadline and is picked up by a later flush.
//! [`RetryPolicy`] decides whether another attempt is allowed and how long
//! to wait. The delay grows linearly with the retry count and is capped.
//!
//! # Example
//!
//! ```
//! use state_engine::resilience::retry::RetryPolicy;
//! use state_engine::QueueConfig;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::from(&QueueConfig::player_state());
//! assert_eq!(policy.delay_for(1), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(2));
//! assert!(policy.should_retry(2));
//! assert!(!policy.should_retry(3));
//! ```

use std::time::Duration;

use crate::config::QueueConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts allowed before an entry is given up on
    pub max_retries: u32,
    /// Base delay, multiplied by the retry count
    pub retry_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::player_state())
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Near-zero delays for tests
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    /// Whether an entry that has failed `retries` times may try again.
    #[must_use]
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Wait before the attempt following failure number `retries`.
    #[must_use]
    pub fn delay_for(&self, retries: u32) -> Duration {
        self.retry_delay
            .checked_mul(retries)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_linearly() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = RetryPolicy {
            max_retries: 100,
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };

        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        // Overflow saturates to the cap
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_should_retry_boundary() {
        let policy = RetryPolicy::test();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_from_queue_presets() {
        let player = RetryPolicy::from(&QueueConfig::player_state());
        assert_eq!(player.max_retries, 3);
        assert_eq!(player.retry_delay, Duration::from_secs(1));

        let catalog = RetryPolicy::from(&QueueConfig::catalog());
        assert_eq!(catalog.max_retries, 5);
        assert_eq!(catalog.retry_delay, Duration::from_secs(2));
        assert_eq!(catalog.max_delay, Duration::from_secs(60));
    }
}
