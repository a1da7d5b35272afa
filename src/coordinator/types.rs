//! Public types for the state engine coordinator.

use serde::Serialize;

use crate::sync_queue::ManagerStatus;

/// Engine lifecycle state.
///
/// Use [`super::StateEngine::state()`] to check the current state or
/// [`super::StateEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet initialized
    Created,
    /// Sweeping temp files and restoring the replication backlog
    Starting,
    /// Accepting reads and writes
    Running,
    /// Draining replication; new writes are refused
    ShuttingDown,
    /// Backlog persisted, workers stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot returned by [`super::StateEngine::status()`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub cached_players: usize,
    /// Lock keys currently held or waited on
    pub active_locks: usize,
    /// Engine calls admitted and not yet finished
    pub active_requests: usize,
    pub replication: ManagerStatus,
}

/// What `shutdown()` left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Entries written to the backlog file for the next start
    pub persisted_backlog: usize,
}

impl ShutdownReport {
    #[must_use]
    pub fn fully_drained(&self) -> bool {
        self.persisted_backlog == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
    }

    #[test]
    fn test_shutdown_report() {
        assert!(ShutdownReport::default().fully_drained());
        assert!(!ShutdownReport { persisted_backlog: 3 }.fully_drained());
    }
}
