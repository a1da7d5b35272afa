use async_trait::async_trait;
use thiserror::Error;

use crate::record::{Document, EntityKind};
use crate::sync_queue::FailedEntry;

/// Failure reported by the secondary store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// Timeout, connection reset, or anything unrecognised: retried with backoff
    #[error("transient replication failure: {0}")]
    Transient(String),
    /// Integrity violation (dependent-record constraint): needs remediation
    #[error("permanent replication failure: {0}")]
    Permanent(String),
}

const PERMANENT_MARKERS: &[&str] = &[
    "foreign key",
    "constraint",
    "violates",
    "integrity",
    "duplicate key",
];

impl ReplicationError {
    /// Classify a raw backend error message. Unknown errors are transient.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::Permanent(message)
        } else {
            Self::Transient(message)
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// Narrow interface to the relational projection.
///
/// The engine calls the mutating methods only from a sync function, never
/// from the primary write path. `fetch_record` is used solely as a fallback
/// when a player is missing from the primary store.
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    async fn create_record(&self, entity: EntityKind, key: &str, data: &Document) -> Result<(), ReplicationError>;
    async fn update_record(&self, entity: EntityKind, key: &str, data: &Document) -> Result<(), ReplicationError>;
    async fn delete_record(&self, entity: EntityKind, key: &str) -> Result<(), ReplicationError>;

    /// Read a projected row. Stores that cannot serve reads return `Ok(None)`.
    async fn fetch_record(&self, _entity: EntityKind, _key: &str) -> Result<Option<Document>, ReplicationError> {
        Ok(None)
    }
}

/// Result of a remediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationOutcome {
    /// The blocking dependency was cleared; the entry may be retried
    Resolved,
    /// Nothing could be done automatically; an operator must intervene
    Unresolved,
}

/// Entity-specific cleanup run after a permanent replication failure,
/// e.g. deleting stale child rows that block a player update.
#[async_trait]
pub trait RemediationHook: Send + Sync {
    async fn remediate(&self, failure: &FailedEntry) -> Result<RemediationOutcome, ReplicationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_constraint_violations_as_permanent() {
        let err = ReplicationError::classify(
            "update on table \"players\" violates foreign key constraint \"sessions_player_fk\"",
        );
        assert!(!err.is_transient());

        let err = ReplicationError::classify("Integrity error: row referenced");
        assert!(matches!(err, ReplicationError::Permanent(_)));
    }

    #[test]
    fn test_classify_unknown_as_transient() {
        assert!(ReplicationError::classify("connection reset by peer").is_transient());
        assert!(ReplicationError::classify("timed out").is_transient());
        assert!(ReplicationError::classify("something odd").is_transient());
    }

    #[test]
    fn test_message_accessor() {
        assert_eq!(ReplicationError::Transient("x".into()).message(), "x");
        assert_eq!(ReplicationError::Permanent("y".into()).message(), "y");
    }
}
