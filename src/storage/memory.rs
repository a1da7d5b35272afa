use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{ReplicationError, SecondaryStore};
use crate::record::{Document, EntityKind};

/// Kind of call received by a secondary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Update,
    Delete,
}

/// One call observed by [`InMemorySecondaryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub entity: EntityKind,
    pub key: String,
    pub data: Option<Document>,
}

/// In-process secondary store.
///
/// Stands in for the relational projection in development and tests; keeps
/// every row in a `DashMap` and a log of the calls it received.
pub struct InMemorySecondaryStore {
    rows: DashMap<(EntityKind, String), Document>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl InMemorySecondaryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Current projected row
    #[must_use]
    pub fn get(&self, entity: EntityKind, key: &str) -> Option<Document> {
        self.rows.get(&(entity, key.to_string())).map(|r| r.value().clone())
    }

    /// Seed a row directly (bypassing the call log)
    pub fn insert(&self, entity: EntityKind, key: &str, data: Document) {
        self.rows.insert((entity, key.to_string()), data);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Calls received so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Calls received for one key
    #[must_use]
    pub fn calls_for(&self, entity: EntityKind, key: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.entity == entity && c.key == key)
            .cloned()
            .collect()
    }

    fn log(&self, kind: CallKind, entity: EntityKind, key: &str, data: Option<&Document>) {
        self.calls.lock().push(RecordedCall {
            kind,
            entity,
            key: key.to_string(),
            data: data.cloned(),
        });
    }
}

impl Default for InMemorySecondaryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecondaryStore for InMemorySecondaryStore {
    // Creates and updates are upserts so a replayed create is harmless.
    async fn create_record(&self, entity: EntityKind, key: &str, data: &Document) -> Result<(), ReplicationError> {
        self.log(CallKind::Create, entity, key, Some(data));
        self.rows.insert((entity, key.to_string()), data.clone());
        Ok(())
    }

    async fn update_record(&self, entity: EntityKind, key: &str, data: &Document) -> Result<(), ReplicationError> {
        self.log(CallKind::Update, entity, key, Some(data));
        self.rows.insert((entity, key.to_string()), data.clone());
        Ok(())
    }

    async fn delete_record(&self, entity: EntityKind, key: &str) -> Result<(), ReplicationError> {
        self.log(CallKind::Delete, entity, key, None);
        self.rows.remove(&(entity, key.to_string()));
        Ok(())
    }

    async fn fetch_record(&self, entity: EntityKind, key: &str) -> Result<Option<Document>, ReplicationError> {
        Ok(self.get(entity, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemorySecondaryStore::new();
        assert!(store.is_empty());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let store = InMemorySecondaryStore::new();

        store.create_record(EntityKind::PlayerState, "1", &doc(json!({"points": 1}))).await.unwrap();
        store.update_record(EntityKind::PlayerState, "1", &doc(json!({"points": 2}))).await.unwrap();
        assert_eq!(store.get(EntityKind::PlayerState, "1").unwrap()["points"], 2);

        store.delete_record(EntityKind::PlayerState, "1").await.unwrap();
        assert!(store.get(EntityKind::PlayerState, "1").is_none());

        let kinds: Vec<CallKind> = store.calls().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallKind::Create, CallKind::Update, CallKind::Delete]);
    }

    #[tokio::test]
    async fn test_entities_are_isolated() {
        let store = InMemorySecondaryStore::new();
        store.update_record(EntityKind::Tasks, "x", &doc(json!({"a": 1}))).await.unwrap();

        assert!(store.get(EntityKind::Achievements, "x").is_none());
        assert!(store.fetch_record(EntityKind::Tasks, "x").await.unwrap().is_some());
        assert_eq!(store.calls_for(EntityKind::Tasks, "x").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let store = InMemorySecondaryStore::new();
        assert!(store.delete_record(EntityKind::Levels, "nope").await.is_ok());
    }
}
