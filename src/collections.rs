//! CRUD over the shared catalog collections.
//!
//! Two on-disk layouts exist (see [`CollectionLayout`]):
//! - aggregate: `upgrades.json`, `levels.json`, one file holding every record
//! - per-record: `characters/<id>.json`, `tasks/<id>.json`, ...
//!
//! Every mutation is a read-modify-write of exactly one file, done inside the
//! [`PathMutex`] critical section for that file, followed by a non-blocking
//! enqueue on the collection's sync queue. Aggregate collections therefore
//! serialize all writers of the collection; per-record collections only
//! serialize writers of the same record.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::path_mutex::PathMutex;
use crate::record::{patch_from_value, validate_id, CollectionKind, CollectionLayout, EntityKind, Record};
use crate::storage::file_store::AtomicFileStore;
use crate::sync_queue::{OpType, SyncQueueManager};

type Aggregate = BTreeMap<String, Record>;

enum Change {
    Put(Record, OpType),
    Remove(Record),
}

pub struct CollectionStore {
    files: Arc<AtomicFileStore>,
    locks: Arc<PathMutex>,
    queues: Arc<SyncQueueManager>,
}

impl CollectionStore {
    pub fn new(files: Arc<AtomicFileStore>, locks: Arc<PathMutex>, queues: Arc<SyncQueueManager>) -> Self {
        Self { files, locks, queues }
    }

    /// Insert a new record. Fails with `Validation` if `id` already exists.
    pub async fn create(&self, kind: CollectionKind, id: &str, data: Value) -> Result<Record> {
        validate_id("record id", id)?;
        let data = match data {
            Value::Object(map) => map,
            _ => return Err(EngineError::Validation(format!("{kind} record must be a JSON object"))),
        };

        self.mutate(kind, id, |current| match current {
            Some(_) => Err(EngineError::Validation(format!("{kind} '{id}' already exists"))),
            None => Ok(Change::Put(Record::new(id, data), OpType::Create)),
        })
        .await
    }

    /// Shallow-merge `patch` into an existing record.
    pub async fn update(&self, kind: CollectionKind, id: &str, patch: Value) -> Result<Record> {
        validate_id("record id", id)?;
        let patch = patch_from_value(patch)?;

        self.mutate(kind, id, |current| {
            let mut record = current.ok_or_else(|| not_found(kind, id))?;
            record.apply_patch(&patch);
            Ok(Change::Put(record, OpType::Update))
        })
        .await
    }

    /// Remove a record, returning what was deleted.
    pub async fn delete(&self, kind: CollectionKind, id: &str) -> Result<Record> {
        validate_id("record id", id)?;

        self.mutate(kind, id, |current| {
            current.map(Change::Remove).ok_or_else(|| not_found(kind, id))
        })
        .await
    }

    pub async fn get(&self, kind: CollectionKind, id: &str) -> Result<Option<Record>> {
        validate_id("record id", id)?;
        let path = kind.relative_path(id);
        let lock_key = lock_key(&path);

        self.locks
            .with_lock(&lock_key, || async {
                match kind.layout() {
                    CollectionLayout::Aggregate => {
                        let mut all = self.read_aggregate(&path).await?;
                        Ok(all.remove(id))
                    }
                    CollectionLayout::PerRecord => self.files.read_or_quarantine::<Record>(&path).await,
                }
            })
            .await?
    }

    /// Every record of the collection, ordered by id.
    pub async fn list(&self, kind: CollectionKind) -> Result<Vec<Record>> {
        match kind.layout() {
            CollectionLayout::Aggregate => {
                let path = kind.relative_path("");
                let lock_key = lock_key(&path);
                let all = self
                    .locks
                    .with_lock(&lock_key, || self.read_aggregate(&path))
                    .await??;
                Ok(all.into_values().collect())
            }
            CollectionLayout::PerRecord => {
                let ids = self.files.list_ids(Path::new(kind.as_str())).await?;
                let mut records = Vec::with_capacity(ids.len());
                for id in ids {
                    // Skip names that could not have been written through this store
                    if validate_id("record id", &id).is_err() {
                        continue;
                    }
                    if let Some(record) = self.get(kind, &id).await? {
                        records.push(record);
                    }
                }
                Ok(records)
            }
        }
    }

    async fn read_aggregate(&self, path: &Path) -> Result<Aggregate> {
        Ok(self.files.read_or_quarantine::<Aggregate>(path).await?.unwrap_or_default())
    }

    async fn mutate<F>(&self, kind: CollectionKind, id: &str, apply: F) -> Result<Record>
    where
        F: FnOnce(Option<Record>) -> Result<Change>,
    {
        let path = kind.relative_path(id);
        let lock_key = lock_key(&path);
        let entity = EntityKind::from(kind);

        self.locks
            .with_lock(&lock_key, move || async move {
                let change = match kind.layout() {
                    CollectionLayout::Aggregate => {
                        let mut all = self.read_aggregate(&path).await?;
                        let change = apply(all.remove(id))?;
                        if let Change::Put(record, _) = &change {
                            all.insert(id.to_string(), record.clone());
                        }
                        self.files.write(&path, &all).await?;
                        change
                    }
                    CollectionLayout::PerRecord => {
                        let current = self.files.read_or_quarantine::<Record>(&path).await?;
                        let change = apply(current)?;
                        match &change {
                            Change::Put(record, _) => self.files.write(&path, record).await?,
                            Change::Remove(_) => {
                                self.files.remove(&path).await?;
                            }
                        }
                        change
                    }
                };

                let (record, op_type) = match change {
                    Change::Put(record, op_type) => (record, op_type),
                    Change::Remove(record) => (record, OpType::Delete),
                };
                self.queues.enqueue(entity, id, record.data.clone(), op_type);
                info!(collection = %kind, id = %id, op = %op_type, "Collection record changed");
                Ok::<_, EngineError>(record)
            })
            .await?
    }
}

fn lock_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn not_found(kind: CollectionKind, id: &str) -> EngineError {
    EngineError::NotFound(format!("{kind} '{id}'"))
}
