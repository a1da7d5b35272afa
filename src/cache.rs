//! Write-through player state cache.
//!
//! [`StateCache`] keeps the current [`Record`] of every player touched by
//! this process. Misses fall through to the primary store; a player missing
//! there is seeded from the secondary store (read-only fallback) or from the
//! configured defaults, persisted, and cached.
//!
//! Every mutation runs inside the [`PathMutex`] critical section for the
//! player's file, so concurrent patches to one player apply one after the
//! other and none is lost. Replication is handed to the player-state
//! [`SyncQueue`](crate::sync_queue::SyncQueue) as the last step and never
//! waits on the secondary store.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::metrics::LatencyTimer;
use crate::path_mutex::PathMutex;
use crate::record::{patch_from_value, Document, EntityKind, PlayerKey, Record};
use crate::storage::file_store::AtomicFileStore;
use crate::storage::traits::SecondaryStore;
use crate::sync_queue::{OpType, SyncQueueManager};

/// Where a loaded record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    PrimaryStore,
    /// Seeded from a row found in the secondary store
    SecondaryStore,
    /// Created from defaults
    Defaults,
}

impl LoadSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::PrimaryStore => "primary",
            Self::SecondaryStore => "secondary",
            Self::Defaults => "defaults",
        }
    }
}

pub struct StateCache {
    entries: DashMap<String, Record>,
    files: Arc<AtomicFileStore>,
    locks: Arc<PathMutex>,
    queues: Arc<SyncQueueManager>,
    fallback: Arc<dyn SecondaryStore>,
    defaults: Document,
    fallback_timeout: Duration,
}

/// Lock and cache key: the player's file path.
fn cache_key(key: &PlayerKey) -> String {
    key.relative_path().to_string_lossy().into_owned()
}

impl StateCache {
    pub fn new(
        files: Arc<AtomicFileStore>,
        locks: Arc<PathMutex>,
        queues: Arc<SyncQueueManager>,
        fallback: Arc<dyn SecondaryStore>,
        defaults: Document,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            files,
            locks,
            queues,
            fallback,
            defaults,
            fallback_timeout,
        }
    }

    /// Current record for `key`, creating it if absent everywhere.
    pub async fn load(&self, key: &PlayerKey) -> Result<Record> {
        self.load_with_source(key).await.map(|(record, _)| record)
    }

    pub async fn load_with_source(&self, key: &PlayerKey) -> Result<(Record, LoadSource)> {
        key.validate()?;
        let _timer = LatencyTimer::new("cache", "load");
        let cache_key = cache_key(key);

        if let Some(hit) = self.entries.get(&cache_key) {
            crate::metrics::record_operation("cache", "load", "hit");
            return Ok((hit.value().clone(), LoadSource::Cache));
        }
        crate::metrics::record_operation("cache", "load", "miss");

        self.locks
            .with_lock(&cache_key, || self.load_locked(key, &cache_key))
            .await?
    }

    /// Shallow-merge `patch` into the player's record and persist it.
    ///
    /// Returns once the primary store holds the new record. A patch that is
    /// not a non-empty JSON object is rejected before anything is touched.
    pub async fn update(&self, key: &PlayerKey, patch: Value) -> Result<Record> {
        key.validate()?;
        let patch = patch_from_value(patch)?;
        let _timer = LatencyTimer::new("cache", "update");
        let cache_key = cache_key(key);

        let result = self
            .locks
            .with_lock(&cache_key, || async {
                let (mut record, _) = self.load_locked(key, &cache_key).await?;
                record.apply_patch(&patch);

                self.files.write(&key.relative_path(), &record).await?;
                self.entries.insert(cache_key.clone(), record.clone());
                self.queues
                    .enqueue(EntityKind::PlayerState, key.record_id(), record.data.clone(), OpType::Update);

                debug!(player = %key, fields = patch.len(), "Player state updated");
                Ok::<_, EngineError>(record)
            })
            .await?;

        crate::metrics::record_operation("cache", "update", if result.is_ok() { "success" } else { "error" });
        result
    }

    /// Delete the player's file and cached record, and replicate the delete.
    pub async fn remove(&self, key: &PlayerKey) -> Result<Record> {
        key.validate()?;
        let cache_key = cache_key(key);

        self.locks
            .with_lock(&cache_key, || async {
                let path = key.relative_path();
                let cached = self.entries.get(&cache_key).map(|hit| hit.value().clone());
                let current = match cached {
                    Some(record) => Some(record),
                    None => self.files.read_or_quarantine::<Record>(&path).await?,
                };
                let existed = self.files.remove(&path).await?;
                self.entries.remove(&cache_key);
                self.publish_size();

                let record = match current {
                    Some(record) if existed => record,
                    _ => return Err(EngineError::NotFound(format!("player {key}"))),
                };
                self.queues
                    .enqueue(EntityKind::PlayerState, key.record_id(), record.data.clone(), OpType::Delete);
                info!(player = %key, "Player record removed");
                Ok::<_, EngineError>(record)
            })
            .await?
    }

    /// Drop the cached record so the next access re-reads the primary store.
    pub fn invalidate(&self, key: &PlayerKey) -> bool {
        let removed = self.entries.remove(&cache_key(key)).is_some();
        if removed {
            debug!(player = %key, "Cache entry invalidated");
            self.publish_size();
        }
        removed
    }

    #[must_use]
    pub fn get_cached(&self, key: &PlayerKey) -> Option<Record> {
        self.entries.get(&cache_key(key)).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load under the caller's lock on `cache_key`.
    async fn load_locked(&self, key: &PlayerKey, cache_key: &str) -> Result<(Record, LoadSource)> {
        if let Some(hit) = self.entries.get(cache_key) {
            return Ok((hit.value().clone(), LoadSource::Cache));
        }

        let path = key.relative_path();
        if let Some(record) = self.files.read_or_quarantine::<Record>(&path).await? {
            self.entries.insert(cache_key.to_string(), record.clone());
            self.publish_size();
            return Ok((record, LoadSource::PrimaryStore));
        }

        let (record, source) = match self.fetch_fallback(key).await {
            Some(data) => (Record::new(key.record_id(), data), LoadSource::SecondaryStore),
            None => (Record::new(key.record_id(), self.defaults.clone()), LoadSource::Defaults),
        };
        self.files.write(&path, &record).await?;
        self.entries.insert(cache_key.to_string(), record.clone());
        self.publish_size();

        // A row seeded from the secondary store already exists there
        if source == LoadSource::Defaults {
            self.queues
                .enqueue(EntityKind::PlayerState, key.record_id(), record.data.clone(), OpType::Create);
        }
        info!(player = %key, source = source.as_str(), "Player record created");
        Ok((record, source))
    }

    async fn fetch_fallback(&self, key: &PlayerKey) -> Option<Document> {
        let fetch = self.fallback.fetch_record(EntityKind::PlayerState, key.record_id());
        match tokio::time::timeout(self.fallback_timeout, fetch).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(player = %key, error = %e, "Secondary store fallback failed, using defaults");
                None
            }
            Err(_) => {
                warn!(
                    player = %key,
                    timeout_ms = self.fallback_timeout.as_millis() as u64,
                    "Secondary store fallback timed out, using defaults"
                );
                None
            }
        }
    }

    fn publish_size(&self) {
        crate::metrics::set_cache_entries(self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::memory::{CallKind, InMemorySecondaryStore};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        files: Arc<AtomicFileStore>,
        store: Arc<InMemorySecondaryStore>,
        queues: Arc<SyncQueueManager>,
        cache: StateCache,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let files = Arc::new(AtomicFileStore::new(dir.path()));
        let locks = Arc::new(PathMutex::new(Duration::from_secs(5)));
        let store = Arc::new(InMemorySecondaryStore::new());
        let queues = Arc::new(SyncQueueManager::new(&config, store.clone(), locks.clone()));
        let cache = StateCache::new(
            files.clone(),
            locks,
            queues.clone(),
            store.clone(),
            json!({"points": 0, "energy": 1000}).as_object().cloned().unwrap(),
            Duration::from_millis(200),
        );
        Fixture {
            _dir: dir,
            files,
            store,
            queues,
            cache,
        }
    }

    #[tokio::test]
    async fn test_load_creates_from_defaults_and_enqueues_create() {
        let f = fixture();
        let key = PlayerKey::new("p1");

        let (record, source) = f.cache.load_with_source(&key).await.unwrap();
        assert_eq!(source, LoadSource::Defaults);
        assert_eq!(record.data["energy"], 1000);
        assert!(f.files.resolve(&key.relative_path()).exists());

        let (_, source) = f.cache.load_with_source(&key).await.unwrap();
        assert_eq!(source, LoadSource::Cache);

        f.queues.flush_all().await.unwrap();
        let calls = f.store.calls_for(EntityKind::PlayerState, "p1");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, CallKind::Create);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_secondary_without_create() {
        let f = fixture();
        f.store.insert(
            EntityKind::PlayerState,
            "p2",
            json!({"points": 77}).as_object().cloned().unwrap(),
        );

        let (record, source) = f.cache.load_with_source(&PlayerKey::new("p2")).await.unwrap();
        assert_eq!(source, LoadSource::SecondaryStore);
        assert_eq!(record.data["points"], 77);
        assert_eq!(f.queues.status().total_pending, 0);
    }

    #[tokio::test]
    async fn test_update_merges_persists_and_coalesces_with_create() {
        let f = fixture();
        let key = PlayerKey::new("p1").with_username("alice");

        let record = f.cache.update(&key, json!({"points": 150})).await.unwrap();
        assert_eq!(record.data["points"], 150);
        assert_eq!(record.data["energy"], 1000);

        let on_disk: Record = f.files.read(&key.relative_path()).await.unwrap().unwrap();
        assert_eq!(on_disk, record);

        f.queues.flush_all().await.unwrap();
        let calls = f.store.calls_for(EntityKind::PlayerState, "p1");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, CallKind::Create);
        assert_eq!(calls[0].data.as_ref().unwrap()["points"], 150);
    }

    #[tokio::test]
    async fn test_invalid_patch_is_rejected_before_any_write() {
        let f = fixture();
        let key = PlayerKey::new("p1");

        let err = f.cache.update(&key, json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = f.cache.update(&key, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = f.cache.update(&PlayerKey::new("../etc"), json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        assert!(!f.files.resolve(&key.relative_path()).exists());
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_rereads_external_edit() {
        let f = fixture();
        let key = PlayerKey::new("p3");
        let mut record = f.cache.load(&key).await.unwrap();

        record.data.insert("points".into(), json!(999));
        f.files.write(&key.relative_path(), &record).await.unwrap();
        assert_eq!(f.cache.load(&key).await.unwrap().data["points"], 0);

        assert!(f.cache.invalidate(&key));
        assert_eq!(f.cache.load(&key).await.unwrap().data["points"], 999);
    }

    #[tokio::test]
    async fn test_remove_replicates_delete() {
        let f = fixture();
        let key = PlayerKey::new("p4");
        f.cache.update(&key, json!({"points": 5})).await.unwrap();
        f.queues.flush_all().await.unwrap();

        f.cache.remove(&key).await.unwrap();
        assert!(f.cache.get_cached(&key).is_none());
        assert!(matches!(f.cache.remove(&key).await, Err(EngineError::NotFound(_))));

        f.queues.flush_all().await.unwrap();
        assert!(f.store.get(EntityKind::PlayerState, "p4").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined_and_rebuilt() {
        let f = fixture();
        let key = PlayerKey::new("p5");
        let path = f.files.resolve(&key.relative_path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{\"points\": 12").unwrap();

        let (record, source) = f.cache.load_with_source(&key).await.unwrap();
        assert_eq!(source, LoadSource::Defaults);
        assert_eq!(record.data["points"], 0);

        let quarantined = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("p5.json.corrupt-"));
        assert!(quarantined);
    }
}
