//! Integration Tests for the State Engine
//!
//! End-to-end tests through the public [`StateEngine`] API against a real
//! temp directory and the in-memory secondary store. No external services.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: merges, replication, collections, lifecycle
//! - `recovery_*` - Crash leftovers, corrupt files, persisted backlog

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use state_engine::{
    CollectionKind, Document, EngineConfig, EngineError, EngineState, EntityKind, InMemorySecondaryStore, LoadSource,
    PlayerKey, ReplicationError, SecondaryStore, StateEngine,
};

// =============================================================================
// Helpers
// =============================================================================

/// Config whose queues only flush when asked to.
fn manual_flush_config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = EngineConfig {
        data_dir: dir.path().to_path_buf(),
        shutdown_grace_ms: 500,
        ..Default::default()
    };
    config.player_queue.flush_interval_ms = 60_000;
    config.player_queue.retry_delay_ms = 10;
    config.catalog_queue.flush_interval_ms = 60_000;
    config.catalog_queue.retry_delay_ms = 10;
    config
}

async fn running_engine(config: EngineConfig) -> (StateEngine, Arc<InMemorySecondaryStore>) {
    let store = Arc::new(InMemorySecondaryStore::new());
    let engine = StateEngine::new(config, store.clone());
    engine.init().await.expect("init failed");
    (engine, store)
}

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("object")
}

/// Secondary store that is unreachable for every call.
struct UnreachableStore;

#[async_trait]
impl SecondaryStore for UnreachableStore {
    async fn create_record(&self, _: EntityKind, _: &str, _: &Document) -> Result<(), ReplicationError> {
        Err(ReplicationError::Transient("connection refused".into()))
    }
    async fn update_record(&self, _: EntityKind, _: &str, _: &Document) -> Result<(), ReplicationError> {
        Err(ReplicationError::Transient("connection refused".into()))
    }
    async fn delete_record(&self, _: EntityKind, _: &str) -> Result<(), ReplicationError> {
        Err(ReplicationError::Transient("connection refused".into()))
    }
    async fn fetch_record(&self, _: EntityKind, _: &str) -> Result<Option<Document>, ReplicationError> {
        Err(ReplicationError::Transient("connection refused".into()))
    }
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn happy_sequential_updates_merge() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = running_engine(manual_flush_config(&dir)).await;
    let player = PlayerKey::new("1001");

    engine.update(&player, json!({"points": 10})).await.unwrap();
    engine.update(&player, json!({"energy": 5})).await.unwrap();
    engine.update(&player, json!({"points": 20})).await.unwrap();

    let state = engine.load(&player).await.unwrap();
    assert_eq!(state.data["points"], 20);
    assert_eq!(state.data["energy"], 5);
    // Untouched defaults survive a shallow merge
    assert_eq!(state.data["level"], 1);
    assert_eq!(state.data["currentCharacter"], "default");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn happy_concurrent_updates_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = running_engine(manual_flush_config(&dir)).await;
    let engine = Arc::new(engine);
    let player = PlayerKey::new("2002");

    let mut handles = Vec::new();
    for i in 0..50 {
        let engine = Arc::clone(&engine);
        let player = player.clone();
        handles.push(tokio::spawn(async move {
            let mut patch = serde_json::Map::new();
            patch.insert(format!("field{i}"), json!(i));
            engine.update(&player, patch.into()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Re-read from disk, not the cache
    engine.invalidate(&player);
    let state = engine.load(&player).await.unwrap();
    for i in 0..50 {
        assert_eq!(state.data[&format!("field{i}")], i, "field{i} lost");
    }

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn happy_repeated_patch_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = running_engine(manual_flush_config(&dir)).await;
    let player = PlayerKey::new("3003");

    let first = engine.update(&player, json!({"points": 42, "level": 3})).await.unwrap();
    let second = engine.update(&player, json!({"points": 42, "level": 3})).await.unwrap();
    assert_eq!(first.data, second.data);
    assert_eq!(first.created_at, second.created_at);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn happy_points_reach_secondary_within_flush_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = manual_flush_config(&dir);
    config.player_queue.flush_interval_ms = 50;
    let (engine, store) = running_engine(config).await;
    let player = PlayerKey::new("1").with_username("alice");

    let state = engine.update(&player, json!({"points": 150})).await.unwrap();
    assert_eq!(state.data["points"], 150);
    assert!(dir.path().join("players/alice_1.json").exists());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let row = store.get(EntityKind::PlayerState, "1").expect("row replicated");
    assert_eq!(row["points"], 150);

    let report = engine.shutdown().await.unwrap();
    assert!(report.fully_drained());
}

#[tokio::test]
async fn happy_load_seeds_from_secondary_store() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = running_engine(manual_flush_config(&dir)).await;
    store.insert(EntityKind::PlayerState, "77", doc(json!({"points": 77})));
    let player = PlayerKey::new("77");

    let (record, source) = engine.cache().load_with_source(&player).await.unwrap();
    assert_eq!(source, LoadSource::SecondaryStore);
    assert_eq!(record.data["points"], 77);
    assert!(dir.path().join("players/77.json").exists());
    // Already present remotely: nothing to replicate
    assert_eq!(engine.status().replication.total_pending, 0);

    let (_, source) = engine.cache().load_with_source(&player).await.unwrap();
    assert_eq!(source, LoadSource::Cache);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn happy_unreachable_secondary_never_blocks_updates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = manual_flush_config(&dir);
    config.shutdown_grace_ms = 100;
    let engine = StateEngine::new(config, Arc::new(UnreachableStore));
    engine.init().await.unwrap();
    let player = PlayerKey::new("404");

    let (record, source) = engine.cache().load_with_source(&player).await.unwrap();
    assert_eq!(source, LoadSource::Defaults);
    assert_eq!(record.data["points"], 0);

    let state = engine.update(&player, json!({"points": 9})).await.unwrap();
    assert_eq!(state.data["points"], 9);

    let summary = engine.flush_all().await.unwrap();
    assert_eq!(summary.retrying, 1);
    assert_eq!(engine.load(&player).await.unwrap().data["points"], 9);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn happy_remove_player() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = running_engine(manual_flush_config(&dir)).await;
    let player = PlayerKey::new("55");

    let err = engine.remove(&player).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    engine.update(&player, json!({"points": 1})).await.unwrap();
    engine.flush_all().await.unwrap();
    assert!(store.get(EntityKind::PlayerState, "55").is_some());

    engine.remove(&player).await.unwrap();
    assert!(!dir.path().join("players/55.json").exists());
    assert!(engine.cache().get_cached(&player).is_none());

    engine.flush_all().await.unwrap();
    assert!(store.get(EntityKind::PlayerState, "55").is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn happy_collections_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = running_engine(manual_flush_config(&dir)).await;
    let collections = engine.collections().unwrap();

    collections
        .create(CollectionKind::Upgrades, "multitap", json!({"cost": 100, "level": 1}))
        .await
        .unwrap();
    collections
        .create(CollectionKind::Characters, "knight", json!({"price": 500}))
        .await
        .unwrap();
    collections
        .update(CollectionKind::Upgrades, "multitap", json!({"level": 2}))
        .await
        .unwrap();

    assert!(dir.path().join("upgrades.json").exists());
    assert!(dir.path().join("characters/knight.json").exists());

    let upgrade = collections.get(CollectionKind::Upgrades, "multitap").await.unwrap().unwrap();
    assert_eq!(upgrade.data["cost"], 100);
    assert_eq!(upgrade.data["level"], 2);

    engine.flush_all().await.unwrap();
    assert_eq!(store.get(EntityKind::Upgrades, "multitap").unwrap()["level"], 2);
    assert_eq!(store.get(EntityKind::Characters, "knight").unwrap()["price"], 500);

    // The handle counts as an in-flight request until dropped
    drop(collections);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn happy_lifecycle_states() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StateEngine::new(manual_flush_config(&dir), Arc::new(InMemorySecondaryStore::new()));
    let mut states = engine.state_receiver();
    let player = PlayerKey::new("8");

    assert_eq!(engine.state(), EngineState::Created);
    let err = engine.update(&player, json!({"points": 1})).await.unwrap_err();
    assert!(matches!(err, EngineError::NotRunning(_)));

    engine.init().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), EngineState::Running);
    // Second init is a no-op
    engine.init().await.unwrap();

    engine.update(&player, json!({"points": 1})).await.unwrap();
    engine.shutdown().await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(matches!(engine.load(&player).await, Err(EngineError::NotRunning(_))));

    // A stopped engine can be brought back
    engine.init().await.unwrap();
    assert_eq!(engine.load(&player).await.unwrap().data["points"], 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn happy_invalid_input_rejected_before_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = running_engine(manual_flush_config(&dir)).await;

    let err = engine.update(&PlayerKey::new("../etc"), json!({"points": 1})).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let player = PlayerKey::new("9");
    let err = engine.update(&player, json!(["not", "an", "object"])).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(!dir.path().join("players/9.json").exists());

    engine.shutdown().await.unwrap();
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn recovery_init_sweeps_orphaned_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let players = dir.path().join("players");
    std::fs::create_dir_all(&players).unwrap();

    let committed = json!({
        "key": "12",
        "data": {"points": 5},
        "createdAt": 1,
        "updatedAt": 1,
    });
    std::fs::write(players.join("12.json"), committed.to_string()).unwrap();
    // A crash between write and rename leaves a half-written temp file
    std::fs::write(players.join("12.json.tmp"), b"{\"key\":\"12\",\"da").unwrap();

    let (engine, _) = running_engine(manual_flush_config(&dir)).await;
    assert!(!players.join("12.json.tmp").exists());

    let state = engine.load(&PlayerKey::new("12")).await.unwrap();
    assert_eq!(state.data["points"], 5);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn recovery_corrupt_player_file_is_quarantined_and_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let players = dir.path().join("players");
    std::fs::create_dir_all(&players).unwrap();
    std::fs::write(players.join("13.json"), b"{ not json").unwrap();

    let (engine, _) = running_engine(manual_flush_config(&dir)).await;
    let (record, source) = engine.cache().load_with_source(&PlayerKey::new("13")).await.unwrap();
    assert_eq!(source, LoadSource::Defaults);
    assert_eq!(record.data["points"], 0);

    let names: Vec<String> = std::fs::read_dir(&players)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.starts_with("13.json.corrupt-")), "{names:?}");
    assert!(names.iter().any(|n| n == "13.json"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn recovery_backlog_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = manual_flush_config(&dir);
    config.shutdown_grace_ms = 200;
    let player = PlayerKey::new("21");

    {
        let engine = StateEngine::new(config.clone(), Arc::new(UnreachableStore));
        engine.init().await.unwrap();
        engine.update(&player, json!({"points": 99})).await.unwrap();

        let report = engine.shutdown().await.unwrap();
        assert_eq!(report.persisted_backlog, 1);
        assert!(dir.path().join(".sync-backlog.json").exists());
    }

    let (engine, store) = running_engine(config).await;
    assert!(!dir.path().join(".sync-backlog.json").exists());
    assert_eq!(engine.status().replication.total_pending, 1);

    engine.flush_all().await.unwrap();
    assert_eq!(store.get(EntityKind::PlayerState, "21").unwrap()["points"], 99);

    let report = engine.shutdown().await.unwrap();
    assert!(report.fully_drained());
    assert!(!dir.path().join(".sync-backlog.json").exists());
}
