//! Property-based tests (fuzzing) for merge, key, and coalescing semantics.
//!
//! Uses proptest to generate random patches, ids, and operation sequences
//! and verify the engine's pure building blocks never panic and keep their
//! invariants.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};

use state_engine::batching::{BatchConfig, CoalescingBatcher, FlushReason};
use state_engine::record::{merge_patch, patch_from_value, validate_id};
use state_engine::{Document, OpType, PlayerKey, QueuedOperation, Record};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values, nested a few levels
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Generate a flat document with a small field vocabulary so patches overlap
fn document_strategy() -> impl Strategy<Value = Document> {
    prop::collection::btree_map("(points|energy|level|f[0-9])", arbitrary_json_strategy(), 0..8)
        .prop_map(|m| m.into_iter().collect())
}

fn op_type_strategy() -> impl Strategy<Value = OpType> {
    prop_oneof![Just(OpType::Create), Just(OpType::Update), Just(OpType::Delete)]
}

// =============================================================================
// Merge properties
// =============================================================================

proptest! {
    /// Every patch field wins; every other field is untouched
    #[test]
    fn merge_is_last_field_wins(base in document_strategy(), patch in document_strategy()) {
        let mut merged = base.clone();
        merge_patch(&mut merged, &patch);

        for (field, value) in &patch {
            prop_assert_eq!(merged.get(field), Some(value));
        }
        for (field, value) in &base {
            if !patch.contains_key(field) {
                prop_assert_eq!(merged.get(field), Some(value));
            }
        }
        prop_assert!(merged.len() <= base.len() + patch.len());
    }

    /// Applying the same patch twice changes nothing the second time
    #[test]
    fn merge_is_idempotent(base in document_strategy(), patch in document_strategy()) {
        let mut once = base.clone();
        merge_patch(&mut once, &patch);
        let mut twice = once.clone();
        merge_patch(&mut twice, &patch);
        prop_assert_eq!(once, twice);
    }

    /// Sequential patches equal one patch of their union, later fields winning
    #[test]
    fn sequential_patches_compose(
        base in document_strategy(),
        first in document_strategy(),
        second in document_strategy(),
    ) {
        let mut sequential = base.clone();
        merge_patch(&mut sequential, &first);
        merge_patch(&mut sequential, &second);

        let mut union = first.clone();
        merge_patch(&mut union, &second);
        let mut combined = base;
        merge_patch(&mut combined, &union);

        prop_assert_eq!(sequential, combined);
    }

    /// Records never move `updated_at` backwards
    #[test]
    fn record_timestamps_are_monotonic(patches in prop::collection::vec(document_strategy(), 1..5)) {
        let mut record = Record::new("1", Document::new());
        let created = record.created_at;
        for patch in &patches {
            let before = record.updated_at;
            record.apply_patch(patch);
            prop_assert!(record.updated_at >= before);
        }
        prop_assert_eq!(record.created_at, created);
    }

    /// Arbitrary input never panics; only non-empty objects are accepted
    #[test]
    fn patch_validation_never_panics(value in arbitrary_json_strategy()) {
        let accepted = matches!(&value, Value::Object(m) if !m.is_empty());
        prop_assert_eq!(patch_from_value(value).is_ok(), accepted);
    }
}

// =============================================================================
// Key properties
// =============================================================================

proptest! {
    /// Accepted ids can never escape the data directory
    #[test]
    fn valid_ids_are_plain_file_names(id in ".{0,40}") {
        if validate_id("id", &id).is_ok() {
            prop_assert!(!id.is_empty());
            prop_assert!(!id.contains('/'));
            prop_assert!(!id.contains('\\'));
            prop_assert!(!id.contains(".."));
        }
    }

    /// Player paths stay one level under `players/` whatever the username
    #[test]
    fn player_paths_stay_inside_players_dir(id in "[0-9]{1,12}", username in ".{0,80}") {
        let key = PlayerKey::new(id.clone()).with_username(username);
        prop_assert!(key.validate().is_ok());

        let path = key.relative_path();
        let components: Vec<_> = path.components().collect();
        prop_assert_eq!(components.len(), 2);
        prop_assert_eq!(path.parent().and_then(|p| p.to_str()), Some("players"));

        let file_name = path.file_name().and_then(|f| f.to_str()).unwrap_or_default().to_string();
        let expected_suffix = format!("{id}.json");
        prop_assert!(file_name.ends_with(&expected_suffix));
    }
}

// =============================================================================
// Coalescing properties
// =============================================================================

proptest! {
    /// Any burst of operations on one key leaves a single entry carrying the
    /// last payload; a trailing delete always wins
    #[test]
    fn burst_coalesces_to_last_payload(ops in prop::collection::vec(op_type_strategy(), 1..20)) {
        let mut batcher = CoalescingBatcher::new(BatchConfig { flush_count: 1000 });
        for (i, op) in ops.iter().enumerate() {
            batcher.push(QueuedOperation::new("player", json!({"seq": i}), *op));
        }
        prop_assert_eq!(batcher.len(), 1);

        let taken = batcher.take_due(std::time::Instant::now(), FlushReason::Manual);
        prop_assert_eq!(taken.len(), 1);
        prop_assert_eq!(&taken[0].payload, &json!({"seq": ops.len() - 1}));

        let expected = ops[1..].iter().fold(ops[0], |acc, op| acc.coalesce(*op));
        prop_assert_eq!(taken[0].op_type, expected);
        if ops.last() == Some(&OpType::Delete) {
            prop_assert_eq!(taken[0].op_type, OpType::Delete);
        }
    }

    /// Distinct keys are never merged and come out in first-enqueue order
    #[test]
    fn distinct_keys_keep_enqueue_order(keys in prop::collection::vec("[a-z]{1,4}", 1..30)) {
        let mut batcher = CoalescingBatcher::new(BatchConfig { flush_count: 1000 });
        let mut first_seen: Vec<String> = Vec::new();
        for key in &keys {
            if !first_seen.contains(key) {
                first_seen.push(key.clone());
            }
            batcher.push(QueuedOperation::new(key.clone(), Value::Null, OpType::Update));
        }

        let taken: Vec<String> = batcher
            .take_due(std::time::Instant::now(), FlushReason::Manual)
            .into_iter()
            .map(|op| op.key)
            .collect();
        prop_assert_eq!(taken, first_seen);
    }
}
