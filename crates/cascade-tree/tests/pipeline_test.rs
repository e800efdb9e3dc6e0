//! End-to-end pipeline tests for the cascade tree.
//!
//! Covers the full ingest → flush → drain cycle at test-scaled buffer
//! sizes: aggregation correctness against a hash-map oracle, output
//! ordering, hash collisions, root rotation, splits, clear/reuse, and a
//! pool-size × fanout stress matrix.

use cascade_buffer::SortOffload;
use cascade_common::{CascadeError, Record, Result, TreeConfig, KEY_SIZE};
use cascade_tree::CascadeTree;
use std::collections::HashMap;
use std::sync::Arc;

fn fnv1a(key: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in key {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn rec(key: &str, value: u64) -> Record {
    Record::new(fnv1a(key.as_bytes()), key.as_bytes(), value)
}

fn test_config() -> TreeConfig {
    TreeConfig {
        fanout: 4,
        buffer_capacity: 1024,
        buffer_threshold: 512,
        root_pool_size: 4,
        sorter_threads: 2,
        merger_threads: 2,
        emptier_threads: 2,
    }
}

fn drain(tree: &mut CascadeTree) -> Vec<Record> {
    let mut out = Vec::new();
    while let Some(record) = tree.next_value().unwrap() {
        out.push(record);
    }
    out
}

/// Output must be non-decreasing in hash, with pairwise-distinct keys
/// inside every equal-hash run.
fn assert_ordered(records: &[Record]) {
    for i in 1..records.len() {
        let (prev, cur) = (&records[i - 1], &records[i]);
        assert!(prev.hash <= cur.hash, "hash order broken at {i}");
        if prev.hash == cur.hash {
            assert!(
                !prev.same_key(cur),
                "duplicate key within an equal-hash run at {i}"
            );
        }
    }
}

fn assert_matches_oracle(records: &[Record], oracle: &HashMap<[u8; KEY_SIZE], u64>) {
    assert_eq!(records.len(), oracle.len(), "output cardinality");
    for record in records {
        let expected = oracle
            .get(&record.key)
            .unwrap_or_else(|| panic!("unexpected key {:?}", record.key));
        assert_eq!(record.value, *expected, "value for key {:?}", record.key);
    }
}

#[test]
fn test_smoke_aggregation() {
    let mut tree = CascadeTree::new(test_config()).unwrap();
    for key in ["a", "b", "a", "a", "c", "b"] {
        tree.insert(rec(key, 1)).unwrap();
    }

    let out = drain(&mut tree);
    assert_eq!(out.len(), 3);
    assert_ordered(&out);

    let by_key: HashMap<[u8; KEY_SIZE], u64> =
        out.iter().map(|r| (r.key, r.value)).collect();
    assert_eq!(by_key[&rec("a", 0).key], 3);
    assert_eq!(by_key[&rec("b", 0).key], 2);
    assert_eq!(by_key[&rec("c", 0).key], 1);
}

#[test]
fn test_hash_collision_keys_stay_distinct() {
    let mut tree = CascadeTree::new(test_config()).unwrap();
    // Two distinct keys forced onto one hash.
    let k1 = Record::new(0x1234_5678, b"collide_one", 1);
    let k2 = Record::new(0x1234_5678, b"collide_two", 1);
    for _ in 0..100 {
        tree.insert(k1).unwrap();
        tree.insert(k2).unwrap();
    }

    let out = drain(&mut tree);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].hash, 0x1234_5678);
    assert_eq!(out[1].hash, 0x1234_5678);
    assert!(!out[0].same_key(&out[1]));
    assert_eq!(out[0].value, 100);
    assert_eq!(out[1].value, 100);
}

#[test]
fn test_split_scale_unique_keys() {
    let mut tree = CascadeTree::new(test_config()).unwrap();
    let total = 10 * 1024u32;

    let mut oracle = HashMap::new();
    let mut batch = Vec::with_capacity(256);
    for i in 0..total {
        let record = rec(&format!("unique_{i:07}"), 1);
        oracle.insert(record.key, 1u64);
        batch.push(record);
        if batch.len() == 256 {
            tree.bulk_insert(&batch).unwrap();
            batch.clear();
        }
    }
    tree.bulk_insert(&batch).unwrap();

    let first = tree.next_value().unwrap().expect("output expected");
    let stats = tree.stats();
    assert!(stats.height > 1, "tree must have split beyond a root leaf");
    assert!(stats.leaf_splits >= 1);

    let mut out = vec![first];
    out.extend(drain(&mut tree));
    assert_ordered(&out);
    assert_matches_oracle(&out, &oracle);
}

#[test]
fn test_root_rotation_cycles_without_deadlock() {
    let mut tree = CascadeTree::new(test_config()).unwrap();

    // Ten threshold-sized batches force repeated rotations through the
    // four-buffer root pool.
    let mut oracle: HashMap<[u8; KEY_SIZE], u64> = HashMap::new();
    for batch_no in 0..10u32 {
        let batch: Vec<Record> = (0..600u32)
            .map(|i| rec(&format!("rot_{batch_no}_{i}"), 1))
            .collect();
        for record in &batch {
            *oracle.entry(record.key).or_insert(0) += 1;
        }
        tree.bulk_insert(&batch).unwrap();
    }

    let first = tree.next_value().unwrap().expect("output expected");
    assert!(tree.stats().rotations >= 9);

    let mut out = vec![first];
    out.extend(drain(&mut tree));
    assert_matches_oracle(&out, &oracle);
}

#[test]
fn test_empty_tree_drains_immediately() {
    let mut tree = CascadeTree::new(test_config()).unwrap();
    assert!(tree.next_value().unwrap().is_none());
    // No worker ever ran: the engine never even started.
    assert_eq!(tree.stats(), Default::default());
}

#[test]
fn test_clear_discards_first_batch() {
    let mut tree = CascadeTree::new(test_config()).unwrap();

    let first: Vec<Record> = (0..2_000).map(|i| rec(&format!("first_{i}"), 1)).collect();
    tree.bulk_insert(&first).unwrap();
    tree.clear().unwrap();

    let second: Vec<Record> = (0..1_500).map(|i| rec(&format!("second_{i}"), 2)).collect();
    tree.bulk_insert(&second).unwrap();

    let out = drain(&mut tree);
    assert_eq!(out.len(), 1_500);
    for record in &out {
        assert!(record.key.starts_with(b"second_"));
        assert_eq!(record.value, 2);
    }
}

#[test]
fn test_drain_is_idempotent() {
    let mut tree = CascadeTree::new(test_config()).unwrap();
    tree.insert(rec("once", 1)).unwrap();

    let out = drain(&mut tree);
    assert_eq!(out.len(), 1);

    for _ in 0..3 {
        assert!(tree.next_value().unwrap().is_none());
    }
}

#[test]
fn test_reuse_after_full_drain() {
    let mut tree = CascadeTree::new(test_config()).unwrap();

    tree.insert(rec("gen1", 1)).unwrap();
    let out = drain(&mut tree);
    assert_eq!(out.len(), 1);

    // Drain cleared the tree; a second generation starts fresh.
    tree.insert(rec("gen2", 5)).unwrap();
    tree.insert(rec("gen2", 7)).unwrap();
    let out = drain(&mut tree);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].value, 12);
}

#[test]
fn test_bulk_read() {
    let mut tree = CascadeTree::new(test_config()).unwrap();
    for i in 0..10 {
        tree.insert(rec(&format!("bulk_{i}"), 1)).unwrap();
    }

    let mut out = Vec::new();
    assert!(tree.bulk_read(&mut out, 4).unwrap());
    assert_eq!(out.len(), 4);

    assert!(!tree.bulk_read(&mut out, 100).unwrap());
    assert_eq!(out.len(), 10);
    assert_ordered(&out);
}

#[test]
fn test_closed_engine_rejects_calls() {
    let mut tree = CascadeTree::new(test_config()).unwrap();
    tree.insert(rec("x", 1)).unwrap();
    tree.close();

    assert!(matches!(
        tree.insert(rec("y", 1)),
        Err(CascadeError::EngineClosed)
    ));
    assert!(matches!(
        tree.next_value(),
        Err(CascadeError::EngineClosed)
    ));
    assert!(matches!(tree.clear(), Err(CascadeError::EngineClosed)));
}

#[test]
fn test_insert_during_drain_rejected() {
    let mut tree = CascadeTree::new(test_config()).unwrap();
    for i in 0..10 {
        tree.insert(rec(&format!("mid_{i}"), 1)).unwrap();
    }
    assert!(tree.next_value().unwrap().is_some());

    // Drain is in progress: ingest must be refused, not wedged.
    assert!(matches!(
        tree.insert(rec("late", 1)),
        Err(CascadeError::InvariantViolation(_))
    ));

    // The drain itself continues unharmed.
    let rest = drain(&mut tree);
    assert_eq!(rest.len(), 9);
}

#[test]
fn test_invalid_config_rejected() {
    let config = TreeConfig {
        fanout: 1,
        ..test_config()
    };
    assert!(matches!(
        CascadeTree::new(config),
        Err(CascadeError::Config(_))
    ));
}

fn run_stress(
    sorters: usize,
    mergers: usize,
    emptiers: usize,
    fanout: usize,
) -> (Vec<Record>, HashMap<[u8; KEY_SIZE], u64>) {
    let config = TreeConfig {
        fanout,
        buffer_capacity: 512,
        buffer_threshold: 256,
        root_pool_size: 4,
        sorter_threads: sorters,
        merger_threads: mergers,
        emptier_threads: emptiers,
    };
    let mut tree = CascadeTree::new(config).unwrap();

    let mut oracle: HashMap<[u8; KEY_SIZE], u64> = HashMap::new();
    let mut batch = Vec::with_capacity(500);
    for i in 0..40_000u64 {
        let record = rec(&format!("key_{:05}", i % 3_000), i % 7 + 1);
        *oracle.entry(record.key).or_insert(0) += i % 7 + 1;
        batch.push(record);
        if batch.len() == 500 {
            tree.bulk_insert(&batch).unwrap();
            batch.clear();
        }
    }
    tree.bulk_insert(&batch).unwrap();

    (drain(&mut tree), oracle)
}

#[test]
fn test_stress_matrix_matches_oracle() {
    for &(sorters, mergers, emptiers) in &[(1, 1, 1), (2, 4, 4), (4, 2, 1)] {
        for &fanout in &[2usize, 8] {
            let (out, oracle) = run_stress(sorters, mergers, emptiers, fanout);
            assert_ordered(&out);
            assert_matches_oracle(&out, &oracle);
        }
    }
}

struct MirrorOffload;

impl SortOffload for MirrorOffload {
    fn sort(&self, hashes: &mut [u32], records: &mut [Record]) -> Result<()> {
        let mut order: Vec<usize> = (0..hashes.len()).collect();
        order.sort_by_key(|&i| hashes[i]);
        let sorted_hashes: Vec<u32> = order.iter().map(|&i| hashes[i]).collect();
        let sorted_records: Vec<Record> = order.iter().map(|&i| records[i]).collect();
        hashes.copy_from_slice(&sorted_hashes);
        records.copy_from_slice(&sorted_records);
        Ok(())
    }
}

struct FlakyOffload;

impl SortOffload for FlakyOffload {
    fn sort(&self, _hashes: &mut [u32], _records: &mut [Record]) -> Result<()> {
        Err(CascadeError::Offload("simulated device failure".to_string()))
    }
}

fn offload_workload(mut tree: CascadeTree) -> Vec<Record> {
    let mut batch = Vec::new();
    for i in 0..5_000u32 {
        batch.push(rec(&format!("off_{:04}", i % 800), 1));
    }
    tree.bulk_insert(&batch).unwrap();
    drain(&mut tree)
}

/// Canonical order for comparison: equal-hash collision runs may be
/// emitted in either key order depending on the sort implementation.
fn normalized(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by(|a, b| (a.hash, a.key).cmp(&(b.hash, b.key)));
    records
}

#[test]
fn test_offload_sort_matches_cpu() {
    let cpu = offload_workload(CascadeTree::new(test_config()).unwrap());
    let offloaded = offload_workload(
        CascadeTree::with_offload(test_config(), Arc::new(MirrorOffload)).unwrap(),
    );

    assert_ordered(&offloaded);
    assert_eq!(normalized(cpu), normalized(offloaded));
}

#[test]
fn test_offload_failure_falls_back_to_cpu() {
    let cpu = offload_workload(CascadeTree::new(test_config()).unwrap());
    let fallback = offload_workload(
        CascadeTree::with_offload(test_config(), Arc::new(FlakyOffload)).unwrap(),
    );

    assert_ordered(&fallback);
    assert_eq!(normalized(cpu), normalized(fallback));
}
