//! Property-based tests for the tree.
//!
//! Differential testing against `BTreeMap` as an oracle: byte-string keys
//! compare identically under slice ordering, so any divergence in contents
//! or scan order is a bug.

mod common;

use std::collections::BTreeMap;

use bztree::{BzTree, TreeParams};
use proptest::prelude::*;

/// Keys stay small so collisions and ordering edge cases are frequent.
fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=12)
}

#[derive(Debug, Clone)]
enum Op {
    Insert(Vec<u8>, u64),
    Read(Vec<u8>),
    Update(Vec<u8>, u64),
    Upsert(Vec<u8>, u64),
    Delete(Vec<u8>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (key_strategy(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        2 => key_strategy().prop_map(Op::Read),
        2 => (key_strategy(), any::<u64>()).prop_map(|(k, v)| Op::Update(k, v)),
        2 => (key_strategy(), any::<u64>()).prop_map(|(k, v)| Op::Upsert(k, v)),
        2 => key_strategy().prop_map(Op::Delete),
    ]
}

/// Small nodes so even short op sequences cross split and consolidation
/// paths.
fn small_tree() -> BzTree {
    BzTree::with_params(TreeParams {
        leaf_node_size: 512,
        split_threshold: 384,
        merge_threshold: 128,
        max_freeze_retry: 2,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every inserted key reads back with its payload.
    #[test]
    fn insert_then_read(key in key_strategy(), payload: u64) {
        let tree = BzTree::new();
        prop_assert!(tree.insert(&key, payload));
        prop_assert_eq!(tree.read(&key), Some(payload));
    }

    /// Re-inserting is rejected and preserves the first payload.
    #[test]
    fn insert_is_first_writer_wins(key in key_strategy(), v1: u64, v2: u64) {
        let tree = BzTree::new();
        prop_assert!(tree.insert(&key, v1));
        prop_assert!(!tree.insert(&key, v2));
        prop_assert_eq!(tree.read(&key), Some(v1));
    }

    /// Update on a missing key is NotFound; delete then read is None.
    #[test]
    fn update_missing_and_delete(key in key_strategy(), payload: u64) {
        let tree = BzTree::new();
        prop_assert!(!tree.update(&key, payload));
        prop_assert!(tree.insert(&key, payload));
        prop_assert!(tree.delete(&key));
        prop_assert_eq!(tree.read(&key), None);
        prop_assert!(!tree.delete(&key));
    }

    /// An arbitrary op sequence leaves the tree agreeing with the oracle on
    /// every touched key and on a full ordered scan.
    #[test]
    fn matches_btreemap_oracle(ops in prop::collection::vec(op_strategy(), 1..400)) {
        let tree = small_tree();
        let mut oracle: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Insert(k, v) => {
                    let fresh = tree.insert(k, *v);
                    prop_assert_eq!(fresh, !oracle.contains_key(k));
                    if fresh {
                        oracle.insert(k.clone(), *v);
                    }
                }
                Op::Read(k) => {
                    prop_assert_eq!(tree.read(k), oracle.get(k).copied());
                }
                Op::Update(k, v) => {
                    let hit = tree.update(k, *v);
                    prop_assert_eq!(hit, oracle.contains_key(k));
                    if hit {
                        oracle.insert(k.clone(), *v);
                    }
                }
                Op::Upsert(k, v) => {
                    tree.upsert(k, *v);
                    oracle.insert(k.clone(), *v);
                }
                Op::Delete(k) => {
                    let hit = tree.delete(k);
                    prop_assert_eq!(hit, oracle.remove(k).is_some());
                }
            }
        }

        tree.assert_invariants();

        // Every oracle key reads back.
        for (k, v) in &oracle {
            prop_assert_eq!(tree.read(k), Some(*v));
        }

        // Full scan equals the oracle's ordered contents.
        let scanned: Vec<(Vec<u8>, u64)> = tree
            .range_scan(&[0x00], &[0xFF; 13])
            .map(|r| (r.key().to_vec(), r.payload()))
            .collect();
        let expected: Vec<(Vec<u8>, u64)> =
            oracle.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(scanned, expected);
    }

    /// Range scans agree with the oracle on arbitrary inclusive bounds.
    #[test]
    fn range_scan_matches_oracle(
        pairs in prop::collection::vec((key_strategy(), any::<u64>()), 0..150),
        bound_a in key_strategy(),
        bound_b in key_strategy(),
    ) {
        let tree = small_tree();
        let mut oracle: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        for (k, v) in &pairs {
            tree.upsert(k, *v);
            oracle.insert(k.clone(), *v);
        }

        let (lo, hi) = if bound_a <= bound_b {
            (bound_a, bound_b)
        } else {
            (bound_b, bound_a)
        };

        let scanned: Vec<(Vec<u8>, u64)> = tree
            .range_scan(&lo, &hi)
            .map(|r| (r.key().to_vec(), r.payload()))
            .collect();
        let expected: Vec<(Vec<u8>, u64)> = oracle
            .range(lo..=hi)
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        prop_assert_eq!(scanned, expected);
    }
}
