//! End-to-end scenarios for the tree's public operations.

mod common;

use bztree::{BzTree, TreeParams};

/// Insert a few out-of-order keys, read them back, and scan a range.
#[test]
fn point_ops_and_scan_on_small_tree() {
    common::init_tracing();
    let tree = BzTree::new();

    assert!(tree.insert(b"bdef", 100));
    assert!(tree.insert(b"def", 200));
    assert!(tree.insert(b"abc", 300));

    assert_eq!(tree.read(b"abc"), Some(300));
    assert_eq!(tree.read(b"bdef"), Some(100));
    assert_eq!(tree.read(b"zzz"), None);

    let scanned: Vec<(Vec<u8>, u64)> = tree
        .range_scan(b"a", b"e")
        .map(|r| (r.key().to_vec(), r.payload()))
        .collect();
    assert_eq!(
        scanned,
        vec![
            (b"abc".to_vec(), 300),
            (b"bdef".to_vec(), 100),
            (b"def".to_vec(), 200),
        ]
    );
}

/// A duplicate insert is rejected and leaves the first payload in place.
#[test]
fn duplicate_insert_rejected() {
    common::init_tracing();
    let tree = BzTree::new();

    assert!(tree.insert(b"abc", 100));
    assert!(!tree.insert(b"abc", 200));
    assert_eq!(tree.read(b"abc"), Some(100));
}

/// 1024 small keys overflow a 4 KiB leaf (3 KiB split threshold); after
/// quiescence the tree has split and every key is readable.
#[test]
fn split_keeps_all_keys_readable() {
    common::init_tracing();
    let tree = BzTree::new();

    for i in 0..1024u32 {
        let key = format!("k{i:03}");
        assert!(tree.insert(key.as_bytes(), u64::from(i)), "insert {i}");
    }
    tree.assert_invariants();

    for i in 0..1024u32 {
        let key = format!("k{i:03}");
        assert_eq!(tree.read(key.as_bytes()), Some(u64::from(i)), "read {i}");
    }

    let count = tree.range_scan(b"k", b"l").count();
    assert_eq!(count, 1024);
}

/// Update and delete flow: updates replace payloads, deletes hide keys
/// until reinsertion.
#[test]
fn update_delete_reinsert() {
    common::init_tracing();
    let tree = BzTree::new();

    for i in 0..10u32 {
        tree.insert(format!("key{i}").as_bytes(), u64::from(i));
    }

    assert!(tree.update(b"key3", 333));
    assert_eq!(tree.read(b"key3"), Some(333));
    assert!(!tree.update(b"nokey", 1));

    assert!(tree.delete(b"key3"));
    assert_eq!(tree.read(b"key3"), None);
    assert!(!tree.delete(b"key3"));

    assert!(tree.insert(b"key3", 3333));
    assert_eq!(tree.read(b"key3"), Some(3333));
}

/// Upsert inserts missing keys, overwrites existing ones, and no-ops on
/// equal payloads.
#[test]
fn upsert_semantics() {
    common::init_tracing();
    let tree = BzTree::new();

    tree.upsert(b"k", 1);
    assert_eq!(tree.read(b"k"), Some(1));

    tree.upsert(b"k", 2);
    assert_eq!(tree.read(b"k"), Some(2));

    // Equal payload short-circuit: still the same value afterwards.
    tree.upsert(b"k", 2);
    assert_eq!(tree.read(b"k"), Some(2));
}

/// Deleting half the keys and scanning returns exactly the survivors, in
/// order (consolidation may have rewritten leaves along the way).
#[test]
fn scan_after_deletes() {
    common::init_tracing();
    let tree = BzTree::new();

    for i in 0..10u32 {
        tree.insert(format!("key{i}").as_bytes(), u64::from(i));
    }
    for i in (0..10u32).step_by(2) {
        assert!(tree.delete(format!("key{i}").as_bytes()));
    }
    tree.assert_invariants();

    let keys: Vec<Vec<u8>> = tree
        .range_scan(b"key0", b"key9")
        .map(|r| r.key().to_vec())
        .collect();
    assert_eq!(
        keys,
        vec![
            b"key1".to_vec(),
            b"key3".to_vec(),
            b"key5".to_vec(),
            b"key7".to_vec(),
            b"key9".to_vec(),
        ]
    );
}

/// Two levels of splits: every originally inserted key still resolves, and
/// the structural invariants hold at every node.
#[test]
fn deep_tree_after_many_splits() {
    common::init_tracing();
    let tree = BzTree::new();

    const N: u32 = 20_000;
    for i in 0..N {
        let key = format!("user/{i:08}/profile");
        assert!(tree.insert(key.as_bytes(), u64::from(i)));
    }
    tree.assert_invariants();

    for i in 0..N {
        let key = format!("user/{i:08}/profile");
        assert_eq!(tree.read(key.as_bytes()), Some(u64::from(i)), "key {i}");
    }

    // Ordered full scan sees every record exactly once.
    let mut expected = 0u64;
    for record in tree.range_scan(b"user/", b"user0") {
        assert_eq!(record.payload(), expected);
        expected += 1;
    }
    assert_eq!(expected, u64::from(N));
}

/// Mixed workload against a shrunken node size to exercise splits and
/// consolidations aggressively.
#[test]
fn small_nodes_churn() {
    common::init_tracing();
    let tree = BzTree::with_params(TreeParams {
        leaf_node_size: 512,
        split_threshold: 384,
        merge_threshold: 128,
        max_freeze_retry: 2,
    });

    for round in 0..3u32 {
        for i in 0..500u32 {
            tree.upsert(format!("{i:05}").as_bytes(), u64::from(round * 1000 + i));
        }
        for i in (0..500u32).step_by(3) {
            tree.delete(format!("{i:05}").as_bytes());
        }
        tree.assert_invariants();
    }

    for i in 0..500u32 {
        let expected = if i % 3 == 0 {
            None
        } else {
            Some(u64::from(2000 + i))
        };
        assert_eq!(tree.read(format!("{i:05}").as_bytes()), expected, "key {i}");
    }
}

/// Keys that are prefixes of each other are distinct records: comparison is
/// bytewise with length as the tiebreak.
#[test]
fn prefix_keys_are_distinct() {
    common::init_tracing();
    let tree = BzTree::new();

    assert!(tree.insert(b"a", 1));
    assert!(tree.insert(b"ab", 2));
    assert!(tree.insert(b"abc", 3));

    assert_eq!(tree.read(b"a"), Some(1));
    assert_eq!(tree.read(b"ab"), Some(2));
    assert_eq!(tree.read(b"abc"), Some(3));

    let keys: Vec<Vec<u8>> = tree.range_scan(b"a", b"b").map(|r| r.key().to_vec()).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"ab".to_vec(), b"abc".to_vec()]);
}

/// Binary (non-UTF8) keys and extreme payloads survive round trips.
#[test]
fn binary_keys_and_payload_extremes() {
    common::init_tracing();
    let tree = BzTree::new();

    let keys: Vec<Vec<u8>> = vec![
        vec![0x00],
        vec![0x00, 0x00],
        vec![0xFF; 32],
        vec![0x01, 0xFE, 0x7F],
    ];
    for (i, key) in keys.iter().enumerate() {
        assert!(tree.insert(key, [0u64, 1, u64::MAX, 42][i]));
    }
    assert_eq!(tree.read(&[0x00]), Some(0));
    assert_eq!(tree.read(&[0x00, 0x00]), Some(1));
    assert_eq!(tree.read(&[0xFF; 32]), Some(u64::MAX));
    assert_eq!(tree.read(&[0x01, 0xFE, 0x7F]), Some(42));
}
