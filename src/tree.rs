//! Tree protocol: traversal, point operations, and structural changes.
//!
//! Every public operation enters an epoch, walks from the root to a leaf
//! while recording `(internal node, followed slot, slot metadata)`
//! breadcrumbs, and delegates to the leaf. `NodeFrozen` and MWCAS contention
//! are internal conditions that trigger re-traversal; only `Ok`,
//! `KeyExists` and `NotFound` shapes reach the caller.
//!
//! Structural changes never mutate internal nodes in place (except the child
//! pointer swing): a frozen node is replaced wholesale by a rewritten copy,
//! a split pair, or a new root, installed either by a three-word MWCAS in
//! the parent or by a CAS on the root cell. Replaced nodes are retired
//! through the epoch reclaimer; replacement nodes that lost an install race
//! were never reachable and are freed immediately.

use crossbeam_epoch::Guard;
use mwcas::{MwCas, U64Pointer};

use crate::alloc::{
    drop_node, publish_internal, publish_leaf, reclaim_subtree, retire_node, HeapAllocator,
    NodeAllocator,
};
use crate::internal::InternalSplit;
use crate::leaf::{LeafNode, SplitPlan};
use crate::node::{NodeRef, NodeStatus};
use crate::record_meta::RecordMeta;
use crate::scanner::Scanner;
use crate::tracing_helpers::{debug_log, warn_log};

/// Tunable parameters of a [`BzTree`].
#[derive(Clone, Copy, Debug)]
pub struct TreeParams {
    /// Byte budget of every leaf. Power of two.
    pub leaf_node_size: u32,
    /// A node whose projected footprint reaches this many bytes splits.
    pub split_threshold: u32,
    /// A leaf whose live bytes drop to this after a delete is consolidated.
    pub merge_threshold: u32,
    /// Freeze attempts before assuming a competing splitter owns the node.
    pub max_freeze_retry: u32,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            leaf_node_size: 4096,
            split_threshold: 3072,
            merge_threshold: 1024,
            max_freeze_retry: 2,
        }
    }
}

impl TreeParams {
    /// Largest accepted key: a fresh leaf must comfortably fit several
    /// records, and the metadata length field is 16 bits wide.
    pub fn max_key_len(&self) -> usize {
        ((self.split_threshold / 4) as usize).min(u16::MAX as usize)
    }

    fn validate(&self) {
        assert!(
            self.leaf_node_size.is_power_of_two(),
            "leaf_node_size must be a power of two"
        );
        assert!(
            (512..=1 << 22).contains(&self.leaf_node_size),
            "leaf_node_size out of range"
        );
        assert!(
            self.split_threshold >= 256 && self.split_threshold <= self.leaf_node_size,
            "split_threshold must be in [256, leaf_node_size]"
        );
        assert!(
            self.merge_threshold < self.split_threshold,
            "merge_threshold must be below split_threshold"
        );
    }
}

/// One traversal breadcrumb: an internal node, the slot followed out of it,
/// and that slot's metadata as observed. The metadata is re-asserted by the
/// child-swing MWCAS, so an install commits only against the still-intact
/// parent slot.
#[derive(Clone, Copy)]
struct Frame {
    node: NodeRef,
    slot: usize,
    meta: RecordMeta,
}

type Stack = Vec<Frame>;

/// Latch-free concurrent B+-tree from byte-string keys to `u64` payloads.
///
/// See the crate docs for the protocol overview.
pub struct BzTree {
    /// Address (in allocator-offset form) of the current root node.
    root: U64Pointer,
    params: TreeParams,
    alloc: HeapAllocator,
}

// SAFETY: all shared state is behind MWCAS cells and epoch-protected nodes.
unsafe impl Send for BzTree {}
unsafe impl Sync for BzTree {}

impl Default for BzTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BzTree {
    /// Tree with default parameters (4 KiB leaves, 3 KiB split threshold).
    pub fn new() -> Self {
        Self::with_params(TreeParams::default())
    }

    /// Tree with explicit parameters.
    ///
    /// # Panics
    ///
    /// Panics if the parameters are inconsistent (see [`TreeParams`]).
    pub fn with_params(params: TreeParams) -> Self {
        params.validate();
        let alloc = HeapAllocator;
        let root = publish_leaf(LeafNode::empty(params.leaf_node_size));
        alloc.flush(root.raw(), params.leaf_node_size as usize);
        Self {
            root: U64Pointer::new(alloc.to_offset(root.raw())),
            params,
            alloc,
        }
    }

    /// The configured parameters.
    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    // ========================================================================
    //  Public point operations
    // ========================================================================

    /// Insert `(key, payload)`. Returns `false` if the key already exists.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty or longer than [`TreeParams::max_key_len`].
    pub fn insert(&self, key: &[u8], payload: u64) -> bool {
        self.check_key(key);
        let guard = crossbeam_epoch::pin();
        let mut stack: Stack = Vec::with_capacity(8);
        let mut freeze_retry = 0u32;

        loop {
            let leaf_ref = self.traverse_to_leaf(key, &mut stack, &guard);
            match leaf_ref
                .leaf()
                .insert(key, payload, self.params.split_threshold, &guard)
            {
                NodeStatus::Ok => return true,
                NodeStatus::KeyExists => return false,
                NodeStatus::NodeFrozen => {
                    // Usually a competing split about to finish; if it keeps
                    // not finishing, supersede the frozen leaf ourselves.
                    freeze_retry += 1;
                    if freeze_retry > self.params.max_freeze_retry {
                        self.split_and_install(leaf_ref, key, &mut stack, &guard);
                    }
                }
                NodeStatus::NotEnoughSpace => {
                    if !leaf_ref.base().freeze(&guard) {
                        freeze_retry += 1;
                        if freeze_retry <= self.params.max_freeze_retry
                            || !leaf_ref.base().status_word(&guard).is_frozen()
                        {
                            continue;
                        }
                        // The node is frozen by someone who has not replaced
                        // it; split it regardless, the install CAS arbitrates.
                    }
                    self.split_and_install(leaf_ref, key, &mut stack, &guard);
                }
                status => unreachable!("leaf insert returned {status:?}"),
            }
        }
    }

    /// Read the payload stored under `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty or longer than [`TreeParams::max_key_len`].
    pub fn read(&self, key: &[u8]) -> Option<u64> {
        self.check_key(key);
        let guard = crossbeam_epoch::pin();
        let mut stack: Stack = Vec::with_capacity(8);
        let leaf_ref = self.traverse_to_leaf(key, &mut stack, &guard);
        leaf_ref.leaf().read(key, &guard)
    }

    /// Replace the payload stored under `key`. Returns `false` if the key is
    /// not present.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty or longer than [`TreeParams::max_key_len`].
    pub fn update(&self, key: &[u8], payload: u64) -> bool {
        self.check_key(key);
        let guard = crossbeam_epoch::pin();
        let mut stack: Stack = Vec::with_capacity(8);
        let mut freeze_retry = 0u32;

        loop {
            let leaf_ref = self.traverse_to_leaf(key, &mut stack, &guard);
            match leaf_ref.leaf().update(key, payload, &guard) {
                NodeStatus::Ok => return true,
                NodeStatus::NotFound => return false,
                NodeStatus::NodeFrozen => {
                    freeze_retry += 1;
                    if freeze_retry > self.params.max_freeze_retry {
                        self.split_and_install(leaf_ref, key, &mut stack, &guard);
                    }
                }
                status => unreachable!("leaf update returned {status:?}"),
            }
        }
    }

    /// Insert `(key, payload)` or replace the existing payload. Equal
    /// payloads short-circuit without writing.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty or longer than [`TreeParams::max_key_len`].
    pub fn upsert(&self, key: &[u8], payload: u64) {
        loop {
            match self.read(key) {
                Some(current) if current == payload => return,
                Some(_) => {
                    if self.update(key, payload) {
                        return;
                    }
                }
                None => {
                    if self.insert(key, payload) {
                        return;
                    }
                }
            }
            // A concurrent insert or delete moved the key between the read
            // and the write; redecide.
        }
    }

    /// Delete the record stored under `key`. Returns `false` if the key is
    /// not present.
    ///
    /// A delete that pushes the leaf's reclaimable bytes past a quarter of
    /// its budget, or its live bytes under `merge_threshold`, triggers
    /// consolidation of that leaf.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty or longer than [`TreeParams::max_key_len`].
    pub fn delete(&self, key: &[u8]) -> bool {
        self.check_key(key);
        let guard = crossbeam_epoch::pin();
        let mut stack: Stack = Vec::with_capacity(8);
        let mut freeze_retry = 0u32;

        loop {
            let leaf_ref = self.traverse_to_leaf(key, &mut stack, &guard);
            let leaf = leaf_ref.leaf();
            match leaf.delete(key, &guard) {
                NodeStatus::Ok => {
                    let status = leaf.status_word(&guard);
                    let live = status.block_size() - status.delete_size();
                    if status.delete_size() * 4 > leaf.size()
                        || live <= self.params.merge_threshold
                    {
                        self.try_consolidate(leaf_ref, key, &mut stack, &guard);
                    }
                    return true;
                }
                NodeStatus::NotFound => return false,
                NodeStatus::NodeFrozen => {
                    freeze_retry += 1;
                    if freeze_retry > self.params.max_freeze_retry {
                        self.split_and_install(leaf_ref, key, &mut stack, &guard);
                    }
                }
                status => unreachable!("leaf delete returned {status:?}"),
            }
        }
    }

    /// Ordered scan of every record with key in `[lo, hi]`, both inclusive.
    ///
    /// The scanner is lazy: it snapshots one leaf at a time under an epoch
    /// guard and may observe updates committed while the scan progresses.
    ///
    /// # Panics
    ///
    /// Panics if either bound is empty or longer than
    /// [`TreeParams::max_key_len`].
    pub fn range_scan(&self, lo: &[u8], hi: &[u8]) -> Scanner<'_> {
        self.check_key(lo);
        self.check_key(hi);
        Scanner::new(self, lo, hi)
    }

    /// Walk the whole tree and panic on any violated structural invariant.
    /// Diagnostic; linear in the tree size.
    pub fn assert_invariants(&self) {
        let guard = crossbeam_epoch::pin();
        let mut pending = vec![self.root_node(&guard)];
        while let Some(node) = pending.pop() {
            node.base().assert_invariants(&guard);
            if !node.is_leaf() {
                let internal = node.internal();
                for i in 0..internal.child_count() {
                    pending.push(self.resolve(internal.child_link(i, &guard)));
                }
            }
        }
    }

    // ========================================================================
    //  Traversal
    // ========================================================================

    #[inline]
    fn root_node(&self, guard: &Guard) -> NodeRef {
        self.resolve(self.root.read(guard))
    }

    #[inline]
    fn resolve(&self, link: u64) -> NodeRef {
        NodeRef::from_raw(self.alloc.to_direct(link))
    }

    /// Publish a freshly built leaf and flush it through the allocator seam
    /// before it can become reachable.
    fn publish_leaf_node(&self, node: Box<LeafNode>) -> NodeRef {
        let node = publish_leaf(node);
        self.alloc.flush(node.raw(), node.base().size() as usize);
        node
    }

    /// Publish a freshly built internal node, flushed likewise.
    fn publish_internal_node(&self, node: Box<crate::internal::InternalNode>) -> NodeRef {
        let node = publish_internal(node);
        self.alloc.flush(node.raw(), node.base().size() as usize);
        node
    }

    /// Walk to the leaf covering `key`, recording one breadcrumb per
    /// internal node. Point operations steer left on separator equality so
    /// an exact match cannot be missed.
    fn traverse_to_leaf(&self, key: &[u8], stack: &mut Stack, guard: &Guard) -> NodeRef {
        stack.clear();
        let mut node = self.root_node(guard);
        while !node.is_leaf() {
            let internal = node.internal();
            let slot = internal.get_child_index(key, true, guard);
            let meta = internal.meta(slot, guard);
            let child = self.resolve(internal.child_link(slot, guard));
            stack.push(Frame { node, slot, meta });
            node = child;
        }
        node
    }

    /// Same walk, stopping when `stop` is reached; its ancestors' frames end
    /// up on the stack. Returns `false` when the walk bottoms out in a leaf
    /// without meeting `stop`, meaning the node has left the tree.
    fn traverse_to_node(
        &self,
        key: &[u8],
        stop: NodeRef,
        stack: &mut Stack,
        guard: &Guard,
    ) -> bool {
        stack.clear();
        let mut node = self.root_node(guard);
        while node != stop {
            if node.is_leaf() {
                return false;
            }
            let internal = node.internal();
            let slot = internal.get_child_index(key, true, guard);
            let meta = internal.meta(slot, guard);
            let child = self.resolve(internal.child_link(slot, guard));
            stack.push(Frame { node, slot, meta });
            node = child;
        }
        true
    }

    /// Walk to the leaf covering `key` and report the tightest enclosing
    /// separator: every key in the returned leaf is `<=` that bound. Used by
    /// the scanner to step to the next leaf.
    pub(crate) fn leaf_for_scan(&self, key: &[u8], guard: &Guard) -> (NodeRef, Option<Box<[u8]>>) {
        let mut node = self.root_node(guard);
        let mut upper: Option<Box<[u8]>> = None;
        while !node.is_leaf() {
            let internal = node.internal();
            let slot = internal.get_child_index(key, true, guard);
            if slot + 1 < internal.child_count() {
                let meta = internal.meta(slot + 1, guard);
                // SAFETY: internal slots are visible and immutable.
                upper = Some(unsafe { internal.key_unchecked(meta) }.into());
            }
            node = self.resolve(internal.child_link(slot, guard));
        }
        (node, upper)
    }

    // ========================================================================
    //  Structural changes
    // ========================================================================

    /// Replace the frozen, overflowing (or stranded) `leaf_ref` with its
    /// split pair or dense rewrite, propagating separators up through as
    /// many frozen ancestors as necessary. Expects the stack to hold the
    /// traversal breadcrumbs that led to `leaf_ref`.
    ///
    /// Returns `true` once the replacement structure is installed; `false`
    /// means the region was superseded by a competitor and the caller should
    /// re-traverse.
    fn split_and_install(
        &self,
        leaf_ref: NodeRef,
        key: &[u8],
        stack: &mut Stack,
        guard: &Guard,
    ) -> bool {
        debug_assert!(leaf_ref.base().status_word(guard).is_frozen());

        // Nodes we built: freed immediately if never installed.
        let mut fresh: Vec<NodeRef> = Vec::with_capacity(4);
        // Nodes we unlink: retired through the epoch once installed.
        let mut replaced: Vec<NodeRef> = vec![leaf_ref];

        let (mut separator, mut left_ref, mut right_ref) =
            match leaf_ref.leaf().prepare_split(self.params.split_threshold, guard) {
                SplitPlan::Compact(dense) => {
                    debug_log!("leaf overflow resolved by compaction");
                    let dense_ref = self.publish_leaf_node(dense);
                    fresh.push(dense_ref);
                    return self
                        .install_replacement(leaf_ref, dense_ref, key, stack, guard, fresh, replaced);
                }
                SplitPlan::Split {
                    left,
                    right,
                    separator,
                } => {
                    let left_ref = self.publish_leaf_node(left);
                    let right_ref = self.publish_leaf_node(right);
                    fresh.push(left_ref);
                    fresh.push(right_ref);
                    (separator, left_ref, right_ref)
                }
            };

        // `split_node` is the frozen node whose parent must absorb
        // (separator, left, right).
        let mut split_node = leaf_ref;
        let mut freeze_retry = 0u32;

        loop {
            let Some(&top) = stack.last() else {
                // `split_node` was the root: grow the tree by one level.
                let new_root = self.publish_internal_node(crate::internal::InternalNode::new_root(
                    &separator,
                    self.alloc.to_offset(left_ref.raw()),
                    self.alloc.to_offset(right_ref.raw()),
                ));
                fresh.push(new_root);
                return self
                    .install_replacement(split_node, new_root, key, stack, guard, fresh, replaced);
            };

            let parent_ref = top.node;
            if !parent_ref.base().freeze(guard) && freeze_retry <= self.params.max_freeze_retry {
                // The parent moved (a competing split or consolidation
                // replaced it); find the current parent and try again.
                freeze_retry += 1;
                if !self.traverse_to_node(key, split_node, stack, guard) {
                    debug_log!("split target superseded during freeze retry");
                    Self::drop_all(fresh);
                    return false;
                }
                continue;
            }
            // Parent frozen: by us, or by a competitor that has had ample
            // time; either way the install CAS arbitrates the outcome.
            replaced.push(parent_ref);

            match parent_ref.internal().prepare_split(
                &separator,
                self.alloc.to_offset(left_ref.raw()),
                self.alloc.to_offset(right_ref.raw()),
                self.params.split_threshold,
                guard,
            ) {
                InternalSplit::Extended(new_parent) => {
                    let new_ref = self.publish_internal_node(new_parent);
                    fresh.push(new_ref);
                    stack.pop(); // the parent's own breadcrumb
                    return self
                        .install_replacement(parent_ref, new_ref, key, stack, guard, fresh, replaced);
                }
                InternalSplit::Split {
                    left,
                    right,
                    separator: evicted,
                } => {
                    let l = self.publish_internal_node(left);
                    let r = self.publish_internal_node(right);
                    fresh.push(l);
                    fresh.push(r);
                    stack.pop();
                    split_node = parent_ref;
                    separator = evicted;
                    left_ref = l;
                    right_ref = r;
                }
            }
        }
    }

    /// Swing `old` out of the tree in favour of `new`. The stack must hold
    /// the frame of `old`'s parent on top (empty when `old` is the root).
    ///
    /// On success all `replaced` nodes are retired and `fresh` becomes live.
    /// On defeat (the region was superseded) `fresh` is freed and `false`
    /// returned; the caller restarts from the root.
    fn install_replacement(
        &self,
        mut old: NodeRef,
        mut new: NodeRef,
        key: &[u8],
        stack: &mut Stack,
        guard: &Guard,
        mut fresh: Vec<NodeRef>,
        mut replaced: Vec<NodeRef>,
    ) -> bool {
        let mut frozen_parent_hits = 0u32;
        loop {
            match stack.pop() {
                None => {
                    let mut mwcas = MwCas::new();
                    mwcas.compare_exchange_u64(
                        &self.root,
                        self.alloc.to_offset(old.raw()),
                        self.alloc.to_offset(new.raw()),
                    );
                    if mwcas.exec(guard) {
                        self.retire_all(&replaced, guard);
                        return true;
                    }
                    warn_log!("root swing lost; restarting operation");
                    Self::drop_all(fresh);
                    return false;
                }
                Some(frame) => {
                    let parent = frame.node;
                    match parent.internal().swap_child(
                        frame.slot,
                        frame.meta,
                        self.alloc.to_offset(old.raw()),
                        self.alloc.to_offset(new.raw()),
                        guard,
                    ) {
                        NodeStatus::Ok => {
                            self.retire_all(&replaced, guard);
                            return true;
                        }
                        NodeStatus::NodeFrozen
                            if frozen_parent_hits >= self.params.max_freeze_retry =>
                        {
                            // The parent froze and its freezer has not
                            // replaced it (possibly never will, if its own
                            // install was defeated). A frozen node's links
                            // are immutable, so supersede it: a copy with
                            // our swing applied, installed one level up.
                            if parent.internal().child_link(frame.slot, guard)
                                != self.alloc.to_offset(old.raw())
                            {
                                // The slot moved before the freeze: the
                                // region was superseded after all.
                                Self::drop_all(fresh);
                                return false;
                            }
                            debug_log!("superseding stranded frozen parent");
                            let rebuilt =
                                self.publish_internal_node(crate::internal::InternalNode::with_child_replaced(
                                    parent.internal(),
                                    frame.slot,
                                    self.alloc.to_offset(new.raw()),
                                    guard,
                                ));
                            fresh.push(rebuilt);
                            replaced.push(parent);
                            old = parent;
                            new = rebuilt;
                            frozen_parent_hits = 0;
                            // The next frame on the stack is the parent's
                            // parent; continue the loop one level up.
                        }
                        status => {
                            if status == NodeStatus::NodeFrozen {
                                frozen_parent_hits += 1;
                            } else {
                                frozen_parent_hits = 0;
                            }
                            // Contended or frozen: re-walk to the node's
                            // current parent and swing there.
                            if !self.traverse_to_node(key, old, stack, guard) {
                                debug_log!("install target superseded; abandoning");
                                Self::drop_all(fresh);
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Freeze-and-rewrite a leaf whose reclaimable bytes crossed the
    /// consolidation threshold. Losing the freeze means another thread owns
    /// the rewrite; losing the install leaves the frozen leaf to the next
    /// writer, which supersedes it through the split path.
    fn try_consolidate(&self, leaf_ref: NodeRef, key: &[u8], stack: &mut Stack, guard: &Guard) {
        let Some(dense) = leaf_ref.leaf().consolidate(guard) else {
            return;
        };
        debug_log!("consolidating leaf after delete pressure");
        let dense_ref = self.publish_leaf_node(dense);
        let fresh = vec![dense_ref];
        let replaced = vec![leaf_ref];
        let _ = self.install_replacement(leaf_ref, dense_ref, key, stack, guard, fresh, replaced);
    }

    fn retire_all(&self, replaced: &[NodeRef], guard: &Guard) {
        for &node in replaced {
            // SAFETY: `node` was just unlinked by a successful install; no
            // new traversal can reach it.
            unsafe { retire_node(guard, node) };
        }
    }

    fn drop_all(fresh: Vec<NodeRef>) {
        for node in fresh {
            // SAFETY: never-installed build products are unreachable.
            unsafe { drop_node(node) };
        }
    }

    fn check_key(&self, key: &[u8]) {
        assert!(!key.is_empty(), "keys must be non-empty");
        assert!(
            key.len() <= self.params.max_key_len(),
            "key length {} exceeds maximum {}",
            key.len(),
            self.params.max_key_len()
        );
    }
}

impl Drop for BzTree {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no concurrent operation is in flight,
        // and drop order guarantees no guard still references the nodes.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let root = self.root_node(guard);
            reclaim_subtree(root);
        }
    }
}

impl std::fmt::Display for BzTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = crossbeam_epoch::pin();
        let mut pending = vec![(self.root_node(&guard), 0usize)];
        while let Some((node, depth)) = pending.pop() {
            writeln!(f, "{:indent$}[depth {depth}]", "", indent = depth * 2)?;
            if node.is_leaf() {
                write!(f, "{}", node.leaf())?;
            } else {
                let internal = node.internal();
                write!(f, "{internal}")?;
                for i in (0..internal.child_count()).rev() {
                    pending.push((self.resolve(internal.child_link(i, &guard)), depth + 1));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tree_reads_nothing() {
        let tree = BzTree::new();
        assert_eq!(tree.read(b"anything"), None);
        assert!(!tree.update(b"anything", 1));
        assert!(!tree.delete(b"anything"));
        tree.assert_invariants();
    }

    #[test]
    fn test_point_operations_round_trip() {
        let tree = BzTree::new();
        assert!(tree.insert(b"bdef", 100));
        assert!(tree.insert(b"def", 200));
        assert!(tree.insert(b"abc", 300));

        assert_eq!(tree.read(b"abc"), Some(300));
        assert_eq!(tree.read(b"bdef"), Some(100));
        assert_eq!(tree.read(b"zzz"), None);
    }

    #[test]
    fn test_single_leaf_split_grows_root() {
        let tree = BzTree::new();
        // 4-byte keys, 24 bytes of footprint each: overflows one leaf.
        for i in 0..200u32 {
            assert!(tree.insert(format!("{i:04}").as_bytes(), u64::from(i)));
        }
        let guard = crossbeam_epoch::pin();
        let root = tree.root_node(&guard);
        assert!(!root.is_leaf(), "split must have grown the tree");
        assert!(root.internal().child_count() >= 2);
        drop(guard);

        for i in 0..200u32 {
            assert_eq!(tree.read(format!("{i:04}").as_bytes()), Some(u64::from(i)));
        }
        tree.assert_invariants();
    }

    #[test]
    fn test_multi_level_split() {
        let tree = BzTree::new();
        for i in 0..12000u32 {
            assert!(tree.insert(format!("key-{i:06}").as_bytes(), u64::from(i)));
        }
        for i in 0..12000u32 {
            assert_eq!(
                tree.read(format!("key-{i:06}").as_bytes()),
                Some(u64::from(i)),
                "key {i} lost after splits"
            );
        }
        let guard = crossbeam_epoch::pin();
        let root = tree.root_node(&guard);
        assert!(!root.is_leaf());
        // Two levels of internal nodes somewhere in the tree.
        let first_child = tree.resolve(root.internal().child_link(0, &guard));
        assert!(!first_child.is_leaf(), "expected height >= 3");
        drop(guard);
        tree.assert_invariants();
    }

    #[test]
    fn test_descending_inserts() {
        let tree = BzTree::new();
        for i in (0..2000u32).rev() {
            assert!(tree.insert(format!("{i:08}").as_bytes(), u64::from(i)));
        }
        for i in 0..2000u32 {
            assert_eq!(tree.read(format!("{i:08}").as_bytes()), Some(u64::from(i)));
        }
        tree.assert_invariants();
    }

    #[test]
    fn test_delete_pressure_consolidates() {
        let tree = BzTree::new();
        for i in 0..100u32 {
            tree.insert(format!("{i:04}").as_bytes(), u64::from(i));
        }
        for i in 0..100u32 {
            assert!(tree.delete(format!("{i:04}").as_bytes()));
        }
        for i in 0..100u32 {
            assert_eq!(tree.read(format!("{i:04}").as_bytes()), None);
        }
        // Everything is reinsertable after consolidation.
        for i in 0..100u32 {
            assert!(tree.insert(format!("{i:04}").as_bytes(), 1000 + u64::from(i)));
        }
        for i in 0..100u32 {
            assert_eq!(
                tree.read(format!("{i:04}").as_bytes()),
                Some(1000 + u64::from(i))
            );
        }
        tree.assert_invariants();
    }

    #[test]
    fn test_display_renders() {
        let tree = BzTree::new();
        tree.insert(b"a", 1);
        let out = format!("{tree}");
        assert!(out.contains("leaf"));
    }

    #[test]
    #[should_panic(expected = "keys must be non-empty")]
    fn test_empty_key_rejected() {
        let tree = BzTree::new();
        tree.insert(b"", 1);
    }

    #[test]
    #[should_panic(expected = "exceeds maximum")]
    fn test_oversized_key_rejected() {
        let tree = BzTree::new();
        let key = vec![7u8; tree.params().max_key_len() + 1];
        tree.insert(&key, 1);
    }
}
