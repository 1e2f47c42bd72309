//! Leaf node protocol.
//!
//! Leaves hold the user records. Point mutations are latch-free:
//!
//! - **Insert** runs in two MWCAS phases. Phase 1 bumps the record count and
//!   block size in the status word while flipping one metadata slot from
//!   vacant to reserved; the reservation carries the global insert epoch.
//!   The key bytes are then copied into the reserved heap range. Phase 2
//!   re-installs the (unchanged) status word as a freeze fence and swaps the
//!   reservation for visible metadata together with the payload word.
//! - **Update** swaps the payload word while fencing on both the record
//!   metadata (tombstone detection) and the status word (freeze detection).
//! - **Delete** clears visibility and offset in the metadata and adds the
//!   record's bytes to the status word's delete size.
//!
//! A frozen leaf refuses all mutation; the thread that froze it replaces it
//! with a consolidated rewrite or a split pair.

use std::sync::atomic::Ordering as AtomicOrdering;

use crossbeam_epoch::Guard;
use mwcas::MwCas;

use crate::node::{BaseNode, BuildRecord, NodeStatus, RECORD_META_SIZE};
use crate::record_meta::{pad_key_length, RecordMeta};
use crate::tracing_helpers::trace_log;
use crate::GLOBAL_EPOCH;

/// Outcome of a uniqueness probe during insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Uniqueness {
    /// No record with this key, and nothing ambiguous in flight.
    Unique,
    /// A visible record with this key exists.
    Duplicate,
    /// An unresolved reservation was seen; phase 2 must re-examine the tail.
    ReCheck,
    /// The node froze while probing.
    NodeFrozen,
}

/// An owning snapshot of one record, taken under an epoch guard so the
/// source buffer outlives the copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    key: Box<[u8]>,
    payload: u64,
}

impl Record {
    pub(crate) fn new(key: &[u8], payload: u64) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// The record's key bytes.
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The record's 64-bit payload.
    #[inline]
    pub fn payload(&self) -> u64 {
        self.payload
    }
}

/// What a frozen, overflowing leaf turns into.
pub(crate) enum SplitPlan {
    /// Two byte-balanced halves; `separator` is the largest key of `left`.
    Split {
        left: Box<LeafNode>,
        right: Box<LeafNode>,
        separator: Box<[u8]>,
    },
    /// The overflow was tombstone pressure: a dense rewrite fits comfortably,
    /// so no split is needed.
    Compact(Box<LeafNode>),
}

/// Terminal node holding user `(key, payload)` records.
#[repr(transparent)]
pub(crate) struct LeafNode {
    base: BaseNode,
}

impl std::ops::Deref for LeafNode {
    type Target = BaseNode;

    #[inline]
    fn deref(&self) -> &BaseNode {
        &self.base
    }
}

impl LeafNode {
    /// A fresh, empty leaf with a `size`-byte budget.
    pub(crate) fn empty(size: u32) -> Box<Self> {
        Self::from_sorted(size, &[])
    }

    /// Build a leaf from key-ordered records, densely packed, fully sorted.
    pub(crate) fn from_sorted(size: u32, records: &[BuildRecord<'_>]) -> Box<Self> {
        debug_assert!(records.windows(2).all(|w| w[0].key < w[1].key));
        Box::new(Self {
            base: BaseNode::build(true, size, BaseNode::leaf_slot_capacity(size), records),
        })
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Two-phase latch-free insert.
    ///
    /// Returns `NotEnoughSpace` when the projected footprint reaches
    /// `split_threshold` (the caller splits), `NodeFrozen` when the leaf is
    /// read-only (the caller re-traverses), `KeyExists` on duplicates.
    pub(crate) fn insert(
        &self,
        key: &[u8],
        payload: u64,
        split_threshold: u32,
        guard: &Guard,
    ) -> NodeStatus {
        let key_len = key.len() as u32;
        let total_len = pad_key_length(key_len) + 8;

        // Phase 1: reserve one metadata slot and `total_len` heap bytes.
        let (slot, mut uniqueness, reserved_meta, block_after) = loop {
            let status = self.status_word(guard);
            if status.is_frozen() {
                return NodeStatus::NodeFrozen;
            }

            let uniqueness = self.check_unique(key, guard);
            if uniqueness == Uniqueness::Duplicate {
                return NodeStatus::KeyExists;
            }

            let slot = status.record_count() as usize;
            if BaseNode::used_space(status) + RECORD_META_SIZE + total_len >= split_threshold
                || slot >= self.slot_capacity()
            {
                return NodeStatus::NotEnoughSpace;
            }

            let expected_meta = self.meta(slot, guard);
            if !expected_meta.is_vacant() {
                // Raced with another reservation; the status word moved too.
                continue;
            }

            let desired_status = status.reserve_record(total_len);
            let reserved = RecordMeta::reserved(GLOBAL_EPOCH.load(AtomicOrdering::Relaxed));
            let mut mwcas = MwCas::new();
            mwcas.compare_exchange_u64(self.status_cell(), status.raw(), desired_status.raw());
            mwcas.compare_exchange_u64(self.meta_cell(slot), expected_meta.raw(), reserved.raw());
            if mwcas.exec(guard) {
                break (slot, uniqueness, reserved, desired_status.block_size());
            }
        };

        // Phase 1.5: copy the key into the reserved heap range.
        let offset = self.size() - block_after;
        // SAFETY: the reservation gives this thread exclusive ownership of
        // [offset, offset + total_len) until publication.
        unsafe { self.write_key(offset, key) };

        // Phase 2: publish, or abandon on a concurrent duplicate.
        loop {
            if uniqueness == Uniqueness::ReCheck {
                match self.recheck_unique(key, slot as u32, guard) {
                    Uniqueness::Duplicate => {
                        // Lost the duplicate race. Zero the bytes and retire
                        // the slot as abandoned: not visible, offset zero,
                        // compacted away by the next consolidation.
                        // SAFETY: still the exclusive owner of the range.
                        unsafe { self.zero_key(offset, key.len()) };
                        let status = self.status_word(guard);
                        if status.is_frozen() {
                            return NodeStatus::NodeFrozen;
                        }
                        let abandoned = RecordMeta::abandoned(key_len, total_len);
                        let mut mwcas = MwCas::new();
                        mwcas.compare_exchange_u64(self.status_cell(), status.raw(), status.raw());
                        mwcas.compare_exchange_u64(
                            self.meta_cell(slot),
                            reserved_meta.raw(),
                            abandoned.raw(),
                        );
                        if mwcas.exec(guard) {
                            return NodeStatus::KeyExists;
                        }
                        continue;
                    }
                    Uniqueness::NodeFrozen => return NodeStatus::NodeFrozen,
                    _ => uniqueness = Uniqueness::Unique,
                }
            }

            let status = self.status_word(guard);
            if status.is_frozen() {
                return NodeStatus::NodeFrozen;
            }

            // Re-installing the same status word fences against racing
            // freezers: a freeze that lands first fails this MWCAS, so a
            // visible record can never appear in a frozen node.
            let final_meta = RecordMeta::visible(offset, key_len, total_len);
            let payload_before = self.payload(slot, guard);
            let mut mwcas = MwCas::new();
            mwcas.compare_exchange_u64(self.status_cell(), status.raw(), status.raw());
            mwcas.compare_exchange_u64(self.meta_cell(slot), reserved_meta.raw(), final_meta.raw());
            mwcas.compare_exchange_u64(self.payload_cell(slot), payload_before, payload);
            if mwcas.exec(guard) {
                return NodeStatus::Ok;
            }
            trace_log!("leaf insert: phase 2 MWCAS retry");
        }
    }

    /// Probe for `key` before reserving. `ReCheck` is returned whenever the
    /// probe cannot prove uniqueness: an unresolved reservation was seen, or
    /// one resolved to something else after the search copied it (a same-key
    /// publish may still be landing elsewhere in the tail).
    fn check_unique(&self, key: &[u8], guard: &Guard) -> Uniqueness {
        let Some((slot, _)) = self.search_record(key, 0, u32::MAX, true, guard) else {
            return Uniqueness::Unique;
        };
        let meta = self.meta(slot, guard);
        if meta.is_inserting() {
            return Uniqueness::ReCheck;
        }
        // SAFETY: meta is visible.
        if meta.is_visible() && key == unsafe { self.key_unchecked(meta) } {
            Uniqueness::Duplicate
        } else {
            Uniqueness::ReCheck
        }
    }

    /// Phase-2 re-probe over the unsorted tail below our own slot, waiting
    /// out any reservation still in flight.
    fn recheck_unique(&self, key: &[u8], end_pos: u32, guard: &Guard) -> Uniqueness {
        loop {
            if self.status_word(guard).is_frozen() {
                return Uniqueness::NodeFrozen;
            }
            let Some((slot, _)) =
                self.search_record(key, self.sorted_count(), end_pos, true, guard)
            else {
                return Uniqueness::Unique;
            };
            let meta = self.meta(slot, guard);
            if meta.is_inserting() {
                // Every reserving writer publishes or abandons in bounded
                // time; wait for this one to resolve.
                std::hint::spin_loop();
                continue;
            }
            if !meta.is_visible() {
                // Abandoned since the search saw it; rescan past it.
                continue;
            }
            // SAFETY: meta is visible.
            if key == unsafe { self.key_unchecked(meta) } {
                return Uniqueness::Duplicate;
            }
            // Resolved to a different key; rescan the remainder of the tail.
        }
    }

    // ========================================================================
    //  Update / Delete / Read
    // ========================================================================

    /// Replace the payload of a visible record in place.
    ///
    /// The three-word MWCAS swaps the payload while asserting that neither
    /// the record metadata (tombstoning) nor the status word (freezing)
    /// changed underneath.
    pub(crate) fn update(&self, key: &[u8], payload: u64, guard: &Guard) -> NodeStatus {
        loop {
            let status = self.status_word(guard);
            if status.is_frozen() {
                return NodeStatus::NodeFrozen;
            }
            let Some((slot, meta)) = self.search_record(key, 0, u32::MAX, false, guard) else {
                return NodeStatus::NotFound;
            };
            debug_assert!(meta.is_visible());

            let current = self.payload(slot, guard);
            if current == payload {
                return NodeStatus::Ok;
            }

            let mut mwcas = MwCas::new();
            mwcas.compare_exchange_u64(self.payload_cell(slot), current, payload);
            mwcas.compare_exchange_u64(self.meta_cell(slot), meta.raw(), meta.raw());
            mwcas.compare_exchange_u64(self.status_cell(), status.raw(), status.raw());
            if mwcas.exec(guard) {
                return NodeStatus::Ok;
            }
        }
    }

    /// Logically delete a visible record: visibility and offset cleared,
    /// `delete_size` grown by the record's footprint. The slot is never
    /// reused; consolidation reclaims it.
    pub(crate) fn delete(&self, key: &[u8], guard: &Guard) -> NodeStatus {
        loop {
            let status = self.status_word(guard);
            if status.is_frozen() {
                return NodeStatus::NodeFrozen;
            }
            let Some((slot, meta)) = self.search_record(key, 0, u32::MAX, false, guard) else {
                return NodeStatus::NotFound;
            };

            let new_status = status.mark_deleted(meta.total_length());
            let mut mwcas = MwCas::new();
            mwcas.compare_exchange_u64(self.status_cell(), status.raw(), new_status.raw());
            mwcas.compare_exchange_u64(self.meta_cell(slot), meta.raw(), meta.deleted().raw());
            if mwcas.exec(guard) {
                return NodeStatus::Ok;
            }
        }
    }

    /// Read the payload of a visible record. In-flight reservations are
    /// skipped: the read linearizes before any concurrent publish.
    pub(crate) fn read(&self, key: &[u8], guard: &Guard) -> Option<u64> {
        let (slot, meta) = self.search_record(key, 0, u32::MAX, false, guard)?;
        debug_assert!(meta.is_visible());
        Some(self.payload(slot, guard))
    }

    // ========================================================================
    //  Range scan
    // ========================================================================

    /// Snapshot every visible record with key in `[lo, hi]` into `out`,
    /// ascending. Once the sorted region passes `hi` the scan skips straight
    /// to the unsorted tail.
    pub(crate) fn range_scan(&self, lo: &[u8], hi: &[u8], out: &mut Vec<Record>, guard: &Guard) {
        let start = out.len();
        let record_count = self.status_word(guard).record_count();
        let mut i = 0u32;
        while i < record_count {
            let meta = self.meta(i as usize, guard);
            if !meta.is_visible() {
                i += 1;
                continue;
            }
            // SAFETY: meta is visible.
            let key = unsafe { self.key_unchecked(meta) };
            if key > hi {
                if i < self.sorted_count() {
                    i = self.sorted_count();
                    continue;
                }
            } else if key >= lo {
                out.push(Record::new(key, self.payload(i as usize, guard)));
            }
            i += 1;
        }
        out[start..].sort_unstable_by(|a, b| a.key.cmp(&b.key));
    }

    // ========================================================================
    //  Consolidation and split preparation
    // ========================================================================

    /// Freeze this leaf and build its dense, fully sorted replacement.
    /// Returns `None` when another thread won the freeze (it owns the
    /// rewrite).
    pub(crate) fn consolidate(&self, guard: &Guard) -> Option<Box<LeafNode>> {
        if !self.freeze(guard) {
            return None;
        }
        Some(self.rebuild_dense(guard))
    }

    /// Dense rewrite of an already-frozen leaf, same capacity.
    pub(crate) fn rebuild_dense(&self, guard: &Guard) -> Box<LeafNode> {
        let (metas, _) = self.sorted_visible(guard);
        let records: Vec<BuildRecord<'_>> = metas
            .iter()
            .map(|&(slot, meta)| BuildRecord {
                // SAFETY: meta is visible and the node is frozen.
                key: unsafe { self.key_unchecked(meta) },
                payload: self.payload(slot, guard),
            })
            .collect();
        Self::from_sorted(self.size(), &records)
    }

    /// Plan the replacement of an already-frozen, overflowing leaf.
    ///
    /// The split point is the smallest prefix of the sorted visible records
    /// whose cumulative footprint reaches half of the total (byte-balanced);
    /// the separator key is the last key of the left half, with the
    /// traversal rule "go left if `<=` separator". When the overflow was
    /// tombstone pressure and a dense rewrite would fit in half the
    /// threshold, a compaction replaces the split.
    pub(crate) fn prepare_split(&self, split_threshold: u32, guard: &Guard) -> SplitPlan {
        debug_assert!(self.status_word(guard).is_frozen());

        let (metas, total_bytes) = self.sorted_visible(guard);
        let n = metas.len();

        let compact_used =
            crate::node::NODE_HEADER_SIZE + (n as u32 + 1) * RECORD_META_SIZE + total_bytes;
        if n < 2 || compact_used * 2 <= split_threshold {
            return SplitPlan::Compact(self.rebuild_dense(guard));
        }

        let mut remaining = (total_bytes / 2) as i64;
        let mut n_left = 0usize;
        for &(_, meta) in &metas {
            n_left += 1;
            remaining -= i64::from(meta.total_length());
            if remaining <= 0 {
                break;
            }
        }
        let n_left = n_left.clamp(1, n - 1);

        let records: Vec<BuildRecord<'_>> = metas
            .iter()
            .map(|&(slot, meta)| BuildRecord {
                // SAFETY: meta is visible and the node is frozen.
                key: unsafe { self.key_unchecked(meta) },
                payload: self.payload(slot, guard),
            })
            .collect();

        let left = Self::from_sorted(self.size(), &records[..n_left]);
        let right = Self::from_sorted(self.size(), &records[n_left..]);
        let separator = records[n_left - 1].key.into();
        SplitPlan::Split {
            left,
            right,
            separator,
        }
    }

    /// Visible records in key order, with their cumulative byte footprint.
    /// The node must be frozen: no reservation can still be in flight past
    /// the freeze, so the visible set is final.
    fn sorted_visible(&self, guard: &Guard) -> (Vec<(usize, RecordMeta)>, u32) {
        debug_assert!(self.status_word(guard).is_frozen());
        let record_count = self.status_word(guard).record_count();
        let mut metas: Vec<(usize, RecordMeta)> = Vec::with_capacity(record_count as usize);
        let mut total = 0u32;
        for i in 0..record_count as usize {
            let meta = self.meta(i, guard);
            if meta.is_visible() {
                metas.push((i, meta));
                total += meta.total_length();
            }
        }
        // SAFETY: both metas are visible.
        metas.sort_unstable_by(|&(_, a), &(_, b)| unsafe {
            self.key_unchecked(a).cmp(self.key_unchecked(b))
        });
        (metas, total)
    }
}

impl std::fmt::Display for LeafNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.base.fmt(f)?;
        let guard = crossbeam_epoch::pin();
        let record_count = self.status_word(&guard).record_count();
        for i in 0..record_count as usize {
            let meta = self.meta(i, &guard);
            if meta.is_visible() {
                // SAFETY: meta is visible.
                let key = unsafe { self.key_unchecked(meta) };
                writeln!(
                    f,
                    "  record {i}: key={:?} payload={}",
                    String::from_utf8_lossy(key),
                    self.payload(i, &guard)
                )?;
            }
        }
        Ok(())
    }
}
