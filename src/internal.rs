//! Internal node protocol.
//!
//! Internal nodes route traversals. They are immutable after construction
//! except for two transitions: the freeze bit, and child-pointer swings that
//! replace a frozen subtree with its successor. Every separator change is
//! expressed by building a whole replacement node and swinging the parent's
//! pointer to it.
//!
//! Slot 0 is the dummy: an empty key whose payload is the leftmost child.
//! Slot `i > 0` holds separator `K_i`; its child covers keys in
//! `(K_i, K_{i+1}]` under the tree's go-left-if-`<=` traversal rule. An
//! internal node with `sorted_count == n` therefore has exactly `n`
//! children.

use std::cmp::Ordering;

use crossbeam_epoch::Guard;
use mwcas::MwCas;

use crate::node::{BaseNode, BuildRecord, NodeStatus, NODE_HEADER_SIZE, RECORD_META_SIZE};
use crate::record_meta::{pad_key_length, RecordMeta};

/// What an internal node turns into when a child separator is pushed up.
pub(crate) enum InternalSplit {
    /// The separator fit: a copy of the node with one more child.
    Extended(Box<InternalNode>),
    /// The node was full: two halves, with the middle separator evicted for
    /// the next level up.
    Split {
        left: Box<InternalNode>,
        right: Box<InternalNode>,
        separator: Box<[u8]>,
    },
}

/// Non-terminal node holding separator keys and child links.
#[repr(transparent)]
pub(crate) struct InternalNode {
    base: BaseNode,
}

impl std::ops::Deref for InternalNode {
    type Target = BaseNode;

    #[inline]
    fn deref(&self) -> &BaseNode {
        &self.base
    }
}

impl InternalNode {
    /// Number of children; equals `sorted_count`.
    #[inline]
    pub(crate) fn child_count(&self) -> usize {
        self.sorted_count() as usize
    }

    /// Stored link of child `i` (in the allocator's offset representation).
    #[inline]
    pub(crate) fn child_link(&self, i: usize, guard: &Guard) -> u64 {
        debug_assert!(i < self.child_count());
        self.payload(i, guard)
    }

    /// Fresh root above a newly split pair: keys `<= separator` go left.
    pub(crate) fn new_root(separator: &[u8], left_link: u64, right_link: u64) -> Box<Self> {
        Self::build(vec![
            BuildRecord {
                key: &[],
                payload: left_link,
            },
            BuildRecord {
                key: separator,
                payload: right_link,
            },
        ])
    }

    /// Copy of `src` with `(key, left_link, right_link)` inserted: the slot
    /// previously covering `key` is re-pointed at `left_link` and a new slot
    /// `key -> right_link` is placed after it.
    pub(crate) fn with_inserted(
        src: &Self,
        key: &[u8],
        left_link: u64,
        right_link: u64,
        guard: &Guard,
    ) -> Box<Self> {
        Self::from_range(
            src,
            0,
            src.child_count(),
            Some((key, left_link, right_link)),
            0,
            guard,
        )
    }

    /// General builder: copy slots `[begin, begin + count)` of `src`,
    /// optionally inserting a separator/child pair, optionally prepending a
    /// new dummy pointing at `leftmost_link` (non-zero when building the
    /// right half of a split, whose leftmost child is the evicted middle
    /// separator's child).
    fn from_range(
        src: &Self,
        begin: usize,
        count: usize,
        insert: Option<(&[u8], u64, u64)>,
        leftmost_link: u64,
        guard: &Guard,
    ) -> Box<Self> {
        let mut records: Vec<BuildRecord<'_>> = Vec::with_capacity(count + 2);
        if leftmost_link != 0 {
            records.push(BuildRecord {
                key: &[],
                payload: leftmost_link,
            });
        }
        for i in begin..begin + count {
            let meta = src.meta(i, guard);
            debug_assert!(meta.is_visible());
            records.push(BuildRecord {
                // SAFETY: internal slots are visible and immutable.
                key: unsafe { src.key_unchecked(meta) },
                payload: src.payload(i, guard),
            });
        }

        if let Some((key, left_link, right_link)) = insert {
            let pos = records.partition_point(|r| r.key < key);
            debug_assert!(pos > 0, "a separator sorts after the dummy slot");
            debug_assert!(
                records.get(pos).map_or(true, |r| r.key != key),
                "separator already present"
            );
            records[pos - 1].payload = left_link;
            records.insert(
                pos,
                BuildRecord {
                    key,
                    payload: right_link,
                },
            );
        }

        Self::build(records)
    }

    /// Copy of `src` with the child link in `slot` replaced.
    ///
    /// Valid only on a frozen source: the freeze pins every link, so the
    /// copy is consistent. Used to supersede a frozen node whose freezer
    /// abandoned it without installing a replacement.
    pub(crate) fn with_child_replaced(
        src: &Self,
        slot: usize,
        new_link: u64,
        guard: &Guard,
    ) -> Box<Self> {
        debug_assert!(src.status_word(guard).is_frozen());
        let mut records: Vec<BuildRecord<'_>> = (0..src.child_count())
            .map(|i| {
                let meta = src.meta(i, guard);
                BuildRecord {
                    // SAFETY: internal slots are visible and immutable.
                    key: unsafe { src.key_unchecked(meta) },
                    payload: src.payload(i, guard),
                }
            })
            .collect();
        records[slot].payload = new_link;
        Self::build(records)
    }

    /// Materialize an exactly-sized internal node from its record list.
    fn build(records: Vec<BuildRecord<'_>>) -> Box<Self> {
        let size = NODE_HEADER_SIZE
            + records
                .iter()
                .map(|r| RECORD_META_SIZE + pad_key_length(r.key.len() as u32) + 8)
                .sum::<u32>();
        Box::new(Self {
            base: BaseNode::build(false, size, records.len(), &records),
        })
    }

    // ========================================================================
    //  Routing
    // ========================================================================

    /// Slot index of the child to follow for `key`.
    ///
    /// Pure binary search; every slot is visible. When `key` equals a
    /// separator, `le_child` steers to the left child (point operations,
    /// which must land in the leaf that can contain an exact match) or the
    /// right one.
    pub(crate) fn get_child_index(&self, key: &[u8], le_child: bool, guard: &Guard) -> usize {
        debug_assert!(!key.is_empty(), "the dummy slot would alias an empty key");
        let mut left = 0i64;
        let mut right = self.sorted_count() as i64 - 1;
        loop {
            let mid = (left + right) / 2;
            let meta = self.meta(mid as usize, guard);
            // SAFETY: internal slots are visible and immutable.
            let mid_key = unsafe { self.key_unchecked(meta) };
            let cmp = key.cmp(mid_key);
            if cmp == Ordering::Equal {
                return if le_child { mid as usize - 1 } else { mid as usize };
            }
            if left > right {
                return if cmp == Ordering::Less && le_child {
                    mid as usize - 1
                } else {
                    mid as usize
                };
            }
            if cmp == Ordering::Greater {
                left = mid + 1;
            } else {
                right = mid - 1;
            }
        }
    }

    // ========================================================================
    //  Child swing
    // ========================================================================

    /// Swing the child link in `slot` from `old_link` to `new_link`.
    ///
    /// The MWCAS re-installs the status word (a concurrent freeze fails the
    /// swap) and the captured slot metadata (the slot observed at traversal
    /// time must still be intact) alongside the pointer exchange.
    pub(crate) fn swap_child(
        &self,
        slot: usize,
        meta: RecordMeta,
        old_link: u64,
        new_link: u64,
        guard: &Guard,
    ) -> NodeStatus {
        let status = self.status_word(guard);
        if status.is_frozen() {
            return NodeStatus::NodeFrozen;
        }
        let mut mwcas = MwCas::new();
        mwcas.compare_exchange_u64(self.status_cell(), status.raw(), status.raw());
        mwcas.compare_exchange_u64(self.meta_cell(slot), meta.raw(), meta.raw());
        mwcas.compare_exchange_u64(self.payload_cell(slot), old_link, new_link);
        if mwcas.exec(guard) {
            NodeStatus::Ok
        } else {
            NodeStatus::MwcasFailure
        }
    }

    // ========================================================================
    //  Upward split propagation
    // ========================================================================

    /// Absorb a separator pushed up by a child split, or split in half when
    /// it does not fit.
    ///
    /// The node must already be frozen (or abandoned to the freezer that got
    /// there first). In the split case the middle separator is evicted: the
    /// left half keeps slots before it, the right half starts with a dummy
    /// pointing at the evicted separator's child, and the new pair lands in
    /// whichever half its key range dictates.
    pub(crate) fn prepare_split(
        &self,
        key: &[u8],
        left_link: u64,
        right_link: u64,
        split_threshold: u32,
        guard: &Guard,
    ) -> InternalSplit {
        let grown = self.size() + RECORD_META_SIZE + pad_key_length(key.len() as u32) + 8;
        if grown < split_threshold {
            return InternalSplit::Extended(Self::with_inserted(
                self, key, left_link, right_link, guard,
            ));
        }

        let n = self.child_count();
        debug_assert!(n >= 2, "cannot halve an internal node with one child");
        let n_left = n / 2;

        let sep_meta = self.meta(n_left, guard);
        // SAFETY: internal slots are visible and immutable.
        let separator: Box<[u8]> = unsafe { self.key_unchecked(sep_meta) }.into();
        let sep_link = self.payload(n_left, guard);

        let insert = Some((key, left_link, right_link));
        let (left, right) = if key < &*separator {
            (
                Self::from_range(self, 0, n_left, insert, 0, guard),
                Self::from_range(self, n_left + 1, n - n_left - 1, None, sep_link, guard),
            )
        } else {
            (
                Self::from_range(self, 0, n_left, None, 0, guard),
                Self::from_range(self, n_left + 1, n - n_left - 1, insert, sep_link, guard),
            )
        };
        InternalSplit::Split {
            left,
            right,
            separator,
        }
    }
}

impl std::fmt::Display for InternalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.base.fmt(f)?;
        let guard = crossbeam_epoch::pin();
        for i in 0..self.child_count() {
            let meta = self.meta(i, &guard);
            // SAFETY: internal slots are visible and immutable.
            let key = unsafe { self.key_unchecked(meta) };
            writeln!(
                f,
                "  child {i}: sep={:?} link={:#x}",
                String::from_utf8_lossy(key),
                self.payload(i, &guard)
            )?;
        }
        Ok(())
    }
}
