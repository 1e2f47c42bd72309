//! Lazy ordered range scanner.
//!
//! A [`Scanner`] walks the tree one leaf at a time. Each refill pins an
//! epoch, traverses to the leaf covering the current lower bound, snapshots
//! every in-range visible record of that leaf in key order, and remembers
//! where the leaf's coverage ends: the tightest separator recorded on the
//! way down bounds every key the leaf can hold, so the next refill starts
//! just past it. The rightmost leaf has no such bound and ends the scan.
//!
//! Snapshots are taken per leaf, not per tree: a scan running concurrently
//! with writers sees each leaf atomically but may observe updates committed
//! between leaf visits.

use crate::leaf::Record;
use crate::tree::BzTree;

/// Iterator over the records with keys in `[lo, hi]`, ascending.
///
/// Created by [`BzTree::range_scan`].
pub struct Scanner<'t> {
    tree: &'t BzTree,
    hi: Box<[u8]>,
    /// Lower bound of the next leaf visit; `None` when the scan is done.
    next_lo: Option<Box<[u8]>>,
    batch: std::vec::IntoIter<Record>,
}

impl<'t> Scanner<'t> {
    pub(crate) fn new(tree: &'t BzTree, lo: &[u8], hi: &[u8]) -> Self {
        Self {
            tree,
            hi: hi.into(),
            next_lo: (lo <= hi).then(|| lo.into()),
            batch: Vec::new().into_iter(),
        }
    }

    /// Smallest key greater than `key` under (bytewise, then length) order.
    fn successor(key: &[u8]) -> Box<[u8]> {
        let mut next = Vec::with_capacity(key.len() + 1);
        next.extend_from_slice(key);
        next.push(0);
        next.into_boxed_slice()
    }
}

impl Iterator for Scanner<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        loop {
            if let Some(record) = self.batch.next() {
                return Some(record);
            }

            let lo = self.next_lo.take()?;
            let guard = crossbeam_epoch::pin();
            let (leaf, upper) = self.tree.leaf_for_scan(&lo, &guard);

            let mut records = Vec::new();
            leaf.leaf().range_scan(&lo, &self.hi, &mut records, &guard);
            self.batch = records.into_iter();

            // The visited leaf covered (.., upper]; continue past it unless
            // the bound already clears the scan's upper end.
            self.next_lo = match upper {
                Some(bound) if *bound < *self.hi => Some(Self::successor(&bound)),
                _ => None,
            };
        }
    }
}

impl std::iter::FusedIterator for Scanner<'_> {}
