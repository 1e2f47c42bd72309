//! # BzTree
//!
//! A latch-free concurrent B+-tree mapping variable-length byte-string keys
//! to 64-bit payloads, after the design published in
//! "BzTree: A High-Performance Latch-free Range Index for Non-Volatile Memory"
//! (VLDB'18).
//!
//! Every structural transition in the tree is a multi-word compare-and-swap
//! (via the [`mwcas`] crate), so no thread ever holds a lock:
//! - record insertion publishes tentative slot metadata in two MWCAS phases,
//! - nodes are made read-only by an irreversible *freeze* of their status word,
//! - splits propagate bottom-up by freezing and rewriting ancestors,
//! - the root is replaced by a single CAS on the tree's root cell.
//!
//! Memory reclamation is epoch-based ([`crossbeam_epoch`]): superseded nodes
//! are retired inside the guard of the operation that unlinked them and are
//! freed only once every thread present at retirement has left its epoch.
//!
//! ## Example
//!
//! ```
//! use bztree::BzTree;
//!
//! let tree = BzTree::new();
//! assert!(tree.insert(b"apple", 1));
//! assert!(!tree.insert(b"apple", 2)); // duplicate key
//! assert_eq!(tree.read(b"apple"), Some(1));
//! assert!(tree.update(b"apple", 3));
//! assert_eq!(tree.read(b"apple"), Some(3));
//! assert!(tree.delete(b"apple"));
//! assert_eq!(tree.read(b"apple"), None);
//! ```
//!
//! ## Concurrency model
//!
//! All operations take `&self` and may be called from any number of threads.
//! Readers never block writers and writers never block readers; contended
//! MWCAS transitions are retried. A reader that observes a record as visible
//! is guaranteed to observe the key bytes written before publication.

mod alloc;
mod internal;
mod leaf;
mod node;
mod record_meta;
mod scanner;
mod status_word;
mod tracing_helpers;
mod tree;

pub use leaf::Record;
pub use scanner::Scanner;
pub use tree::{BzTree, TreeParams};

use std::sync::atomic::AtomicU64;

/// Global insert epoch stamped into in-flight slot reservations.
///
/// A reservation carries the epoch current at reserve time so that, on a
/// persistent-memory restart, reservations from a previous incarnation can
/// be recognized as stale and discarded. The volatile build never advances
/// it; the stamp only has to be non-zero so a reservation is distinguishable
/// from a vacant slot.
pub(crate) static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(1);
