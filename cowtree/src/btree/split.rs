//! Splitting oversized nodes.
//!
//! A builder operation can leave a node larger than one page: a leaf insert
//! adds a record, and an internal node gains up to two routing records when a
//! child splits in three. [`split_if_needed`] cuts such a node into at most
//! three page-sized siblings. Three is enough because a node is at most one
//! page plus one maximal record, and a single maximal record always fits in a
//! page on its own.

use crate::btree::builder::append_range;
use crate::btree::node::{NodeBuf, NodeRef};
use crate::page::PAGE_SIZE;

/// Return `node` unchanged if it fits in a page, otherwise 2 or 3 nodes that
/// each fit, in key order.
#[must_use]
pub fn split_if_needed(node: NodeBuf) -> Vec<NodeBuf> {
    if node.fits() {
        return vec![node];
    }

    let (left, right) = split_in_two(node.view());
    if left.fits() {
        tracing::trace!(
            keys = node.key_count(),
            left = left.key_count(),
            right = right.key_count(),
            "split node in two"
        );
        return vec![left, right];
    }

    let (left_left, middle) = split_in_two(left.view());
    assert!(left_left.fits(), "split produced a node larger than a page");
    tracing::trace!(
        keys = node.key_count(),
        left = left_left.key_count(),
        middle = middle.key_count(),
        right = right.key_count(),
        "split node in three"
    );
    vec![left_left, middle, right]
}

/// Split a node into a prefix and a suffix, both non-empty.
///
/// The split point starts at the midpoint, moves left until the left part
/// fits, then right until the right part fits. The right part always fits; the
/// left part may not if the node is dominated by one large record near the
/// front, in which case the caller splits it again.
fn split_in_two(old: NodeRef<'_>) -> (NodeBuf, NodeBuf) {
    let count = old.key_count();
    assert!(count >= 2, "cannot split a node with {count} keys");

    let mut left_count = count / 2;
    while left_count > 1 && old.prefix_size(left_count) > PAGE_SIZE {
        left_count -= 1;
    }
    while old.suffix_size(left_count) > PAGE_SIZE {
        left_count += 1;
    }
    assert!(left_count < count, "no split point leaves a fitting right node");

    let right_count = count - left_count;
    let mut left = NodeBuf::new(old.kind(), left_count);
    append_range(&mut left, old, 0, 0, left_count);
    let mut right = NodeBuf::new(old.kind(), right_count);
    append_range(&mut right, old, 0, left_count, right_count);

    debug_assert!(right.fits());
    (left, right)
}
