//! Copy-on-write node construction.
//!
//! Every function here reads one or more existing nodes and produces a brand
//! new [`NodeBuf`]. Nothing is ever modified in place. [`append_range`] is the
//! single bulk copy primitive; all other builders are expressed through it.

#![allow(clippy::cast_possible_truncation)]

use crate::btree::node::{NodeBuf, NodeKind, NodeRef};
use crate::page::PageId;

/// Copy `n` whole records from `src[src_start..]` into `dst[dst_start..]`.
///
/// Child pointers, keys, and values are copied, and the destination offset
/// table is extended incrementally from `dst.offset(dst_start)`. Records before
/// `dst_start` must already be in place.
pub fn append_range(dst: &mut NodeBuf, src: NodeRef<'_>, dst_start: u16, src_start: u16, n: u16) {
    assert!(dst.kind() == src.kind(), "cannot copy records between node kinds");
    assert!(src_start + n <= src.key_count(), "source range out of bounds");
    assert!(dst_start + n <= dst.key_count(), "destination range out of bounds");
    if n == 0 {
        return;
    }

    if dst.kind() == NodeKind::Internal {
        for i in 0..n {
            dst.set_child(dst_start + i, src.child(src_start + i));
        }
    }

    let dst_begin = dst.offset(dst_start);
    let src_begin = src.offset(src_start);
    for i in 1..=n {
        let offset = dst_begin + (src.offset(src_start + i) - src_begin);
        dst.set_offset(dst_start + i, offset);
    }

    let pos = dst.record_pos(dst_start);
    dst.write_records(pos, src.records(src_start, n));
}

/// Build a leaf with `(key, value)` inserted at `index`.
#[must_use]
pub fn leaf_insert(old: NodeRef<'_>, index: u16, key: &[u8], value: &[u8]) -> NodeBuf {
    let count = old.key_count();
    let mut new = NodeBuf::new(NodeKind::Leaf, count + 1);
    append_range(&mut new, old, 0, 0, index);
    new.append_record(index, 0, key, value);
    append_range(&mut new, old, index + 1, index, count - index);
    new
}

/// Build a leaf with the record at `index` replaced by `(key, value)`.
#[must_use]
pub fn leaf_update(old: NodeRef<'_>, index: u16, key: &[u8], value: &[u8]) -> NodeBuf {
    let count = old.key_count();
    let mut new = NodeBuf::new(NodeKind::Leaf, count);
    append_range(&mut new, old, 0, 0, index);
    new.append_record(index, 0, key, value);
    append_range(&mut new, old, index + 1, index + 1, count - index - 1);
    new
}

/// Build a leaf with the record at `index` removed.
#[must_use]
pub fn leaf_delete(old: NodeRef<'_>, index: u16) -> NodeBuf {
    let count = old.key_count();
    let mut new = NodeBuf::new(NodeKind::Leaf, count - 1);
    append_range(&mut new, old, 0, 0, index);
    append_range(&mut new, old, index, index + 1, count - index - 1);
    new
}

/// Build an internal node with `replaced` children starting at `index` swapped
/// for `children`.
///
/// Each replacement child is handed to `publish`, which stores it and returns
/// its page id; the routing record for it is `(id, first key, empty)`. This
/// threads a split (1 -> 2 or 3), an update (1 -> 1), or a merge (2 -> 1) into
/// the parent in one pass.
pub fn replace_children<E>(
    old: NodeRef<'_>,
    index: u16,
    replaced: u16,
    children: &[NodeBuf],
    mut publish: impl FnMut(&NodeBuf) -> Result<PageId, E>,
) -> Result<NodeBuf, E> {
    assert!(old.kind() == NodeKind::Internal, "only internal nodes have children");
    assert!(index + replaced <= old.key_count(), "replaced slots out of bounds");
    let count = old.key_count();
    let added = children.len() as u16;
    let mut new = NodeBuf::new(NodeKind::Internal, count - replaced + added);

    append_range(&mut new, old, 0, 0, index);
    for (i, child) in (index..).zip(children) {
        let Some(first_key) = child.view().first_key() else {
            panic!("cannot link an empty child into its parent");
        };
        let id = publish(child)?;
        new.append_record(i, id, first_key, &[]);
    }
    append_range(
        &mut new,
        old,
        index + added,
        index + replaced,
        count - index - replaced,
    );
    Ok(new)
}

/// Build an internal node whose children are exactly `children`.
///
/// Used when the root splits and the tree grows by one level.
pub fn internal_from_children<E>(
    children: &[NodeBuf],
    mut publish: impl FnMut(&NodeBuf) -> Result<PageId, E>,
) -> Result<NodeBuf, E> {
    let mut new = NodeBuf::new(NodeKind::Internal, children.len() as u16);
    for (i, child) in (0..).zip(children) {
        let Some(first_key) = child.view().first_key() else {
            panic!("cannot link an empty child into its parent");
        };
        let id = publish(child)?;
        new.append_record(i, id, first_key, &[]);
    }
    Ok(new)
}

/// Concatenate two sibling nodes of the same kind, `left` first.
#[must_use]
pub fn merge(left: NodeRef<'_>, right: NodeRef<'_>) -> NodeBuf {
    assert!(left.kind() == right.kind(), "cannot merge nodes of different kinds");
    let left_count = left.key_count();
    let right_count = right.key_count();
    let mut new = NodeBuf::new(left.kind(), left_count + right_count);
    append_range(&mut new, left, 0, 0, left_count);
    append_range(&mut new, right, left_count, 0, right_count);
    new
}

/// Encoded size of `merge(left, right)` without building it.
#[must_use]
pub fn merged_size(left: NodeRef<'_>, right: NodeRef<'_>) -> usize {
    left.encoded_size() + right.encoded_size() - crate::btree::node::HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_of(records: &[(&[u8], &[u8])]) -> NodeBuf {
        let mut node = NodeBuf::new(NodeKind::Leaf, records.len() as u16);
        for (i, (key, value)) in records.iter().enumerate() {
            node.append_record(i as u16, 0, key, value);
        }
        node
    }

    fn keys(node: &NodeBuf) -> Vec<Vec<u8>> {
        let view = node.view();
        (0..view.key_count()).map(|i| view.key(i).to_vec()).collect()
    }

    #[test]
    fn test_append_range_matches_record_by_record() {
        let src = leaf_of(&[(b"a", b"1"), (b"bb", b"22"), (b"ccc", b"333"), (b"d", b"")]);

        let mut bulk = NodeBuf::new(NodeKind::Leaf, 2);
        append_range(&mut bulk, src.view(), 0, 1, 2);

        let single = leaf_of(&[(b"bb", b"22"), (b"ccc", b"333")]);
        assert_eq!(bulk.encoded(), single.encoded());
    }

    #[test]
    fn test_leaf_insert_middle_and_ends() {
        let old = leaf_of(&[(b"b", b"2"), (b"d", b"4")]);

        let front = leaf_insert(old.view(), 0, b"a", b"1");
        assert_eq!(keys(&front), vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);

        let middle = leaf_insert(old.view(), 1, b"c", b"3");
        assert_eq!(keys(&middle), vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(middle.view().value(1), b"3");

        let back = leaf_insert(old.view(), 2, b"e", b"5");
        assert_eq!(keys(&back), vec![b"b".to_vec(), b"d".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn test_leaf_update_replaces_value() {
        let old = leaf_of(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let new = leaf_update(old.view(), 1, b"b", b"two");

        assert_eq!(new.view().key_count(), 3);
        assert_eq!(new.view().value(1), b"two");
        assert_eq!(new.view().value(2), b"3");
        // the old node is untouched
        assert_eq!(old.view().value(1), b"2");
    }

    #[test]
    fn test_leaf_delete() {
        let old = leaf_of(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let new = leaf_delete(old.view(), 1);
        assert_eq!(keys(&new), vec![b"a".to_vec(), b"c".to_vec()]);

        let single = leaf_of(&[(b"a", b"1")]);
        assert_eq!(leaf_delete(single.view(), 0).key_count(), 0);
    }

    #[test]
    fn test_replace_children_split() {
        let mut parent = NodeBuf::new(NodeKind::Internal, 3);
        parent.append_record(0, 10, b"a", b"");
        parent.append_record(1, 20, b"m", b"");
        parent.append_record(2, 30, b"x", b"");

        let kids = [leaf_of(&[(b"m", b"")]), leaf_of(&[(b"p", b"")])];
        let mut next_id = 100;
        let new = replace_children(parent.view(), 1, 1, &kids, |_| -> Result<u64, ()> {
            next_id += 1;
            Ok(next_id)
        })
        .expect("publish never fails");

        let view = new.view();
        assert_eq!(view.key_count(), 4);
        assert_eq!(keys(&new), vec![b"a".to_vec(), b"m".to_vec(), b"p".to_vec(), b"x".to_vec()]);
        assert_eq!(
            (0..4).map(|i| view.child(i)).collect::<Vec<_>>(),
            vec![10, 101, 102, 30]
        );
    }

    #[test]
    fn test_replace_children_merge() {
        let mut parent = NodeBuf::new(NodeKind::Internal, 3);
        parent.append_record(0, 10, b"a", b"");
        parent.append_record(1, 20, b"m", b"");
        parent.append_record(2, 30, b"x", b"");

        let merged = [leaf_of(&[(b"a", b""), (b"n", b"")])];
        let new = replace_children(parent.view(), 0, 2, &merged, |_| -> Result<u64, ()> {
            Ok(55)
        })
        .expect("publish never fails");

        let view = new.view();
        assert_eq!(keys(&new), vec![b"a".to_vec(), b"x".to_vec()]);
        assert_eq!(view.child(0), 55);
        assert_eq!(view.child(1), 30);
    }

    #[test]
    fn test_replace_children_propagates_publish_error() {
        let mut parent = NodeBuf::new(NodeKind::Internal, 1);
        parent.append_record(0, 10, b"a", b"");
        let kids = [leaf_of(&[(b"a", b"")])];
        let result = replace_children(parent.view(), 0, 1, &kids, |_| Err("full"));
        assert_eq!(result.map(|_| ()), Err("full"));
    }

    #[test]
    fn test_merge_and_merged_size() {
        let left = leaf_of(&[(b"a", b"1"), (b"b", b"2")]);
        let right = leaf_of(&[(b"c", b"3")]);

        let merged = merge(left.view(), right.view());
        assert_eq!(keys(&merged), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(merged.encoded_size(), merged_size(left.view(), right.view()));

        let empty = NodeBuf::empty_leaf();
        let with_empty = merge(empty.view(), right.view());
        assert_eq!(with_empty.encoded(), right.encoded());
    }

    #[test]
    fn test_internal_from_children() {
        let kids = [leaf_of(&[(b"a", b"1")]), leaf_of(&[(b"k", b"2")])];
        let mut ids = vec![8, 9].into_iter();
        let root = internal_from_children(&kids, |_| ids.next().ok_or(()))
            .expect("ids available");
        let view = root.view();
        assert_eq!(view.kind(), NodeKind::Internal);
        assert_eq!(view.key(1), b"k");
        assert_eq!(view.child(1), 9);
    }
}
