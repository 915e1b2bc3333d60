//! Key search within a single node.

use crate::btree::node::NodeRef;

/// Index of the last key `<= key`, or 0 if every key is greater.
///
/// Index 0 is the default because a non-root node's first key is the routing
/// key its parent descended on, so it is `<=` every key that can reach it. The
/// only node where that does not hold is the leftmost path of the tree, where
/// callers that insert must compare against `key(0)` themselves.
///
/// Point lookups check for an exact match at the returned index; descents
/// follow the child at that index.
#[must_use]
pub fn seek_last_le(node: NodeRef<'_>, key: &[u8]) -> u16 {
    let mut found = 0;
    for index in 1..node.key_count() {
        let current = node.key(index);
        if current <= key {
            found = index;
        }
        if current >= key {
            break;
        }
    }
    found
}

/// Index of `key` in a leaf, if present.
#[must_use]
pub fn find_exact(node: NodeRef<'_>, key: &[u8]) -> Option<u16> {
    if node.key_count() == 0 {
        return None;
    }
    let index = seek_last_le(node, key);
    (node.key(index) == key).then_some(index)
}

/// Where `key` belongs in a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafSlot {
    /// The key is stored at this index.
    Existing(u16),
    /// The key is absent and would be inserted at this index.
    Vacant(u16),
}

/// Locate the slot for `key` in a leaf.
#[must_use]
pub fn leaf_slot(node: NodeRef<'_>, key: &[u8]) -> LeafSlot {
    if node.key_count() == 0 {
        return LeafSlot::Vacant(0);
    }
    let index = seek_last_le(node, key);
    match node.key(index).cmp(key) {
        std::cmp::Ordering::Equal => LeafSlot::Existing(index),
        // only possible at index 0: the key sorts before everything here
        std::cmp::Ordering::Greater => LeafSlot::Vacant(index),
        std::cmp::Ordering::Less => LeafSlot::Vacant(index + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{NodeBuf, NodeKind};

    fn leaf_of(keys: &[&[u8]]) -> NodeBuf {
        let mut node = NodeBuf::new(NodeKind::Leaf, u16::try_from(keys.len()).expect("small"));
        for (i, key) in (0u16..).zip(keys) {
            node.append_record(i, 0, key, b"");
        }
        node
    }

    #[test]
    fn test_seek_last_le() {
        let node = leaf_of(&[b"b", b"d", b"f"]);
        let view = node.view();

        assert_eq!(seek_last_le(view, b"a"), 0);
        assert_eq!(seek_last_le(view, b"b"), 0);
        assert_eq!(seek_last_le(view, b"c"), 0);
        assert_eq!(seek_last_le(view, b"d"), 1);
        assert_eq!(seek_last_le(view, b"e"), 1);
        assert_eq!(seek_last_le(view, b"f"), 2);
        assert_eq!(seek_last_le(view, b"z"), 2);
    }

    #[test]
    fn test_seek_on_empty_node() {
        let node = NodeBuf::empty_leaf();
        assert_eq!(seek_last_le(node.view(), b"x"), 0);
        assert_eq!(find_exact(node.view(), b"x"), None);
        assert_eq!(leaf_slot(node.view(), b"x"), LeafSlot::Vacant(0));
    }

    #[test]
    fn test_find_exact() {
        let node = leaf_of(&[b"b", b"d"]);
        assert_eq!(find_exact(node.view(), b"d"), Some(1));
        assert_eq!(find_exact(node.view(), b"c"), None);
        assert_eq!(find_exact(node.view(), b"a"), None);
    }

    #[test]
    fn test_leaf_slot() {
        let node = leaf_of(&[b"b", b"d"]);
        let view = node.view();
        assert_eq!(leaf_slot(view, b"a"), LeafSlot::Vacant(0));
        assert_eq!(leaf_slot(view, b"b"), LeafSlot::Existing(0));
        assert_eq!(leaf_slot(view, b"c"), LeafSlot::Vacant(1));
        assert_eq!(leaf_slot(view, b"e"), LeafSlot::Vacant(2));
    }

    #[test]
    fn test_empty_key_sorts_first() {
        let node = leaf_of(&[b"", b"a"]);
        assert_eq!(leaf_slot(node.view(), b""), LeafSlot::Existing(0));
        assert_eq!(seek_last_le(node.view(), b"0"), 0);
    }
}
