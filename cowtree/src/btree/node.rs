//! B-tree node layout and serialization.
//!
//! A node occupies one page:
//!
//! ```text
//! offset 0  : u16 node_kind        (1 = internal, 2 = leaf)
//! offset 2  : u16 key_count
//! offset 4  : [key_count] u64 child_pointer      (internal only)
//! then      : [key_count] u16 cumulative_offset  (offset[0] is implicit 0)
//! then      : key_count records of
//!             u16 key_len | u16 val_len | key bytes | value bytes
//! ```
//!
//! Internal nodes store an empty value in every record; their keys are routing
//! keys, each a copy of the first key of the matching child.
//!
//! Two types share this layout. [`NodeRef`] is a read-only view over bytes that
//! may be published. [`NodeBuf`] is an exclusively owned scratch buffer used to
//! build a new node. It is twice a page long so that a node may temporarily
//! overflow before the split engine cuts it down.

#![allow(clippy::cast_possible_truncation)]

use crate::page::{PAGE_SIZE, PageId, read_u16, read_u64, write_u16, write_u64};

/// Size of the node header (kind + key count).
pub const HEADER_SIZE: usize = 4;

/// Size of one child pointer.
pub const POINTER_SIZE: usize = 8;

/// Size of one offset table entry.
pub const OFFSET_SIZE: usize = 2;

/// Size of the per-record length prefix (key length + value length).
pub const RECORD_HEADER_SIZE: usize = 4;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 1000;

/// Maximum value size in bytes.
pub const MAX_VALUE_SIZE: usize = 3000;

/// Size of the largest possible node holding a single record.
///
/// If this did not fit in a page, a node could overflow with nothing left to
/// split off.
pub const MAX_SINGLE_RECORD_NODE: usize = HEADER_SIZE
    + POINTER_SIZE
    + OFFSET_SIZE
    + RECORD_HEADER_SIZE
    + MAX_KEY_SIZE
    + MAX_VALUE_SIZE;

const _: () = assert!(MAX_SINGLE_RECORD_NODE <= PAGE_SIZE);

/// Capacity of a scratch buffer.
const SCRATCH_SIZE: usize = 2 * PAGE_SIZE;

/// Node kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeKind {
    Internal = 1,
    Leaf = 2,
}

impl NodeKind {
    /// Width of the child pointer stored per key.
    #[must_use]
    pub const fn pointer_width(self) -> usize {
        match self {
            Self::Internal => POINTER_SIZE,
            Self::Leaf => 0,
        }
    }
}

impl TryFrom<u16> for NodeKind {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Internal),
            2 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// Start of the offset table.
const fn offsets_start(kind: NodeKind, count: u16) -> usize {
    HEADER_SIZE + kind.pointer_width() * count as usize
}

/// Start of the record area.
const fn records_start(kind: NodeKind, count: u16) -> usize {
    offsets_start(kind, count) + OFFSET_SIZE * count as usize
}

/// Read the cumulative offset of record `index` (`index <= count`).
fn offset_at(bytes: &[u8], kind: NodeKind, count: u16, index: u16) -> u16 {
    assert!(index <= count, "offset index {index} out of range ({count} keys)");
    if index == 0 {
        return 0;
    }
    read_u16(bytes, offsets_start(kind, count) + OFFSET_SIZE * (index as usize - 1))
}

/// A read-only view over an encoded node.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    bytes: &'a [u8],
    kind: NodeKind,
    count: u16,
}

impl<'a> NodeRef<'a> {
    /// Parse and validate a node from raw page bytes.
    ///
    /// Checks that the tables and every record lie inside the buffer, that the
    /// offset table agrees with the record length prefixes, and that internal
    /// records carry no payload.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, NodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(NodeError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let kind = NodeKind::try_from(read_u16(bytes, 0)).map_err(NodeError::InvalidKind)?;
        let count = read_u16(bytes, 2);
        let node = Self { bytes, kind, count };
        if kind == NodeKind::Internal && count == 0 {
            return Err(NodeError::EmptyInternal);
        }

        let start = records_start(kind, count);
        if start > bytes.len() {
            return Err(NodeError::Truncated {
                needed: start,
                available: bytes.len(),
            });
        }

        for index in 0..count {
            let begin = node.offset(index) as usize;
            let pos = start + begin;
            if pos + RECORD_HEADER_SIZE > bytes.len() {
                return Err(NodeError::Truncated {
                    needed: pos + RECORD_HEADER_SIZE,
                    available: bytes.len(),
                });
            }
            let key_len = read_u16(bytes, pos) as usize;
            let value_len = read_u16(bytes, pos + 2) as usize;
            if kind == NodeKind::Internal && value_len != 0 {
                return Err(NodeError::InternalPayload { index });
            }
            let end = begin + RECORD_HEADER_SIZE + key_len + value_len;
            if node.offset(index + 1) as usize != end {
                return Err(NodeError::OffsetMismatch { index });
            }
            if start + end > bytes.len() {
                return Err(NodeError::Truncated {
                    needed: start + end,
                    available: bytes.len(),
                });
            }
        }

        Ok(node)
    }

    /// Rebuild a view over bytes that already passed [`NodeRef::parse`].
    pub(crate) const fn from_parts(bytes: &'a [u8], kind: NodeKind, count: u16) -> Self {
        Self { bytes, kind, count }
    }

    /// The node kind.
    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Whether this node is a leaf.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Number of keys stored in the node.
    #[must_use]
    pub const fn key_count(&self) -> u16 {
        self.count
    }

    /// Child page id for key `index` (internal nodes only).
    #[must_use]
    pub fn child(&self, index: u16) -> PageId {
        assert!(self.kind == NodeKind::Internal, "leaf nodes have no children");
        assert!(index < self.count, "child index {index} out of range ({} keys)", self.count);
        read_u64(self.bytes, HEADER_SIZE + POINTER_SIZE * index as usize)
    }

    /// Cumulative offset of record `index` within the record area.
    #[must_use]
    pub fn offset(&self, index: u16) -> u16 {
        offset_at(self.bytes, self.kind, self.count, index)
    }

    /// Absolute position of record `index` (`index <= key_count`).
    #[must_use]
    pub fn record_pos(&self, index: u16) -> usize {
        records_start(self.kind, self.count) + self.offset(index) as usize
    }

    /// Key at `index`.
    #[must_use]
    pub fn key(&self, index: u16) -> &'a [u8] {
        assert!(index < self.count, "key index {index} out of range ({} keys)", self.count);
        let pos = self.record_pos(index);
        let key_len = read_u16(self.bytes, pos) as usize;
        &self.bytes[pos + RECORD_HEADER_SIZE..pos + RECORD_HEADER_SIZE + key_len]
    }

    /// Value at `index`. Always empty on internal nodes.
    #[must_use]
    pub fn value(&self, index: u16) -> &'a [u8] {
        assert!(index < self.count, "value index {index} out of range ({} keys)", self.count);
        let pos = self.record_pos(index);
        let key_len = read_u16(self.bytes, pos) as usize;
        let value_len = read_u16(self.bytes, pos + 2) as usize;
        let start = pos + RECORD_HEADER_SIZE + key_len;
        &self.bytes[start..start + value_len]
    }

    /// First key of the node, if any.
    #[must_use]
    pub fn first_key(&self) -> Option<&'a [u8]> {
        (self.count > 0).then(|| self.key(0))
    }

    /// Raw bytes of records `start..start + n`, length prefixes included.
    #[must_use]
    pub fn records(&self, start: u16, n: u16) -> &'a [u8] {
        &self.bytes[self.record_pos(start)..self.record_pos(start + n)]
    }

    /// Total encoded size of the node in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        self.record_pos(self.count)
    }

    /// Encoded size of a node holding only records `0..n` of this node.
    #[must_use]
    pub fn prefix_size(&self, n: u16) -> usize {
        records_start(self.kind, n) + self.offset(n) as usize
    }

    /// Encoded size of a node holding only records `n..key_count` of this node.
    #[must_use]
    pub fn suffix_size(&self, n: u16) -> usize {
        records_start(self.kind, self.count - n)
            + (self.offset(self.count) - self.offset(n)) as usize
    }
}

impl std::fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("kind", &self.kind)
            .field("key_count", &self.count)
            .field("encoded_size", &self.encoded_size())
            .finish()
    }
}

/// An exclusively owned node under construction.
///
/// The header (kind and final key count) is fixed at creation because the
/// position of every table depends on it. Records are then appended in index
/// order with [`NodeBuf::append_record`] or
/// [`append_range`](super::builder::append_range).
pub struct NodeBuf {
    data: Vec<u8>,
    kind: NodeKind,
    count: u16,
}

impl NodeBuf {
    /// Create an empty buffer with the given header.
    #[must_use]
    pub fn new(kind: NodeKind, count: u16) -> Self {
        let mut node = Self {
            data: vec![0u8; SCRATCH_SIZE],
            kind,
            count,
        };
        node.set_header(kind, count);
        node
    }

    /// Create an empty leaf, the root of an empty tree.
    #[must_use]
    pub fn empty_leaf() -> Self {
        Self::new(NodeKind::Leaf, 0)
    }

    /// Overwrite the header.
    ///
    /// Only meaningful before any record is appended, since table positions
    /// move with the key count.
    pub fn set_header(&mut self, kind: NodeKind, count: u16) {
        assert!(
            records_start(kind, count) <= SCRATCH_SIZE,
            "{count} keys do not fit in a scratch node"
        );
        self.kind = kind;
        self.count = count;
        write_u16(&mut self.data, 0, kind as u16);
        write_u16(&mut self.data, 2, count);
    }

    /// The node kind.
    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Number of keys in the node.
    #[must_use]
    pub const fn key_count(&self) -> u16 {
        self.count
    }

    /// Set the child pointer for key `index`.
    pub fn set_child(&mut self, index: u16, child: PageId) {
        assert!(self.kind == NodeKind::Internal, "leaf nodes have no children");
        assert!(index < self.count, "child index {index} out of range ({} keys)", self.count);
        write_u64(&mut self.data, HEADER_SIZE + POINTER_SIZE * index as usize, child);
    }

    /// Set the cumulative offset that ends record `index - 1`.
    pub fn set_offset(&mut self, index: u16, offset: u16) {
        assert!(
            (1..=self.count).contains(&index),
            "offset index {index} out of range ({} keys)",
            self.count
        );
        let pos = offsets_start(self.kind, self.count) + OFFSET_SIZE * (index as usize - 1);
        write_u16(&mut self.data, pos, offset);
    }

    /// Cumulative offset of record `index`.
    #[must_use]
    pub fn offset(&self, index: u16) -> u16 {
        offset_at(&self.data, self.kind, self.count, index)
    }

    /// Absolute position of record `index`.
    #[must_use]
    pub fn record_pos(&self, index: u16) -> usize {
        records_start(self.kind, self.count) + self.offset(index) as usize
    }

    /// Write record `index` and advance the offset table past it.
    ///
    /// `child` is ignored on leaves. Records must be appended in order: the
    /// position of record `index` comes from the offset written by record
    /// `index - 1`.
    pub fn append_record(&mut self, index: u16, child: PageId, key: &[u8], value: &[u8]) {
        assert!(index < self.count, "record index {index} out of range ({} keys)", self.count);
        assert!(
            self.kind == NodeKind::Leaf || value.is_empty(),
            "internal records carry no value"
        );
        if self.kind == NodeKind::Internal {
            self.set_child(index, child);
        }

        let pos = self.record_pos(index);
        write_u16(&mut self.data, pos, key.len() as u16);
        write_u16(&mut self.data, pos + 2, value.len() as u16);
        let key_start = pos + RECORD_HEADER_SIZE;
        self.data[key_start..key_start + key.len()].copy_from_slice(key);
        let value_start = key_start + key.len();
        self.data[value_start..value_start + value.len()].copy_from_slice(value);

        let next = self.offset(index) as usize + RECORD_HEADER_SIZE + key.len() + value.len();
        assert!(next <= usize::from(u16::MAX), "record area overflow");
        self.set_offset(index + 1, next as u16);
    }

    /// Copy raw record bytes to an absolute position.
    pub(crate) fn write_records(&mut self, pos: usize, records: &[u8]) {
        self.data[pos..pos + records.len()].copy_from_slice(records);
    }

    /// Read-only view over the node built so far.
    #[must_use]
    pub fn view(&self) -> NodeRef<'_> {
        NodeRef {
            bytes: &self.data,
            kind: self.kind,
            count: self.count,
        }
    }

    /// Total encoded size of the node.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        self.record_pos(self.count)
    }

    /// Whether the node fits in one page.
    #[must_use]
    pub fn fits(&self) -> bool {
        self.encoded_size() <= PAGE_SIZE
    }

    /// The encoded bytes, ready to be handed to a page store.
    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.data[..self.encoded_size()]
    }
}

impl std::fmt::Debug for NodeBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuf")
            .field("kind", &self.kind)
            .field("key_count", &self.count)
            .field("encoded_size", &self.encoded_size())
            .finish()
    }
}

/// Errors found while decoding a node from a page.
///
/// These indicate a corrupted page or a store that disagrees with the tree
/// about which pages are reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Unknown node kind discriminant.
    InvalidKind(u16),
    /// A table or record extends past the end of the page.
    Truncated { needed: usize, available: usize },
    /// The offset table disagrees with a record's length prefix.
    OffsetMismatch { index: u16 },
    /// An internal node record carries a value.
    InternalPayload { index: u16 },
    /// An internal node without children.
    EmptyInternal,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKind(kind) => write!(f, "invalid node kind: {kind}"),
            Self::Truncated { needed, available } => {
                write!(f, "node truncated: needs {needed} bytes, page has {available}")
            }
            Self::OffsetMismatch { index } => {
                write!(f, "offset table inconsistent at record {index}")
            }
            Self::InternalPayload { index } => {
                write!(f, "internal node record {index} carries a value")
            }
            Self::EmptyInternal => write!(f, "internal node has no children"),
        }
    }
}

impl std::error::Error for NodeError {}

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

    #[test]
    fn test_leaf_layout_is_bit_exact() {
        let node = leaf_of(&[(b"ab", b"xyz"), (b"c", b"")]);
        let bytes = node.encoded();

        // header
        assert_eq!(&bytes[0..2], &2u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &2u16.to_le_bytes());
        // offsets: record 0 ends at 4 + 2 + 3 = 9, record 1 at 9 + 4 + 1 = 14
        assert_eq!(&bytes[4..6], &9u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &14u16.to_le_bytes());
        // first record
        assert_eq!(&bytes[8..10], &2u16.to_le_bytes());
        assert_eq!(&bytes[10..12], &3u16.to_le_bytes());
        assert_eq!(&bytes[12..14], b"ab");
        assert_eq!(&bytes[14..17], b"xyz");
        assert_eq!(bytes.len(), 8 + 14);
    }

    #[test]
    fn test_internal_layout_has_pointer_table() {
        let mut node = NodeBuf::new(NodeKind::Internal, 2);
        node.append_record(0, 7, b"a", b"");
        node.append_record(1, 9, b"m", b"");
        let bytes = node.encoded();

        assert_eq!(&bytes[0..2], &1u16.to_le_bytes());
        assert_eq!(&bytes[4..12], &7u64.to_le_bytes());
        assert_eq!(&bytes[12..20], &9u64.to_le_bytes());
        assert_eq!(&bytes[20..22], &5u16.to_le_bytes());
        assert_eq!(&bytes[22..24], &10u16.to_le_bytes());
        assert_eq!(node.encoded_size(), 4 + 16 + 4 + 10);
    }

    #[test]
    fn test_parse_accessors() {
        let node = leaf_of(&[(b"k1", b"v1"), (b"k2", b"value2"), (b"k3", b"")]);
        let parsed = NodeRef::parse(node.encoded()).expect("should parse");

        assert_eq!(parsed.kind(), NodeKind::Leaf);
        assert_eq!(parsed.key_count(), 3);
        assert_eq!(parsed.key(1), b"k2");
        assert_eq!(parsed.value(1), b"value2");
        assert_eq!(parsed.value(2), b"");
        assert_eq!(parsed.first_key(), Some(b"k1".as_slice()));
        assert_eq!(parsed.encoded_size(), node.encoded_size());
    }

    #[test]
    fn test_parse_rejects_bad_kind() {
        let mut bytes = leaf_of(&[(b"a", b"b")]).encoded().to_vec();
        bytes[0] = 9;
        assert_eq!(NodeRef::parse(&bytes).map(|_| ()), Err(NodeError::InvalidKind(9)));
    }

    #[test]
    fn test_parse_rejects_offset_mismatch() {
        let mut bytes = leaf_of(&[(b"a", b"b"), (b"c", b"d")]).encoded().to_vec();
        // bump the first record's value length without moving the offsets
        bytes[8 + 2] = 2;
        assert_eq!(
            NodeRef::parse(&bytes).map(|_| ()),
            Err(NodeError::OffsetMismatch { index: 0 })
        );
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let bytes = leaf_of(&[(b"key", b"value")]).encoded().to_vec();
        let result = NodeRef::parse(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(NodeError::Truncated { .. })));
    }

    #[test]
    fn test_parse_rejects_internal_payload() {
        let mut bytes = NodeBuf::new(NodeKind::Internal, 1);
        bytes.append_record(0, 3, b"a", b"");
        let mut raw = bytes.encoded().to_vec();
        // claim a one byte value, and fix up the offset so only the payload check fires
        raw[4 + 8 + 2 + 2] = 1;
        raw.push(0);
        raw[4 + 8] = 6;
        assert_eq!(
            NodeRef::parse(&raw).map(|_| ()),
            Err(NodeError::InternalPayload { index: 0 })
        );
    }

    #[test]
    fn test_parse_rejects_empty_internal() {
        let node = NodeBuf::new(NodeKind::Internal, 0);
        assert_eq!(
            NodeRef::parse(node.encoded()).map(|_| ()),
            Err(NodeError::EmptyInternal)
        );
    }

    #[test]
    fn test_prefix_and_suffix_sizes_add_up() {
        let node = leaf_of(&[(b"a", b"1"), (b"bb", b"22"), (b"ccc", b"333")]);
        let view = node.view();
        for n in 0..=3 {
            assert_eq!(
                view.prefix_size(n) + view.suffix_size(n) - HEADER_SIZE,
                view.encoded_size()
            );
        }
    }

    #[test]
    fn test_empty_leaf() {
        let node = NodeBuf::empty_leaf();
        assert_eq!(node.encoded_size(), HEADER_SIZE);
        let parsed = NodeRef::parse(node.encoded()).expect("should parse");
        assert_eq!(parsed.key_count(), 0);
        assert_eq!(parsed.first_key(), None);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_key_index_out_of_range_panics() {
        let node = leaf_of(&[(b"a", b"b")]);
        let _ = node.view().key(1);
    }

    #[test]
    fn test_node_kind_conversion() {
        assert_eq!(NodeKind::try_from(1), Ok(NodeKind::Internal));
        assert_eq!(NodeKind::try_from(2), Ok(NodeKind::Leaf));
        assert_eq!(NodeKind::try_from(0), Err(0));
    }
}
