//! Copy-on-write B+tree handle.
//!
//! A tree is a root page id plus a [`PageStore`]. Published pages are never
//! modified: every mutation rebuilds the path from the touched leaf up to the
//! root in fresh pages and then swaps the root id. Pages of older versions stay
//! readable, so a [`Snapshot`] taken before a write keeps seeing the tree as it
//! was.
//!
//! # Update algorithm
//!
//! Insert and delete recurse down to the leaf. Each level returns an owned,
//! possibly oversized [`NodeBuf`]; the parent splits it into page-sized parts,
//! publishes them and threads their ids back into its own copy with
//! [`replace_children`]. Deletes merge an underfull child into a sibling when
//! the result fits in a page, left sibling first. The top-level result becomes
//! the new root: a split root grows the tree by one level, an internal root with
//! a single child is replaced by that child.
//!
//! # Reclamation
//!
//! Pages replaced by a mutation are retired rather than freed. They are handed
//! back to the store only once no snapshot or cursor is alive, which the tree
//! checks after every mutation and in [`BTree::reclaim`].

use std::ops::RangeBounds;
use std::sync::Arc;

use crate::btree::builder::{
    internal_from_children, leaf_delete, leaf_insert, leaf_update, merge, merged_size,
    replace_children,
};
use crate::btree::cursor::{Cursor, Range};
use crate::btree::lookup::{LeafSlot, find_exact, leaf_slot, seek_last_le};
use crate::btree::node::{NodeBuf, NodeError, NodeKind, NodeRef};
use crate::btree::split::split_if_needed;
use crate::btree::verify::{InvariantViolation, TreeStats, verify};
use crate::config::{ConfigError, TreeConfig};
use crate::page::{PAGE_SIZE, Page, PageId};
use crate::store::{PageStore, StoreError};

/// A copy-on-write B+tree over a page store.
///
/// Mutations take `&mut self`, so there is a single writer. Readers work on
/// detached [`Snapshot`]s and [`Cursor`]s that share the store through an
/// `Arc`.
pub struct BTree<S: PageStore> {
    store: Arc<S>,
    root: PageId,
    config: TreeConfig,
    /// Pages replaced by completed mutations, waiting for readers to go away.
    retired: Vec<PageId>,
    /// Cloned into every snapshot and cursor; the strong count tells whether
    /// any reader is alive.
    readers: Arc<()>,
}

impl<S: PageStore> BTree<S> {
    /// Create an empty tree: a single empty leaf.
    pub fn create(store: Arc<S>, config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;
        let root = store.allocate(NodeBuf::empty_leaf().encoded())?;
        tracing::debug!(root, "created empty tree");
        Ok(Self::with_root(store, root, config))
    }

    /// Open an existing tree rooted at `root`.
    ///
    /// Only the root page is checked here; deeper pages are validated as they
    /// are read.
    pub fn open(store: Arc<S>, root: PageId, config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;
        let page = load_page(&*store, root)?;
        parse_node(&page, root)?;
        Ok(Self::with_root(store, root, config))
    }

    fn with_root(store: Arc<S>, root: PageId, config: TreeConfig) -> Self {
        Self {
            store,
            root,
            config,
            retired: Vec::new(),
            readers: Arc::new(()),
        }
    }

    /// Id of the current root page.
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.root
    }

    /// The configuration this tree was opened with.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The underlying page store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of replaced pages not yet returned to the store.
    #[must_use]
    pub fn retired_pages(&self) -> usize {
        self.retired.len()
    }

    /// Look up the value stored for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if key.len() > self.config.max_key_size {
            return Ok(None);
        }
        lookup(&*self.store, self.root, key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool, TreeError> {
        Ok(self.get(key)?.is_some())
    }

    /// Whether the tree holds no keys.
    pub fn is_empty(&self) -> Result<bool, TreeError> {
        let page = load_page(&*self.store, self.root)?;
        let node = parse_node(&page, self.root)?;
        Ok(node.key_count() == 0)
    }

    /// Count all keys by scanning the leaves.
    pub fn count(&self) -> Result<usize, TreeError> {
        let mut count = 0;
        for entry in self.iter() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Insert or update a key-value pair.
    ///
    /// Returns the previous value if the key was already present.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if key.len() > self.config.max_key_size {
            return Err(TreeError::KeyTooLarge {
                size: key.len(),
                max: self.config.max_key_size,
            });
        }
        if value.len() > self.config.max_value_size {
            return Err(TreeError::ValueTooLarge {
                size: value.len(),
                max: self.config.max_value_size,
            });
        }

        let previous = self.mutate(|mutation, root| {
            let page = mutation.load(root)?;
            let node = parse_node(&page, root)?;
            let (updated, previous) = mutation.insert(node, key, value)?;
            mutation.retire(root);
            let new_root = mutation.install_root(updated)?;
            Ok(Some((new_root, previous)))
        })?;
        Ok(previous.flatten())
    }

    /// Delete `key`.
    ///
    /// Returns the removed value. Deleting an absent key is a no-op and leaves
    /// the root unchanged.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if key.len() > self.config.max_key_size {
            return Ok(None);
        }

        self.mutate(|mutation, root| {
            let page = mutation.load(root)?;
            let node = parse_node(&page, root)?;
            let Some((updated, removed)) = mutation.delete(node, key)? else {
                return Ok(None);
            };
            mutation.retire(root);
            let new_root = mutation.install_root(updated)?;
            Ok(Some((new_root, removed)))
        })
    }

    /// Run one mutation and install its new root.
    ///
    /// `op` returns `None` when nothing changed. On error every page the
    /// mutation allocated is freed and the previous root stays installed.
    fn mutate<T>(
        &mut self,
        op: impl FnOnce(&mut Mutation<'_, S>, PageId) -> Result<Option<(PageId, T)>, TreeError>,
    ) -> Result<Option<T>, TreeError> {
        let mut mutation = Mutation::new(&*self.store, self.config.merge_threshold);
        match op(&mut mutation, self.root) {
            Ok(Some((root, output))) => {
                let retired = mutation.retired;
                tracing::trace!(
                    old_root = self.root,
                    new_root = root,
                    retired = retired.len(),
                    "installed new root"
                );
                self.root = root;
                self.retired.extend(retired);
                self.reclaim_quietly();
                Ok(Some(output))
            }
            Ok(None) => {
                debug_assert!(mutation.fresh.is_empty(), "no-op mutation allocated pages");
                Ok(None)
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    allocated = mutation.fresh.len(),
                    "mutation aborted, keeping previous root"
                );
                mutation.abort();
                Err(error)
            }
        }
    }

    /// Free retired pages if no snapshot or cursor is alive.
    ///
    /// Returns the number of pages freed. Pages that could not be freed stay
    /// retired and are retried on the next call.
    pub fn reclaim(&mut self) -> Result<usize, TreeError> {
        if self.retired.is_empty() || Arc::strong_count(&self.readers) > 1 {
            return Ok(0);
        }

        let mut freed = 0;
        while let Some(id) = self.retired.pop() {
            if let Err(e) = self.store.free(id) {
                self.retired.push(id);
                return Err(e.into());
            }
            freed += 1;
        }
        tracing::trace!(freed, "reclaimed retired pages");
        Ok(freed)
    }

    fn reclaim_quietly(&mut self) {
        if let Err(error) = self.reclaim() {
            tracing::warn!(
                %error,
                pending = self.retired.len(),
                "failed to reclaim retired pages"
            );
        }
    }

    /// A read-only view of the current version.
    ///
    /// The snapshot keeps working after later mutations and holds back the
    /// reclamation of every page retired while it is alive.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot<S> {
        Snapshot {
            store: Arc::clone(&self.store),
            root: self.root,
            guard: Arc::clone(&self.readers),
        }
    }

    /// An unpositioned cursor over the current version.
    #[must_use]
    pub fn cursor(&self) -> Cursor<S> {
        self.snapshot().cursor()
    }

    /// Iterate over the keys within `bounds` of the current version.
    pub fn range<K: AsRef<[u8]>>(&self, bounds: impl RangeBounds<K>) -> Range<S> {
        self.snapshot().range(bounds)
    }

    /// Iterate over every entry of the current version.
    #[must_use]
    pub fn iter(&self) -> Range<S> {
        self.snapshot().iter()
    }

    /// Walk the whole tree and check its structural invariants.
    pub fn verify(&self) -> Result<TreeStats, InvariantViolation> {
        verify(&*self.store, self.root)
    }
}

impl<S: PageStore> std::fmt::Debug for BTree<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("retired", &self.retired.len())
            .finish_non_exhaustive()
    }
}

/// A detached, read-only version of a tree.
pub struct Snapshot<S: PageStore> {
    store: Arc<S>,
    root: PageId,
    guard: Arc<()>,
}

impl<S: PageStore> Clone for Snapshot<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            root: self.root,
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<S: PageStore> Snapshot<S> {
    /// Root page of this version.
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.root
    }

    /// Look up the value stored for `key` in this version.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        lookup(&*self.store, self.root, key)
    }

    /// An unpositioned cursor over this version.
    #[must_use]
    pub fn cursor(&self) -> Cursor<S> {
        Cursor::new(Arc::clone(&self.store), self.root, Arc::clone(&self.guard))
    }

    /// Iterate over the keys within `bounds`.
    pub fn range<K: AsRef<[u8]>>(&self, bounds: impl RangeBounds<K>) -> Range<S> {
        let start = bounds.start_bound().map(|k| k.as_ref().to_vec());
        let end = bounds.end_bound().map(|k| k.as_ref().to_vec());
        Range::new(self.cursor(), self.cursor(), start, end)
    }

    /// Iterate over every entry.
    #[must_use]
    pub fn iter(&self) -> Range<S> {
        Range::new(
            self.cursor(),
            self.cursor(),
            std::ops::Bound::Unbounded,
            std::ops::Bound::Unbounded,
        )
    }
}

/// Point lookup from `root`.
fn lookup<S: PageStore + ?Sized>(
    store: &S,
    root: PageId,
    key: &[u8],
) -> Result<Option<Vec<u8>>, TreeError> {
    let mut id = root;
    loop {
        let page = load_page(store, id)?;
        let node = parse_node(&page, id)?;
        match node.kind() {
            NodeKind::Leaf => return Ok(find_exact(node, key).map(|i| node.value(i).to_vec())),
            NodeKind::Internal => id = node.child(seek_last_le(node, key)),
        }
    }
}

pub(crate) fn load_page<S: PageStore + ?Sized>(store: &S, id: PageId) -> Result<Page, TreeError> {
    Ok(store.dereference(id)?)
}

pub(crate) fn parse_node(page: &Page, id: PageId) -> Result<NodeRef<'_>, TreeError> {
    NodeRef::parse(page.as_bytes()).map_err(|error| TreeError::Node { page: id, error })
}

/// Bookkeeping for one in-flight mutation.
struct Mutation<'a, S: PageStore> {
    store: &'a S,
    merge_threshold: usize,
    /// Pages allocated by this mutation.
    fresh: Vec<PageId>,
    /// Pages that the new version no longer references.
    retired: Vec<PageId>,
}

impl<'a, S: PageStore> Mutation<'a, S> {
    const fn new(store: &'a S, merge_threshold: usize) -> Self {
        Self {
            store,
            merge_threshold,
            fresh: Vec::new(),
            retired: Vec::new(),
        }
    }

    fn load(&self, id: PageId) -> Result<Page, TreeError> {
        load_page(self.store, id)
    }

    fn publish(&mut self, node: &NodeBuf) -> Result<PageId, TreeError> {
        let id = self.store.allocate(node.encoded())?;
        self.fresh.push(id);
        Ok(id)
    }

    fn retire(&mut self, id: PageId) {
        self.retired.push(id);
    }

    /// Give back every page this mutation allocated.
    fn abort(self) {
        for id in self.fresh {
            if let Err(error) = self.store.free(id) {
                tracing::warn!(page = id, %error, "failed to free page of aborted mutation");
            }
        }
    }

    fn insert(
        &mut self,
        node: NodeRef<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(NodeBuf, Option<Vec<u8>>), TreeError> {
        if node.is_leaf() {
            return Ok(match leaf_slot(node, key) {
                LeafSlot::Existing(index) => (
                    leaf_update(node, index, key, value),
                    Some(node.value(index).to_vec()),
                ),
                LeafSlot::Vacant(index) => (leaf_insert(node, index, key, value), None),
            });
        }

        let index = seek_last_le(node, key);
        let child_id = node.child(index);
        let child_page = self.load(child_id)?;
        let child = parse_node(&child_page, child_id)?;
        let (updated, previous) = self.insert(child, key, value)?;
        self.retire(child_id);

        let parts = split_if_needed(updated);
        let rebuilt = replace_children(node, index, 1, &parts, |part| self.publish(part))?;
        Ok((rebuilt, previous))
    }

    fn delete(
        &mut self,
        node: NodeRef<'_>,
        key: &[u8],
    ) -> Result<Option<(NodeBuf, Vec<u8>)>, TreeError> {
        if node.is_leaf() {
            return Ok(find_exact(node, key)
                .map(|index| (leaf_delete(node, index), node.value(index).to_vec())));
        }

        let index = seek_last_le(node, key);
        let child_id = node.child(index);
        let child_page = self.load(child_id)?;
        let child = parse_node(&child_page, child_id)?;
        let Some((updated, removed)) = self.delete(child, key)? else {
            return Ok(None);
        };
        self.retire(child_id);

        let rebuilt = self.relink(node, index, updated)?;
        Ok(Some((rebuilt, removed)))
    }

    /// Put a child shrunk by a delete back into its parent, merging it into a
    /// sibling if it became underfull.
    fn relink(
        &mut self,
        node: NodeRef<'_>,
        index: u16,
        updated: NodeBuf,
    ) -> Result<NodeBuf, TreeError> {
        let underfull =
            updated.key_count() == 0 || updated.encoded_size() < self.merge_threshold;
        if underfull && updated.fits() {
            if index > 0 {
                let sibling_id = node.child(index - 1);
                let sibling_page = self.load(sibling_id)?;
                let sibling = parse_node(&sibling_page, sibling_id)?;
                if merged_size(sibling, updated.view()) <= PAGE_SIZE {
                    tracing::trace!(sibling = sibling_id, "merging into left sibling");
                    let merged = merge(sibling, updated.view());
                    self.retire(sibling_id);
                    return replace_children(node, index - 1, 2, &[merged], |part| {
                        self.publish(part)
                    });
                }
            }
            if index + 1 < node.key_count() {
                let sibling_id = node.child(index + 1);
                let sibling_page = self.load(sibling_id)?;
                let sibling = parse_node(&sibling_page, sibling_id)?;
                if merged_size(updated.view(), sibling) <= PAGE_SIZE {
                    tracing::trace!(sibling = sibling_id, "merging with right sibling");
                    let merged = merge(updated.view(), sibling);
                    self.retire(sibling_id);
                    return replace_children(node, index, 2, &[merged], |part| {
                        self.publish(part)
                    });
                }
            }
        }

        if updated.key_count() == 0 {
            // An empty child always merges into a sibling, so it was the only one.
            debug_assert_eq!(node.key_count(), 1);
            return Ok(NodeBuf::new(NodeKind::Internal, 0));
        }

        let parts = split_if_needed(updated);
        replace_children(node, index, 1, &parts, |part| self.publish(part))
    }

    /// Publish the top-level result of a mutation and return the new root id.
    fn install_root(&mut self, updated: NodeBuf) -> Result<PageId, TreeError> {
        if updated.key_count() == 0 {
            if updated.kind() == NodeKind::Internal {
                tracing::debug!("tree emptied, root reset to an empty leaf");
            }
            return self.publish(&NodeBuf::empty_leaf());
        }
        if updated.kind() == NodeKind::Internal && updated.key_count() == 1 {
            return self.collapse(updated.view().child(0));
        }

        let parts = split_if_needed(updated);
        if let [single] = parts.as_slice() {
            return self.publish(single);
        }
        tracing::debug!(children = parts.len(), "root split, tree grows by one level");
        let root = internal_from_children(&parts, |part| self.publish(part))?;
        self.publish(&root)
    }

    /// Descend through single-child internal nodes and return the first page
    /// that is a leaf or has several children.
    fn collapse(&mut self, mut id: PageId) -> Result<PageId, TreeError> {
        loop {
            let page = self.load(id)?;
            let node = parse_node(&page, id)?;
            if node.is_leaf() || node.key_count() > 1 {
                tracing::debug!(root = id, "root collapsed, tree shrinks");
                return Ok(id);
            }
            self.retire(id);
            id = node.child(0);
        }
    }
}

/// Errors that can occur during tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// The key exceeds the configured maximum.
    KeyTooLarge { size: usize, max: usize },
    /// The value exceeds the configured maximum.
    ValueTooLarge { size: usize, max: usize },
    /// The configuration is invalid.
    Config(ConfigError),
    /// The page store failed.
    Store(StoreError),
    /// A page does not hold a valid node.
    Node { page: PageId, error: NodeError },
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyTooLarge { size, max } => {
                write!(f, "key of {size} bytes exceeds the maximum of {max}")
            }
            Self::ValueTooLarge { size, max } => {
                write!(f, "value of {size} bytes exceeds the maximum of {max}")
            }
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Node { page, error } => write!(f, "corrupt node on page {page}: {error}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::KeyTooLarge { .. } | Self::ValueTooLarge { .. } => None,
            Self::Config(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Node { error, .. } => Some(error),
        }
    }
}

impl From<StoreError> for TreeError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::MAX_VALUE_SIZE;
    use crate::store::{FileStore, MemoryStore};
    use tempfile::tempdir;

    fn create_test_tree() -> BTree<MemoryStore> {
        BTree::create(Arc::new(MemoryStore::new()), TreeConfig::default()).expect("create tree")
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{i:06}").into_bytes()
    }

    fn entries(tree: &BTree<MemoryStore>) -> Vec<(Vec<u8>, Vec<u8>)> {
        tree.iter()
            .collect::<Result<Vec<_>, _>>()
            .expect("scan tree")
    }

    /// Every page the store holds must be reachable from the root.
    fn assert_no_leaks(tree: &BTree<MemoryStore>) -> TreeStats {
        let stats = tree.verify().expect("tree invariants hold");
        assert_eq!(tree.store().live_pages(), stats.pages());
        stats
    }

    #[test]
    fn test_empty_tree() {
        let tree = create_test_tree();
        assert_eq!(tree.get(b"missing").expect("get"), None);
        assert!(tree.is_empty().expect("is_empty"));
        assert_eq!(tree.count().expect("count"), 0);

        let stats = assert_no_leaks(&tree);
        assert_eq!(stats.height, 1);
        assert_eq!(stats.keys, 0);
    }

    #[test]
    fn test_small_tree_point_and_range_queries() {
        let mut tree = create_test_tree();
        tree.insert(&[1], b"a").expect("insert");
        tree.insert(&[5], b"b").expect("insert");
        tree.insert(&[3], b"c").expect("insert");

        assert_eq!(tree.get(&[3]).expect("get"), Some(b"c".to_vec()));

        let found = tree
            .range([1u8].as_slice()..=[5u8].as_slice())
            .collect::<Result<Vec<_>, _>>()
            .expect("range");
        assert_eq!(
            found,
            vec![
                (vec![1], b"a".to_vec()),
                (vec![3], b"c".to_vec()),
                (vec![5], b"b".to_vec()),
            ]
        );
        assert_eq!(tree.verify().expect("verify").height, 1);
    }

    #[test]
    fn test_insert_returns_previous_value() {
        let mut tree = create_test_tree();
        assert_eq!(tree.insert(b"k", b"v1").expect("insert"), None);
        assert_eq!(tree.insert(b"k", b"v2").expect("insert"), Some(b"v1".to_vec()));
        assert_eq!(tree.get(b"k").expect("get"), Some(b"v2".to_vec()));
        assert_eq!(tree.count().expect("count"), 1);
    }

    #[test]
    fn test_delete_returns_removed_value() {
        let mut tree = create_test_tree();
        tree.insert(b"k", b"v").expect("insert");
        assert_eq!(tree.delete(b"k").expect("delete"), Some(b"v".to_vec()));
        assert_eq!(tree.get(b"k").expect("get"), None);
        assert_eq!(tree.delete(b"k").expect("delete"), None);
    }

    #[test]
    fn test_delete_absent_key_is_noop() {
        let mut tree = create_test_tree();
        for i in 0..50 {
            tree.insert(&key(i), b"value").expect("insert");
        }
        let root = tree.root();
        let allocated = tree.store().allocated_count();

        assert_eq!(tree.delete(b"absent").expect("delete"), None);
        assert_eq!(tree.delete(b"absent").expect("delete"), None);
        assert_eq!(tree.root(), root);
        assert_eq!(tree.store().allocated_count(), allocated);
    }

    #[test]
    fn test_rejects_oversized_input_without_touching_pages() {
        let mut tree = create_test_tree();
        let allocated = tree.store().allocated_count();

        let big_key = vec![b'k'; 1001];
        assert!(matches!(
            tree.insert(&big_key, b"v"),
            Err(TreeError::KeyTooLarge { size: 1001, max: 1000 })
        ));
        let big_value = vec![b'v'; MAX_VALUE_SIZE + 1];
        assert!(matches!(
            tree.insert(b"k", &big_value),
            Err(TreeError::ValueTooLarge { size: 3001, max: 3000 })
        ));
        assert_eq!(tree.store().allocated_count(), allocated);
        assert!(tree.is_empty().expect("is_empty"));
    }

    #[test]
    fn test_maximal_records_are_accepted() {
        let mut tree = create_test_tree();
        for i in 0..6u8 {
            tree.insert(&[i; 1000], &[i; MAX_VALUE_SIZE]).expect("insert");
        }
        let stats = assert_no_leaks(&tree);
        assert_eq!(stats.keys, 6);
        assert_eq!(stats.leaf_pages, 6);
    }

    #[test]
    fn test_height_grows_then_shrinks_to_empty_leaf() {
        let mut tree = create_test_tree();
        // Each leaf holds a single record of this size.
        let value = vec![0xAB; 3000];

        let mut height = 1;
        for i in 0..400 {
            tree.insert(&key(i), &value).expect("insert");
            let stats = assert_no_leaks(&tree);
            assert!(stats.height == height || stats.height == height + 1);
            height = stats.height;
        }
        assert_eq!(height, 3);

        for i in 0..400 {
            assert!(tree.delete(&key(i)).expect("delete").is_some());
            let stats = assert_no_leaks(&tree);
            assert!(stats.height <= height);
            height = stats.height;
        }

        let stats = assert_no_leaks(&tree);
        assert_eq!(stats.height, 1);
        assert_eq!(stats.pages(), 1);
        assert!(tree.is_empty().expect("is_empty"));
    }

    #[test]
    fn test_descending_inserts_update_routing_keys() {
        let mut tree = create_test_tree();
        let value = vec![7u8; 500];
        for i in (0..300).rev() {
            tree.insert(&key(i), &value).expect("insert");
            tree.verify().expect("verify");
        }
        let keys: Vec<_> = entries(&tree).into_iter().map(|(k, _)| k).collect();
        let expected: Vec<_> = (0..300).map(key).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_deletes_merge_nodes() {
        let mut tree = create_test_tree();
        let value = vec![1u8; 200];
        for i in 0..1000 {
            tree.insert(&key(i), &value).expect("insert");
        }
        let full = assert_no_leaks(&tree);

        for i in (0..1000).filter(|i| i % 10 != 0) {
            tree.delete(&key(i)).expect("delete");
        }
        let sparse = assert_no_leaks(&tree);
        assert_eq!(sparse.keys, 100);
        assert!(sparse.leaf_pages < full.leaf_pages / 4);
        for i in 0..1000 {
            let expected = (i % 10 == 0).then(|| value.clone());
            assert_eq!(tree.get(&key(i)).expect("get"), expected);
        }
    }

    #[test]
    fn test_growing_first_key_splits_parent_on_delete() {
        let mut tree = create_test_tree();
        // Short keys fill the root with many routing records; deleting a
        // short first key exposes a long one that replaces it.
        for i in 0..200u32 {
            let mut long = key(i);
            long.extend_from_slice(&[b'x'; 900]);
            tree.insert(&key(i), &[0u8; 1000]).expect("insert");
            tree.insert(&long, &[0u8; 1000]).expect("insert");
        }
        for i in 0..200u32 {
            tree.delete(&key(i)).expect("delete");
            tree.verify().expect("verify");
        }
        assert_eq!(tree.count().expect("count"), 200);
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut tree = create_test_tree();
        for i in 0..100 {
            tree.insert(&key(i), b"old").expect("insert");
        }
        let snapshot = tree.snapshot();
        let mut cursor = tree.cursor();
        assert!(cursor.seek_first().expect("seek"));

        for i in 0..100 {
            if i % 2 == 0 {
                tree.delete(&key(i)).expect("delete");
            } else {
                tree.insert(&key(i), b"new").expect("insert");
            }
        }
        for i in 100..150 {
            tree.insert(&key(i), b"new").expect("insert");
        }

        // Old pages are held back while readers exist
        assert!(tree.retired_pages() > 0);
        assert_eq!(tree.reclaim().expect("reclaim"), 0);

        let mut seen = 0;
        while cursor.is_valid() {
            assert_eq!(cursor.key(), Some(key(seen).as_slice()));
            assert_eq!(cursor.value(), Some(b"old".as_slice()));
            seen += 1;
            cursor.next().expect("next");
        }
        assert_eq!(seen, 100);

        let old: Vec<_> = snapshot
            .iter()
            .collect::<Result<Vec<_>, _>>()
            .expect("scan snapshot");
        assert_eq!(old.len(), 100);
        assert_eq!(snapshot.get(&key(0)).expect("get"), Some(b"old".to_vec()));
        assert_eq!(tree.get(&key(0)).expect("get"), None);

        drop(cursor);
        drop(snapshot);
        assert!(tree.reclaim().expect("reclaim") > 0);
        assert_eq!(tree.retired_pages(), 0);
        assert_no_leaks(&tree);
    }

    #[test]
    fn test_snapshot_readable_from_another_thread() {
        let mut tree = create_test_tree();
        for i in 0..200 {
            tree.insert(&key(i), b"v").expect("insert");
        }
        let snapshot = tree.snapshot();
        let reader = std::thread::spawn(move || snapshot.iter().count());
        for i in 0..200 {
            tree.delete(&key(i)).expect("delete");
        }
        assert_eq!(reader.join().expect("reader thread"), 200);
    }

    #[test]
    fn test_full_scan_order_and_reverse() {
        let mut tree = create_test_tree();
        for i in [5, 1, 9, 3, 7, 0, 8, 2, 6, 4] {
            tree.insert(&key(i), &key(i)).expect("insert");
        }
        let forward: Vec<_> = entries(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(forward, (0..10).map(key).collect::<Vec<_>>());

        let backward: Vec<_> = tree
            .iter()
            .rev()
            .map(|entry| entry.expect("entry").0)
            .collect();
        assert_eq!(backward, (0..10).rev().map(key).collect::<Vec<_>>());
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let store = Arc::new(MemoryStore::new());
        let config = TreeConfig {
            max_key_size: 2000,
            ..TreeConfig::default()
        };
        assert!(matches!(
            BTree::create(store, config),
            Err(TreeError::Config(_))
        ));
    }

    #[test]
    fn test_open_rejects_corrupt_root() {
        let store = Arc::new(MemoryStore::new());
        let garbage = store.allocate(&[0xFF; 16]).expect("allocate");
        assert!(matches!(
            BTree::open(store, garbage, TreeConfig::default()),
            Err(TreeError::Node { .. })
        ));
    }

    #[test]
    fn test_file_store_tree_survives_reopen() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.db");

        let root = {
            let store = Arc::new(FileStore::create(&path).expect("create store"));
            let mut tree = BTree::create(store, TreeConfig::default()).expect("create tree");
            for i in 0..300 {
                tree.insert(&key(i), &vec![3u8; 100]).expect("insert");
            }
            for i in 0..100 {
                tree.delete(&key(i)).expect("delete");
            }
            let stats = tree.verify().expect("verify");
            let live = tree.store().live_pages().expect("live pages");
            assert_eq!(live, stats.pages() as u64);
            tree.store().sync().expect("sync");
            tree.root()
        };

        let store = Arc::new(FileStore::open(&path).expect("open store"));
        let tree = BTree::open(store, root, TreeConfig::default()).expect("open tree");
        assert_eq!(tree.count().expect("count"), 200);
        assert_eq!(tree.get(&key(0)).expect("get"), None);
        assert_eq!(tree.get(&key(150)).expect("get"), Some(vec![3u8; 100]));
    }
}
