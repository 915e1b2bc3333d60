//! Structural invariant checks.
//!
//! [`verify`] walks every page reachable from a root and checks that:
//! - all leaves are at the same depth
//! - every node fits in a page
//! - every node except a leaf root holds at least one key
//! - an internal root has more than one child
//! - keys are strictly increasing within a node and below the parent's next
//!   routing key
//! - each routing key equals the first key of its child
//! - no page is reachable twice

use std::collections::HashSet;

use crate::btree::tree::{TreeError, load_page, parse_node};
use crate::page::{PAGE_SIZE, PageId};
use crate::store::PageStore;

/// Shape of a verified tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels; a lone leaf root has height 1.
    pub height: usize,
    pub leaf_pages: usize,
    pub internal_pages: usize,
    /// Number of key-value pairs stored in leaves.
    pub keys: usize,
}

impl TreeStats {
    /// Number of pages reachable from the root.
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.leaf_pages + self.internal_pages
    }
}

/// A broken invariant, naming the page where it was found.
#[derive(Debug)]
pub enum InvariantViolation {
    /// A page could not be read or parsed.
    Unreadable(TreeError),
    UnevenDepth {
        page: PageId,
        depth: usize,
        expected: usize,
    },
    Oversized {
        page: PageId,
        size: usize,
    },
    EmptyNode {
        page: PageId,
    },
    SingleChildRoot {
        page: PageId,
    },
    KeysOutOfOrder {
        page: PageId,
        index: u16,
    },
    /// A key is not below the routing key of the next sibling.
    KeyOutOfBounds {
        page: PageId,
        index: u16,
    },
    RoutingKeyMismatch {
        page: PageId,
        index: u16,
    },
    /// The same page is linked from two places.
    SharedPage {
        page: PageId,
    },
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreadable(e) => write!(f, "unreadable page: {e}"),
            Self::UnevenDepth {
                page,
                depth,
                expected,
            } => write!(
                f,
                "leaf {page} is at depth {depth}, other leaves are at depth {expected}"
            ),
            Self::Oversized { page, size } => {
                write!(f, "page {page} encodes to {size} bytes, more than {PAGE_SIZE}")
            }
            Self::EmptyNode { page } => write!(f, "non-root page {page} has no keys"),
            Self::SingleChildRoot { page } => {
                write!(f, "internal root {page} has a single child")
            }
            Self::KeysOutOfOrder { page, index } => {
                write!(f, "page {page}: key {index} is not greater than its predecessor")
            }
            Self::KeyOutOfBounds { page, index } => {
                write!(f, "page {page}: key {index} reaches into the next sibling")
            }
            Self::RoutingKeyMismatch { page, index } => write!(
                f,
                "page {page}: routing key {index} differs from its child's first key"
            ),
            Self::SharedPage { page } => write!(f, "page {page} is reachable twice"),
        }
    }
}

impl std::error::Error for InvariantViolation {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unreadable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TreeError> for InvariantViolation {
    fn from(e: TreeError) -> Self {
        Self::Unreadable(e)
    }
}

/// Check every invariant of the tree rooted at `root`.
pub fn verify<S: PageStore + ?Sized>(
    store: &S,
    root: PageId,
) -> Result<TreeStats, InvariantViolation> {
    let mut walker = Walker {
        store,
        seen: HashSet::new(),
        leaf_depth: None,
        stats: TreeStats::default(),
    };
    walker.visit(root, 0, None)?;
    walker.stats.height = walker.leaf_depth.map_or(1, |depth| depth + 1);
    Ok(walker.stats)
}

struct Walker<'a, S: ?Sized> {
    store: &'a S,
    seen: HashSet<PageId>,
    leaf_depth: Option<usize>,
    stats: TreeStats,
}

impl<S: PageStore + ?Sized> Walker<'_, S> {
    /// Check the subtree at `id` and return its first key.
    fn visit(
        &mut self,
        id: PageId,
        depth: usize,
        upper: Option<&[u8]>,
    ) -> Result<Vec<u8>, InvariantViolation> {
        if !self.seen.insert(id) {
            return Err(InvariantViolation::SharedPage { page: id });
        }
        let page = load_page(self.store, id)?;
        let node = parse_node(&page, id)?;
        let count = node.key_count();
        let is_root = depth == 0;

        let size = node.encoded_size();
        if size > PAGE_SIZE {
            return Err(InvariantViolation::Oversized { page: id, size });
        }
        if count == 0 && !(is_root && node.is_leaf()) {
            return Err(InvariantViolation::EmptyNode { page: id });
        }
        if is_root && !node.is_leaf() && count == 1 {
            return Err(InvariantViolation::SingleChildRoot { page: id });
        }
        for index in 1..count {
            if node.key(index - 1) >= node.key(index) {
                return Err(InvariantViolation::KeysOutOfOrder { page: id, index });
            }
        }
        if let Some(upper) = upper {
            if count > 0 && node.key(count - 1) >= upper {
                return Err(InvariantViolation::KeyOutOfBounds {
                    page: id,
                    index: count - 1,
                });
            }
        }

        if node.is_leaf() {
            match self.leaf_depth {
                Some(expected) if expected != depth => {
                    return Err(InvariantViolation::UnevenDepth {
                        page: id,
                        depth,
                        expected,
                    });
                }
                Some(_) => {}
                None => self.leaf_depth = Some(depth),
            }
            self.stats.leaf_pages += 1;
            self.stats.keys += usize::from(count);
        } else {
            self.stats.internal_pages += 1;
            for index in 0..count {
                let child_upper = if index + 1 < count {
                    Some(node.key(index + 1))
                } else {
                    upper
                };
                let first = self.visit(node.child(index), depth + 1, child_upper)?;
                if first != node.key(index) {
                    return Err(InvariantViolation::RoutingKeyMismatch { page: id, index });
                }
            }
        }

        Ok(node.first_key().unwrap_or_default().to_vec())
    }
}
