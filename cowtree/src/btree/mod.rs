//! Copy-on-write B+tree over fixed-size pages.
//!
//! # Structure
//!
//! - [`node`]: the binary page layout, read through [`NodeRef`] and built in
//!   [`NodeBuf`] scratch buffers
//! - [`builder`] and [`split`]: construct replacement nodes from old ones
//! - [`lookup`]: key search within one node
//! - [`BTree`]: the tree handle and the recursive update algorithm
//! - [`Cursor`], [`Range`] and [`Snapshot`]: detached readers
//! - [`verify()`]: structural invariant checks
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use cowtree::btree::BTree;
//! use cowtree::config::TreeConfig;
//! use cowtree::store::MemoryStore;
//!
//! let mut tree = BTree::create(Arc::new(MemoryStore::new()), TreeConfig::default()).unwrap();
//! tree.insert(b"apple", b"red").unwrap();
//! tree.insert(b"banana", b"yellow").unwrap();
//!
//! let before = tree.snapshot();
//! tree.delete(b"apple").unwrap();
//!
//! assert_eq!(tree.get(b"apple").unwrap(), None);
//! assert_eq!(before.get(b"apple").unwrap(), Some(b"red".to_vec()));
//! ```

pub mod builder;
mod cursor;
pub mod lookup;
pub mod node;
pub mod split;
mod tree;
mod verify;

pub use cursor::{Cursor, Range};
pub use node::{MAX_KEY_SIZE, MAX_VALUE_SIZE, NodeBuf, NodeError, NodeKind, NodeRef};
pub use tree::{BTree, Snapshot, TreeError};
pub use verify::{InvariantViolation, TreeStats, verify};
