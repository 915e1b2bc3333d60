//! A copy-on-write B+tree over fixed-size pages.
//!
//! Published pages are immutable. Every write builds new pages along one
//! root-to-leaf path and installs a new root, so earlier versions stay
//! readable for as long as someone holds them.
//!
//! Components, leaf first:
//!  - `page`: fixed-size page buffers
//!  - `store`: the page store interface with in-memory and file backends
//!  - `btree`: node layout, copy-on-write construction, the tree and its readers
//!  - `config`: tree limits and merge policy
//!  - `simulation`: seeded random workloads with fault injection

pub mod btree;
pub mod config;
pub mod page;
pub mod simulation;
pub mod store;

pub use btree::{BTree, Cursor, Range, Snapshot, TreeError, TreeStats};
pub use config::TreeConfig;
pub use store::{FileStore, MemoryStore, PageStore};
