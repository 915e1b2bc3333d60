//! Page store abstraction.
//!
//! The tree never owns page bytes. It asks a [`PageStore`] to dereference,
//! allocate, and free pages by id. This keeps the tree independent of where
//! pages live and lets tests inject faults at the store boundary.
//!
//! # Design
//!
//! All methods take `&self`. A tree shares its store with every snapshot and
//! cursor through an `Arc`, so implementations use interior mutability for
//! their bookkeeping. The tree guarantees:
//! - `allocate` and `free` are only called by one mutator at a time
//! - `free` is never called for a page a live root or reader can still reach
//!
//! Implementations must ensure:
//! - `dereference` returns exactly the bytes passed to `allocate`, zero padded
//!   to `PAGE_SIZE`
//! - `dereference` of a freed or never allocated id fails with
//!   [`StoreError::UnknownPage`]

mod allocator;
mod file;
mod memory;

pub use allocator::PageAllocator;
pub use file::{FileStore, SLOT_HEADER_SIZE, SLOT_SIZE};
pub use memory::MemoryStore;

use crate::page::{Page, PageError, PageId};

/// Storage for fixed-size pages addressed by id.
pub trait PageStore {
    /// Read a published page.
    fn dereference(&self, id: PageId) -> Result<Page, StoreError>;

    /// Store up to `PAGE_SIZE` bytes in a fresh page and return its id.
    fn allocate(&self, bytes: &[u8]) -> Result<PageId, StoreError>;

    /// Mark a page reclaimable.
    fn free(&self, id: PageId) -> Result<(), StoreError>;
}

impl<S: PageStore + ?Sized> PageStore for std::sync::Arc<S> {
    fn dereference(&self, id: PageId) -> Result<Page, StoreError> {
        (**self).dereference(id)
    }

    fn allocate(&self, bytes: &[u8]) -> Result<PageId, StoreError> {
        (**self).allocate(bytes)
    }

    fn free(&self, id: PageId) -> Result<(), StoreError> {
        (**self).free(id)
    }
}

/// Errors that can occur during page store operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// The id does not name a live page.
    UnknownPage(PageId),
    /// Page content rejected.
    Page(PageError),
    /// Checksum or header mismatch on read.
    Corruption(String),
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::UnknownPage(id) => write!(f, "unknown page {id}"),
            Self::Page(e) => write!(f, "page error: {e}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PageError> for StoreError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let e = StoreError::UnknownPage(42);
        assert_eq!(e.to_string(), "unknown page 42");

        let e = StoreError::InjectedFault("allocate".to_string());
        assert!(e.to_string().contains("allocate"));

        let e = StoreError::from(PageError::TooLarge(5000));
        assert!(e.to_string().contains("5000"));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_arc_store_forwards() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let id = store.allocate(b"abc").expect("allocate");
        let page = PageStore::dereference(&store, id).expect("dereference");
        assert_eq!(&page.as_bytes()[..3], b"abc");
        store.free(id).expect("free");
        assert!(matches!(
            store.dereference(id),
            Err(StoreError::UnknownPage(_))
        ));
    }
}
