//! In-memory page store.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::page::{Page, PageId};
use crate::store::{PageStore, StoreError};

/// A page store backed by a hash map.
///
/// Ids are handed out sequentially starting at 1 and never reused, which makes
/// use-after-free bugs in the tree show up as [`StoreError::UnknownPage`].
///
/// # Thread Safety
///
/// Reads take a shared lock, so any number of readers may dereference pages
/// concurrently with each other.
#[derive(Debug)]
pub struct MemoryStore {
    pages: RwLock<HashMap<PageId, Page>>,
    next_id: AtomicU64,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    /// Number of pages currently allocated and not freed.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.pages.read().map_or(0, |pages| pages.len())
    }

    /// Total number of `allocate` calls that succeeded.
    #[must_use]
    pub fn allocated_count(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Total number of `free` calls that succeeded.
    #[must_use]
    pub fn freed_count(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    /// Whether `id` names a live page.
    #[must_use]
    pub fn contains(&self, id: PageId) -> bool {
        self.pages
            .read()
            .is_ok_and(|pages| pages.contains_key(&id))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A poisoned lock means a writer panicked mid-update.
fn poisoned() -> StoreError {
    StoreError::Corruption("page map lock poisoned".to_string())
}

impl PageStore for MemoryStore {
    fn dereference(&self, id: PageId) -> Result<Page, StoreError> {
        let pages = self.pages.read().map_err(|_| poisoned())?;
        pages.get(&id).cloned().ok_or(StoreError::UnknownPage(id))
    }

    fn allocate(&self, bytes: &[u8]) -> Result<PageId, StoreError> {
        let page = Page::from_bytes(bytes)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pages.write().map_err(|_| poisoned())?.insert(id, page);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn free(&self, id: PageId) -> Result<(), StoreError> {
        self.pages
            .write()
            .map_err(|_| poisoned())?
            .remove(&id)
            .ok_or(StoreError::UnknownPage(id))?;
        self.freed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
