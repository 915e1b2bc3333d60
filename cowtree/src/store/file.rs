//! Single-file page store.
//!
//! The file is an array of slots, one page each:
//!
//! ```text
//! slot i at byte i * SLOT_SIZE:
//!   u8  state      (0 = free, 1 = live)
//!   [3] reserved
//!   u32 crc32      (of the PAGE_SIZE page bytes)
//!   [PAGE_SIZE] page
//! ```
//!
//! The allocation bitmap is not persisted; [`FileStore::open`] rebuilds it from
//! the slot states. This store provides no durability guarantees beyond what
//! [`FileStore::sync`] offers: there is no write-ahead log and the tree root is
//! not recorded in the file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::page::{PAGE_SIZE, Page, PageId};
use crate::store::{PageAllocator, PageStore, StoreError};

/// Size of the per-slot header.
pub const SLOT_HEADER_SIZE: usize = 8;

/// Size of one slot on disk.
pub const SLOT_SIZE: usize = SLOT_HEADER_SIZE + PAGE_SIZE;

const SLOT_SIZE_U64: u64 = SLOT_SIZE as u64;

const STATE_FREE: u8 = 0;
const STATE_LIVE: u8 = 1;

/// A page store backed by one file.
pub struct FileStore {
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: File,
    allocator: PageAllocator,
}

impl FileStore {
    /// Create a new, empty store file.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        tracing::debug!(path = %path.display(), "created page file");
        Ok(Self {
            inner: Mutex::new(FileInner {
                file,
                allocator: PageAllocator::default(),
            }),
        })
    }

    /// Open an existing store file and rebuild its allocation bitmap.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len % SLOT_SIZE_U64 != 0 {
            return Err(StoreError::Corruption(format!(
                "file length {len} is not a multiple of the slot size {SLOT_SIZE}"
            )));
        }

        let slots = len / SLOT_SIZE_U64;
        let mut used = Vec::with_capacity(usize::try_from(slots).unwrap_or(0));
        let mut header = [0u8; SLOT_HEADER_SIZE];
        for slot in 0..slots {
            file.seek(SeekFrom::Start(slot * SLOT_SIZE_U64))?;
            file.read_exact(&mut header)?;
            match header[0] {
                STATE_FREE => used.push(false),
                STATE_LIVE => used.push(true),
                state => {
                    return Err(StoreError::Corruption(format!(
                        "slot {slot} has invalid state {state}"
                    )));
                }
            }
        }

        let allocator = PageAllocator::from_usage(&used);
        tracing::debug!(
            path = %path.display(),
            slots,
            live = allocator.used_count(),
            "opened page file"
        );
        Ok(Self {
            inner: Mutex::new(FileInner { file, allocator }),
        })
    }

    /// Flush written pages to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        let inner = self.lock()?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Number of live pages.
    pub fn live_pages(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.allocator.used_count())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, FileInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Corruption("page file lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").finish_non_exhaustive()
    }
}

impl FileInner {
    fn write_slot(&mut self, id: PageId, page: &Page) -> Result<(), StoreError> {
        let mut header = [0u8; SLOT_HEADER_SIZE];
        header[0] = STATE_LIVE;
        header[4..8].copy_from_slice(&page.compute_checksum().to_le_bytes());

        self.file.seek(SeekFrom::Start(id * SLOT_SIZE_U64))?;
        self.file.write_all(&header)?;
        self.file.write_all(page.as_bytes())?;
        Ok(())
    }
}

impl PageStore for FileStore {
    fn dereference(&self, id: PageId) -> Result<Page, StoreError> {
        let mut inner = self.lock()?;
        if !inner.allocator.is_allocated(id) {
            return Err(StoreError::UnknownPage(id));
        }

        let mut slot = vec![0u8; SLOT_SIZE];
        inner.file.seek(SeekFrom::Start(id * SLOT_SIZE_U64))?;
        inner.file.read_exact(&mut slot)?;

        if slot[0] != STATE_LIVE {
            return Err(StoreError::Corruption(format!(
                "page {id} is allocated but its slot is marked free"
            )));
        }
        let expected = u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]);
        let page = Page::from_bytes(&slot[SLOT_HEADER_SIZE..])?;
        let actual = page.compute_checksum();
        if expected != actual {
            return Err(StoreError::Corruption(format!(
                "page {id} checksum mismatch: expected {expected:08x}, got {actual:08x}"
            )));
        }
        Ok(page)
    }

    fn allocate(&self, bytes: &[u8]) -> Result<PageId, StoreError> {
        let page = Page::from_bytes(bytes)?;
        let mut inner = self.lock()?;
        let id = inner.allocator.allocate();
        if let Err(e) = inner.write_slot(id, &page) {
            inner.allocator.free(id);
            return Err(e);
        }
        Ok(id)
    }

    fn free(&self, id: PageId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if !inner.allocator.is_allocated(id) {
            return Err(StoreError::UnknownPage(id));
        }
        inner.file.seek(SeekFrom::Start(id * SLOT_SIZE_U64))?;
        inner.file.write_all(&[STATE_FREE])?;
        inner.allocator.free(id);
        Ok(())
    }
}
