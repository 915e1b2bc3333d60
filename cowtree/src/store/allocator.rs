//! Slot allocator using a bitmap to track free/used pages.
//!
//! Each bit represents one page slot of a [`FileStore`](super::FileStore):
//! 0 = free, 1 = used. The bitmap lives only in memory; the store rebuilds it
//! from slot headers when a file is opened.

// Page IDs are u64 but bitmap indices are usize. On 64-bit systems these are the same size.
#![allow(clippy::cast_possible_truncation)]

use crate::page::PageId;

/// Number of bits per byte.
const BITS_PER_BYTE: usize = 8;

/// Number of slots added each time the allocator runs out of free slots.
pub const GROWTH_STEP: u64 = 64;

/// A page slot allocation bitmap.
#[derive(Debug, Default)]
pub struct PageAllocator {
    /// The bitmap data.
    bitmap: Vec<u8>,
    /// Total number of slots being tracked.
    total_pages: u64,
    /// Number of free slots.
    free_count: u64,
    /// Hint for next free slot search.
    next_search_hint: u64,
}

impl PageAllocator {
    /// Create an allocator with `total_pages` free slots.
    #[must_use]
    pub fn new(total_pages: u64) -> Self {
        let bitmap_bytes = (total_pages as usize).div_ceil(BITS_PER_BYTE);
        Self {
            bitmap: vec![0u8; bitmap_bytes],
            total_pages,
            free_count: total_pages,
            next_search_hint: 0,
        }
    }

    /// Rebuild an allocator from per-slot usage flags.
    #[must_use]
    pub fn from_usage(used: &[bool]) -> Self {
        let mut allocator = Self::new(used.len() as u64);
        for (page_id, _) in (0u64..).zip(used).filter(|(_, used)| **used) {
            set_bit(&mut allocator.bitmap, page_id as usize);
            allocator.free_count -= 1;
        }
        allocator.next_search_hint = (0..allocator.total_pages)
            .find(|&p| !get_bit(&allocator.bitmap, p as usize))
            .unwrap_or(allocator.total_pages);
        allocator
    }

    /// Allocate a single free slot, growing the bitmap if every slot is used.
    pub fn allocate(&mut self) -> PageId {
        if self.free_count == 0 {
            self.expand(self.total_pages + GROWTH_STEP);
        }

        // Search from hint, then wrap around
        let candidates = (self.next_search_hint..self.total_pages).chain(0..self.next_search_hint);
        for page_id in candidates {
            if !get_bit(&self.bitmap, page_id as usize) {
                set_bit(&mut self.bitmap, page_id as usize);
                self.free_count -= 1;
                self.next_search_hint = page_id + 1;
                return page_id;
            }
        }

        unreachable!("free_count is positive but no free slot was found")
    }

    /// Free a previously allocated slot.
    ///
    /// Returns `false` if the slot was not allocated.
    pub fn free(&mut self, page_id: PageId) -> bool {
        if !self.is_allocated(page_id) {
            return false;
        }

        clear_bit(&mut self.bitmap, page_id as usize);
        self.free_count += 1;
        if page_id < self.next_search_hint {
            self.next_search_hint = page_id;
        }
        true
    }

    /// Check if a slot is allocated.
    #[must_use]
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        if page_id >= self.total_pages {
            return false;
        }
        get_bit(&self.bitmap, page_id as usize)
    }

    /// Get the number of free slots.
    #[must_use]
    pub const fn free_count(&self) -> u64 {
        self.free_count
    }

    /// Get the number of used slots.
    #[must_use]
    pub const fn used_count(&self) -> u64 {
        self.total_pages - self.free_count
    }

    /// Get the total number of slots being tracked.
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// Expand the allocator to track more slots. The new slots are free.
    pub fn expand(&mut self, new_total_pages: u64) {
        if new_total_pages <= self.total_pages {
            return;
        }

        let new_bitmap_bytes = (new_total_pages as usize).div_ceil(BITS_PER_BYTE);
        self.bitmap.resize(new_bitmap_bytes, 0);
        self.free_count += new_total_pages - self.total_pages;
        self.total_pages = new_total_pages;
    }
}

/// Get a bit from the bitmap.
fn get_bit(bitmap: &[u8], index: usize) -> bool {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index >= bitmap.len() {
        return false;
    }

    (bitmap[byte_index] & (1 << bit_index)) != 0
}

/// Set a bit in the bitmap (mark as used).
fn set_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] |= 1 << bit_index;
    }
}

/// Clear a bit in the bitmap (mark as free).
fn clear_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] &= !(1 << bit_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_reuses_hole() {
        let mut alloc = PageAllocator::new(10);

        let page1 = alloc.allocate();
        let page2 = alloc.allocate();
        let page3 = alloc.allocate();
        assert_eq!((page1, page2, page3), (0, 1, 2));

        assert!(alloc.free(page2));
        assert!(!alloc.is_allocated(page2));
        assert!(alloc.is_allocated(page3));

        // Next allocation should reuse page2
        assert_eq!(alloc.allocate(), page2);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut alloc = PageAllocator::new(4);
        let page = alloc.allocate();
        assert!(alloc.free(page));
        assert!(!alloc.free(page));
        assert!(!alloc.free(100));
        assert_eq!(alloc.free_count(), 4);
    }

    #[test]
    fn test_grows_when_exhausted() {
        let mut alloc = PageAllocator::default();
        assert_eq!(alloc.total_pages(), 0);

        let first = alloc.allocate();
        assert_eq!(first, 0);
        assert_eq!(alloc.total_pages(), GROWTH_STEP);

        for _ in 1..GROWTH_STEP {
            alloc.allocate();
        }
        assert_eq!(alloc.free_count(), 0);
        assert_eq!(alloc.allocate(), GROWTH_STEP);
        assert_eq!(alloc.total_pages(), 2 * GROWTH_STEP);
    }

    #[test]
    fn test_from_usage() {
        let alloc = PageAllocator::from_usage(&[true, false, true, true, false]);
        assert_eq!(alloc.total_pages(), 5);
        assert_eq!(alloc.used_count(), 3);
        assert!(alloc.is_allocated(0));
        assert!(!alloc.is_allocated(1));

        let mut alloc = alloc;
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 4);
    }

    #[test]
    fn test_expand() {
        let mut alloc = PageAllocator::new(100);
        alloc.expand(200);
        assert_eq!(alloc.total_pages(), 200);
        assert_eq!(alloc.free_count(), 200);
        alloc.expand(50);
        assert_eq!(alloc.total_pages(), 200);
    }

    #[test]
    fn test_bit_operations() {
        let mut bitmap = vec![0u8; 10];

        assert!(!get_bit(&bitmap, 0));
        assert!(!get_bit(&bitmap, 79));

        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 8);
        set_bit(&mut bitmap, 79);
        assert!(get_bit(&bitmap, 0));
        assert!(get_bit(&bitmap, 8));
        assert!(get_bit(&bitmap, 79));

        clear_bit(&mut bitmap, 8);
        assert!(!get_bit(&bitmap, 8));
        assert!(get_bit(&bitmap, 0)); // Others unchanged
    }
}
