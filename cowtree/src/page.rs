//! Page types and constants for the tree.
//!
//! Every tree node lives in exactly one fixed-size page. Pages handed out by a
//! [`PageStore`](crate::store::PageStore) are published: they are shared and
//! read-only for the rest of their life.

use std::sync::Arc;

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page identifier assigned by the page store.
pub type PageId = u64;

/// A published page.
///
/// Cloning is cheap (reference counted). There is no way to obtain a mutable
/// view of the bytes; new content is always built in a
/// [`NodeBuf`](crate::btree::NodeBuf) and handed to the store.
///
/// # Invariants
/// - The buffer is exactly `PAGE_SIZE` bytes long.
#[derive(Clone)]
pub struct Page {
    data: Arc<[u8]>,
}

impl Page {
    /// Create a zeroed page.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            data: Arc::from(vec![0u8; PAGE_SIZE]),
        }
    }

    /// Create a page from up to `PAGE_SIZE` bytes, padding the tail with zeros.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PageError> {
        if bytes.len() > PAGE_SIZE {
            return Err(PageError::TooLarge(bytes.len()));
        }
        let mut data = vec![0u8; PAGE_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            data: Arc::from(data),
        })
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Compute the CRC32 checksum of the page data.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("first_16_bytes", &&self.data[..16])
            .finish_non_exhaustive()
    }
}

/// Read a little-endian u16 at the given offset.
#[must_use]
pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Read a little-endian u64 at the given offset.
#[must_use]
pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Write a little-endian u16 at the given offset.
pub fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Write a little-endian u64 at the given offset.
pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Errors related to page construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// More bytes than fit in one page.
    TooLarge(usize),
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge(len) => {
                write!(f, "page content too large: {len} bytes (max {PAGE_SIZE})")
            }
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_from_bytes_pads() {
        let page = Page::from_bytes(b"hello").expect("should fit");
        assert_eq!(page.as_bytes().len(), PAGE_SIZE);
        assert_eq!(&page.as_bytes()[..5], b"hello");
        assert!(page.as_bytes()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_from_bytes_too_large() {
        let bytes = vec![1u8; PAGE_SIZE + 1];
        assert_eq!(
            Page::from_bytes(&bytes).map(|_| ()),
            Err(PageError::TooLarge(PAGE_SIZE + 1))
        );
    }

    #[test]
    fn test_integer_helpers() {
        let mut buf = [0u8; 16];
        write_u16(&mut buf, 2, 0xBEEF);
        write_u64(&mut buf, 8, 0x0102_0304_0506_0708);
        assert_eq!(read_u16(&buf, 2), 0xBEEF);
        assert_eq!(read_u64(&buf, 8), 0x0102_0304_0506_0708);
        assert_eq!(buf[2], 0xEF);
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let a = Page::from_bytes(b"a").expect("fits");
        let b = Page::from_bytes(b"b").expect("fits");
        assert_ne!(a.compute_checksum(), b.compute_checksum());
        assert_eq!(a.compute_checksum(), a.clone().compute_checksum());
    }
}
