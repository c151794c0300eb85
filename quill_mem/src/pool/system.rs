//! Oversized allocations.
//!
//! Requests above the largest pool width (or every request when pooling
//! is disabled) go straight to the system allocator. The bucket records
//! each block so sizes can be checked on free and stragglers released on
//! drop; there is no free-list reuse.

use super::segment::UNIT_ALIGN;
use rustc_hash::FxHashMap;
use std::alloc::Layout;
use std::ptr::NonNull;

/// Accounting bucket for direct system allocations.
pub(crate) struct SystemBucket {
    /// Map from block address to its size.
    blocks: FxHashMap<usize, usize>,
    /// Total bytes outstanding.
    bytes: usize,
}

impl SystemBucket {
    /// Create an empty bucket.
    pub fn new() -> Self {
        Self {
            blocks: FxHashMap::default(),
            bytes: 0,
        }
    }

    /// Allocate `size` bytes from the system.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, UNIT_ALIGN).ok()?;
        self.blocks.try_reserve(1).ok()?;
        // SAFETY: callers reject zero sizes before reaching the bucket.
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;

        self.blocks.insert(ptr.as_ptr() as usize, size);
        self.bytes += size;

        tracing::trace!(target: "quill_mem::pool", size, "system allocation");
        Some(ptr)
    }

    /// Release a block, checking it was allocated here with `size`.
    ///
    /// Returns false if the block is unknown or the size disagrees;
    /// nothing is released in that case.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after a successful free.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) -> bool {
        let addr = ptr.as_ptr() as usize;
        match self.blocks.get(&addr) {
            Some(&recorded) if recorded == size => {}
            _ => return false,
        }
        self.blocks.remove(&addr);
        self.bytes -= size;
        std::alloc::dealloc(
            ptr.as_ptr(),
            Layout::from_size_align_unchecked(size, UNIT_ALIGN),
        );
        true
    }

    /// Size recorded for a block.
    pub fn size_of(&self, ptr: *const u8) -> Option<usize> {
        self.blocks.get(&(ptr as usize)).copied()
    }

    /// Number of outstanding blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes outstanding.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for SystemBucket {
    fn drop(&mut self) {
        for (&addr, &size) in &self.blocks {
            // SAFETY: every recorded block was allocated with this layout.
            unsafe {
                std::alloc::dealloc(
                    addr as *mut u8,
                    Layout::from_size_align_unchecked(size, UNIT_ALIGN),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free() {
        let mut bucket = SystemBucket::new();
        let ptr = bucket.alloc(10_000).expect("alloc");
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.bytes(), 10_000);
        assert_eq!(bucket.size_of(ptr.as_ptr()), Some(10_000));

        assert!(unsafe { bucket.free(ptr, 10_000) });
        assert_eq!(bucket.len(), 0);
        assert_eq!(bucket.bytes(), 0);
    }

    #[test]
    fn test_size_mismatch_is_refused() {
        let mut bucket = SystemBucket::new();
        let ptr = bucket.alloc(8192).expect("alloc");
        assert!(!unsafe { bucket.free(ptr, 4096) });
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn test_drop_releases_outstanding() {
        let mut bucket = SystemBucket::new();
        bucket.alloc(5000).expect("alloc");
        bucket.alloc(6000).expect("alloc");
        drop(bucket);
    }
}
