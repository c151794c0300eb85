//! Pool segments.
//!
//! A segment is one bulk allocation from the system, carved into
//! equal-width units for a single pool. Segments are only returned
//! to the system when their pool is dropped.

use std::alloc::Layout;
use std::ptr::NonNull;

/// Alignment of every pool unit.
pub const UNIT_ALIGN: usize = 16;

/// A bulk allocation subdivided into units of one width.
pub(crate) struct Segment {
    /// Start of the first unit.
    ptr: NonNull<u8>,
    /// Layout used for the allocation (needed for dealloc).
    layout: Layout,
    /// Width of each unit in bytes.
    width: usize,
    /// Number of units.
    units: usize,
}

impl Segment {
    /// Allocate a segment of `units` units of `width` bytes each.
    ///
    /// Returns `None` if the size overflows or the system refuses.
    pub fn new(width: usize, units: usize) -> Option<Self> {
        debug_assert!(width >= UNIT_ALIGN && width % UNIT_ALIGN == 0);

        let size = width.checked_mul(units)?;
        let layout = Layout::from_size_align(size, UNIT_ALIGN).ok()?;
        // SAFETY: `size` is non-zero for any real pool width.
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;

        Some(Self {
            ptr,
            layout,
            width,
            units,
        })
    }

    /// Pointer to unit `index`.
    #[inline]
    pub fn unit(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.units);
        // SAFETY: index is in bounds, so the offset stays in the allocation.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(index * self.width)) }
    }

    /// Number of units.
    #[inline]
    pub fn units(&self) -> usize {
        self.units
    }

    /// Total bytes held by this segment.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Check whether `ptr` is the start of a unit in this segment.
    pub fn owns_unit(&self, ptr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.layout.size() && (addr - start) % self.width == 0
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe {
            std::alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_units() {
        let seg = Segment::new(32, 4).expect("segment");
        assert_eq!(seg.units(), 4);
        assert_eq!(seg.size(), 128);

        let first = seg.unit(0).as_ptr() as usize;
        let last = seg.unit(3).as_ptr() as usize;
        assert_eq!(last - first, 96);
        assert_eq!(first % UNIT_ALIGN, 0);
    }

    #[test]
    fn test_owns_unit() {
        let seg = Segment::new(16, 8).expect("segment");
        let unit = seg.unit(5).as_ptr();
        assert!(seg.owns_unit(unit));
        // Interior pointers are not units.
        assert!(!seg.owns_unit(unit.wrapping_add(1)));
        assert!(!seg.owns_unit(seg.unit(7).as_ptr().wrapping_add(16)));
    }
}
