//! One weight class of pool units.
//!
//! Free units are threaded on an intrusive list: the first byte of a free
//! unit holds [`FREE_UNIT_BYTE`] and the word at [`NEXT_OFFSET`] holds the
//! next free unit. Live units never carry the sentinel in a position the
//! scanners trust, so a unit's state can be read without walking the list.

use super::segment::Segment;
use std::ptr::NonNull;

/// Sentinel written into the first byte of every free unit.
pub const FREE_UNIT_BYTE: u8 = 0xF7;

/// Offset of the next-free pointer within a free unit.
const NEXT_OFFSET: usize = 8;

/// A pool of fixed-width units.
pub(crate) struct Pool {
    /// Unit width in bytes.
    width: usize,
    /// Units carved per new segment.
    units_per_segment: usize,
    /// Every segment ever carved for this pool.
    segments: Vec<Segment>,
    /// Head of the intrusive free list.
    free_head: Option<NonNull<u8>>,
    /// Number of units on the free list.
    free_count: usize,
}

impl Pool {
    /// Create an empty pool. No memory is reserved until first use.
    pub fn new(width: usize, units_per_segment: usize) -> Self {
        Self {
            width,
            units_per_segment,
            segments: Vec::new(),
            free_head: None,
            free_count: 0,
        }
    }

    /// Unit width in bytes.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Units currently on the free list.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Number of segments carved.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total bytes reserved from the system.
    pub fn reserved_bytes(&self) -> usize {
        self.segments.iter().map(Segment::size).sum()
    }

    /// Detach a unit from the free list, carving a segment if empty.
    ///
    /// Returns `None` if a new segment was needed and the system refused.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        if self.free_head.is_none() {
            self.carve()?;
        }
        let unit = self.free_head?;

        // SAFETY: every unit on the list was written by `push_free`.
        unsafe {
            let base = unit.as_ptr();
            if cfg!(debug_assertions) && *base != FREE_UNIT_BYTE {
                crate::error::integrity_failure(
                    "free unit modified",
                    format_args!(
                        "width {} segment {:?} byte {:#x}",
                        self.width,
                        self.segment_of(base),
                        *base
                    ),
                );
            }
            let next = std::ptr::read(base.add(NEXT_OFFSET).cast::<*mut u8>());
            self.free_head = NonNull::new(next);
            *base = 0;
        }
        self.free_count -= 1;
        Some(unit)
    }

    /// Reattach a unit to the free list.
    ///
    /// # Safety
    ///
    /// `unit` must have come from `alloc` on this pool and not be freed yet.
    pub unsafe fn free(&mut self, unit: NonNull<u8>) {
        self.push_free(unit);
    }

    /// Index of the segment holding `ptr`, if any.
    pub fn segment_of(&self, ptr: *const u8) -> Option<usize> {
        self.segments.iter().position(|seg| seg.owns_unit(ptr))
    }

    /// Check whether `ptr` is a unit of this pool.
    pub fn owns_unit(&self, ptr: *const u8) -> bool {
        self.segment_of(ptr).is_some()
    }

    /// Check whether `unit` is currently on the free list.
    ///
    /// The sentinel byte is checked first; the list walk only runs
    /// when it matches.
    pub fn is_free_unit(&self, unit: NonNull<u8>) -> bool {
        // SAFETY: callers pass units owned by this pool.
        if unsafe { *unit.as_ptr() } != FREE_UNIT_BYTE {
            return false;
        }
        let mut cursor = self.free_head;
        while let Some(node) = cursor {
            if node == unit {
                return true;
            }
            // SAFETY: free list nodes always hold a next pointer.
            cursor = NonNull::new(unsafe {
                std::ptr::read(node.as_ptr().add(NEXT_OFFSET).cast::<*mut u8>())
            });
        }
        false
    }

    /// Carve a new segment and thread its units onto the free list.
    fn carve(&mut self) -> Option<()> {
        let segment = Segment::new(self.width, self.units_per_segment)?;
        self.segments.try_reserve(1).ok()?;

        // Thread in reverse so the lowest address is handed out first.
        for index in (0..segment.units()).rev() {
            // SAFETY: the unit is fresh memory owned by this pool.
            unsafe { self.push_free(segment.unit(index)) };
        }

        tracing::trace!(
            target: "quill_mem::pool",
            width = self.width,
            units = segment.units(),
            segments = self.segments.len() + 1,
            "carved segment"
        );
        self.segments.push(segment);
        Some(())
    }

    unsafe fn push_free(&mut self, unit: NonNull<u8>) {
        let base = unit.as_ptr();
        *base = FREE_UNIT_BYTE;
        let next = self.free_head.map_or(std::ptr::null_mut(), NonNull::as_ptr);
        std::ptr::write(base.add(NEXT_OFFSET).cast::<*mut u8>(), next);
        self.free_head = Some(unit);
        self.free_count += 1;
    }
}
