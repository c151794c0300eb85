//! Growable backing storage.
//!
//! A [`Buffer`] is the dynamic content of a header record once it outgrows
//! its inline capacity. It tracks element width, used length, capacity
//! from the logical start (`rest`), and head slack (`bias`):
//!
//! ```text
//! alloc.ptr
//! │◀── bias ──▶│◀──────────── rest ────────────▶│
//! ┌────────────┬───────────────┬─────────────────┐
//! │  (unused)  │  used elements │  tail capacity  │
//! └────────────┴───────────────┴─────────────────┘
//!              ▲ data()
//! ```
//!
//! Removing from the head only moves `bias`, so pop-front followed by
//! push-front never copies. Growth tries bias, then an in-place slide,
//! then reallocation (see [`Buffer::expand`]).

use crate::error::{MemError, Result};
use crate::pool::{PoolAllocator, RawAlloc};
use crate::stub::StubId;

/// Head slack beyond which the buffer is compacted back to its start.
pub const MAX_BIAS: usize = 0x1000;

/// Entries in the recently-expanded cache.
pub const EXPANSION_CACHE_SIZE: usize = 16;

/// How an [`Buffer::expand`] call satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Head slack was reused; nothing moved.
    ConsumedBias,
    /// The tail was moved within existing capacity.
    Slid,
    /// New storage was allocated and the old storage freed.
    Reallocated,
}

/// Dynamic backing storage owned by exactly one header record.
#[derive(Debug)]
pub struct Buffer {
    alloc: RawAlloc,
    width: usize,
    used: usize,
    rest: usize,
    bias: usize,
}

impl Buffer {
    /// Allocate storage for at least `capacity` elements of `width` bytes.
    pub fn allocate(pool: &mut PoolAllocator, width: usize, capacity: usize) -> Result<Self> {
        if width == 0 {
            return Err(MemError::ZeroWidth);
        }
        let bytes = capacity
            .max(1)
            .checked_mul(width)
            .ok_or(MemError::SizeOverflow)?;
        let alloc = pool.allocate(bytes)?;
        let rest = alloc.size() / width;

        Ok(Self {
            alloc,
            width,
            used: 0,
            rest,
            bias: 0,
        })
    }

    /// Element width in bytes.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of elements in use.
    #[inline]
    pub fn len(&self) -> usize {
        self.used
    }

    /// Whether no elements are in use.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Capacity in elements from the logical start.
    #[inline]
    pub fn rest(&self) -> usize {
        self.rest
    }

    /// Head slack in elements.
    #[inline]
    pub fn bias(&self) -> usize {
        self.bias
    }

    /// Capacity of the whole allocation in elements.
    #[inline]
    pub fn total_units(&self) -> usize {
        self.bias + self.rest
    }

    /// The underlying allocation.
    #[inline]
    pub fn raw(&self) -> &RawAlloc {
        &self.alloc
    }

    /// Pointer to the first element.
    #[inline]
    pub fn data(&self) -> *const u8 {
        // SAFETY: bias is always within the allocation.
        unsafe { self.alloc.ptr().as_ptr().add(self.bias * self.width) }
    }

    /// Mutable pointer to the first element.
    #[inline]
    pub fn data_mut(&mut self) -> *mut u8 {
        // SAFETY: bias is always within the allocation.
        unsafe { self.alloc.ptr().as_ptr().add(self.bias * self.width) }
    }

    /// Set the used length.
    ///
    /// # Safety
    ///
    /// Elements below `used` must be initialized for the owner's flavor.
    #[inline]
    pub unsafe fn set_len(&mut self, used: usize) {
        debug_assert!(used <= self.rest);
        self.used = used;
    }

    /// Give up the storage so it can be returned to its pool.
    #[inline]
    pub fn into_raw(self) -> RawAlloc {
        self.alloc
    }

    /// Make room for `delta` elements at `at`, preserving existing ones.
    ///
    /// Existing elements before `at` stay in place relative to the
    /// logical start; those at or after `at` move up by `delta`. The
    /// inserted region is left uninitialized. `terminator` extra units
    /// are kept free past the end for byte flavors.
    ///
    /// In priority order:
    /// 1. Inserting at the head with enough bias reuses the bias.
    /// 2. Enough tail capacity slides the tail in place.
    /// 3. Otherwise new storage is allocated, doubled if `owner` was
    ///    expanded recently, and the old storage is freed.
    ///
    /// On error the buffer is unchanged.
    pub fn expand(
        &mut self,
        pool: &mut PoolAllocator,
        cache: &mut ExpansionCache,
        owner: StubId,
        at: usize,
        delta: usize,
        terminator: usize,
    ) -> Result<Growth> {
        if at > self.used {
            return Err(MemError::IndexOutOfRange {
                index: at,
                len: self.used,
            });
        }
        let new_used = self
            .used
            .checked_add(delta)
            .ok_or(MemError::SizeOverflow)?;
        let needed = new_used
            .checked_add(terminator)
            .ok_or(MemError::SizeOverflow)?;

        // Head-insertion fast path
        if at == 0 && delta > 0 && self.bias >= delta {
            self.bias -= delta;
            self.rest += delta;
            self.used = new_used;
            return Ok(Growth::ConsumedBias);
        }

        let w = self.width;

        // In-place slide
        if needed <= self.rest {
            // SAFETY: source and destination are within `rest` elements.
            unsafe {
                let base = self.data_mut();
                std::ptr::copy(
                    base.add(at * w),
                    base.add((at + delta) * w),
                    (self.used - at) * w,
                );
            }
            self.used = new_used;
            return Ok(Growth::Slid);
        }

        // Reallocate and copy
        let mut wanted = needed;
        if cache.hit_or_insert(owner) {
            wanted = wanted.checked_mul(2).ok_or(MemError::SizeOverflow)?;
        }
        let bytes = wanted.checked_mul(w).ok_or(MemError::SizeOverflow)?;
        let fresh = pool.allocate(bytes)?;

        // SAFETY: the fresh block holds at least `needed` elements and does
        // not overlap the old one.
        unsafe {
            let src = self.data();
            let dst = fresh.ptr().as_ptr();
            std::ptr::copy_nonoverlapping(src, dst, at * w);
            std::ptr::copy_nonoverlapping(
                src.add(at * w),
                dst.add((at + delta) * w),
                (self.used - at) * w,
            );
        }

        let old = std::mem::replace(&mut self.alloc, fresh);
        pool.free(old);

        self.bias = 0;
        self.rest = self.alloc.size() / w;
        self.used = new_used;
        Ok(Growth::Reallocated)
    }

    /// Drop `count` elements from the head by growing the bias.
    ///
    /// Returns true if the bias exceeded [`MAX_BIAS`] and the content
    /// was moved back to the start of the allocation.
    pub fn remove_head(&mut self, count: usize) -> bool {
        debug_assert!(count <= self.used);
        let count = count.min(self.used);
        self.bias += count;
        self.rest -= count;
        self.used -= count;

        if self.bias > MAX_BIAS {
            self.unbias();
            true
        } else {
            false
        }
    }

    /// Drop `count` elements from the tail.
    pub fn remove_tail(&mut self, count: usize) {
        debug_assert!(count <= self.used);
        self.used -= count.min(self.used);
    }

    /// Move the content to the start of the allocation, reclaiming bias.
    pub fn unbias(&mut self) {
        if self.bias == 0 {
            return;
        }
        let bytes = self.used * self.width;
        // SAFETY: both ranges lie within the allocation; `copy` handles overlap.
        unsafe {
            std::ptr::copy(self.data(), self.alloc.ptr().as_ptr(), bytes);
        }
        self.rest += self.bias;
        self.bias = 0;
    }
}

/// Small cache of recently expanded owners.
///
/// An owner found here gets double the requested capacity on its next
/// reallocation. Replacement is round-robin.
#[derive(Debug, Default)]
pub struct ExpansionCache {
    entries: [Option<StubId>; EXPANSION_CACHE_SIZE],
    next: usize,
}

impl ExpansionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report whether `id` is cached, inserting it if not.
    pub fn hit_or_insert(&mut self, id: StubId) -> bool {
        if self.contains(id) {
            return true;
        }
        self.entries[self.next] = Some(id);
        self.next = (self.next + 1) % EXPANSION_CACHE_SIZE;
        false
    }

    /// Whether `id` is cached.
    pub fn contains(&self, id: StubId) -> bool {
        self.entries.iter().any(|entry| *entry == Some(id))
    }

    /// Drop `id` from the cache (its header died).
    pub fn forget(&mut self, id: StubId) {
        for entry in &mut self.entries {
            if *entry == Some(id) {
                *entry = None;
            }
        }
    }

    /// Clear all entries.
    pub fn clear(&mut self) {
        self.entries = [None; EXPANSION_CACHE_SIZE];
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemConfig;

    fn setup() -> (PoolAllocator, ExpansionCache) {
        (PoolAllocator::new(&MemConfig::default()), ExpansionCache::new())
    }

    fn fill(buf: &mut Buffer, bytes: &[u8]) {
        assert_eq!(buf.width(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.data_mut(), bytes.len());
            buf.set_len(bytes.len());
        }
    }

    fn contents(buf: &Buffer) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(buf.data(), buf.len()).to_vec() }
    }

    #[test]
    fn test_allocate_rounds_to_class() {
        let (mut pool, _) = setup();
        let buf = Buffer::allocate(&mut pool, 8, 5).unwrap();
        assert_eq!(buf.rest(), 6); // 40 bytes -> 48-byte class
        assert_eq!(buf.bias(), 0);
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_slide_in_place() {
        let (mut pool, mut cache) = setup();
        let id = StubId::new(1, 0);
        let mut buf = Buffer::allocate(&mut pool, 1, 16).unwrap();
        fill(&mut buf, b"abcd");

        let growth = buf.expand(&mut pool, &mut cache, id, 2, 3, 1).unwrap();
        assert_eq!(growth, Growth::Slid);
        assert_eq!(buf.len(), 7);
        let data = contents(&buf);
        assert_eq!(&data[..2], b"ab");
        assert_eq!(&data[5..], b"cd");
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_terminator_forces_realloc() {
        let (mut pool, mut cache) = setup();
        let id = StubId::new(1, 0);
        let mut buf = Buffer::allocate(&mut pool, 1, 16).unwrap();
        fill(&mut buf, &[7; 15]);

        // 16 used would leave no room for the terminator.
        let growth = buf.expand(&mut pool, &mut cache, id, 15, 1, 1).unwrap();
        assert_eq!(growth, Growth::Reallocated);
        assert!(buf.rest() >= 17);
        assert_eq!(&contents(&buf)[..15], &[7; 15]);
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_realloc_preserves_both_sides() {
        let (mut pool, mut cache) = setup();
        let id = StubId::new(2, 0);
        let mut buf = Buffer::allocate(&mut pool, 1, 16).unwrap();
        fill(&mut buf, b"0123456789abcdef");

        let growth = buf.expand(&mut pool, &mut cache, id, 4, 100, 0).unwrap();
        assert_eq!(growth, Growth::Reallocated);
        let data = contents(&buf);
        assert_eq!(&data[..4], b"0123");
        assert_eq!(&data[104..], b"456789abcdef");
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_recent_expansion_doubles() {
        let (mut pool, mut cache) = setup();
        let id = StubId::new(3, 0);
        let mut buf = Buffer::allocate(&mut pool, 16, 1).unwrap();

        buf.expand(&mut pool, &mut cache, id, 0, 200, 0).unwrap();
        let first = buf.rest();
        assert!(first >= 200 && first < 400);

        buf.expand(&mut pool, &mut cache, id, 0, first, 0).unwrap();
        // Second growth of the same owner requests double.
        assert!(buf.rest() >= 2 * (200 + first));
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_head_bias_round_trip() {
        let (mut pool, mut cache) = setup();
        let id = StubId::new(4, 0);
        let mut buf = Buffer::allocate(&mut pool, 1, 32).unwrap();
        fill(&mut buf, b"hello world");
        let before = pool.sequence();

        assert!(!buf.remove_head(6));
        assert_eq!(buf.bias(), 6);
        assert_eq!(contents(&buf), b"world");

        let growth = buf.expand(&mut pool, &mut cache, id, 0, 6, 0).unwrap();
        assert_eq!(growth, Growth::ConsumedBias);
        assert_eq!(buf.bias(), 0);
        assert_eq!(&contents(&buf)[6..], b"world");
        assert_eq!(pool.sequence(), before);
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_unbias_past_limit() {
        let (mut pool, _) = setup();
        let mut buf = Buffer::allocate(&mut pool, 1, MAX_BIAS + 64).unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(MAX_BIAS + 10).collect();
        fill(&mut buf, &payload);

        assert!(buf.remove_head(MAX_BIAS + 1));
        assert_eq!(buf.bias(), 0);
        assert_eq!(contents(&buf), &payload[MAX_BIAS + 1..]);
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_expand_past_end_is_error() {
        let (mut pool, mut cache) = setup();
        let mut buf = Buffer::allocate(&mut pool, 1, 8).unwrap();
        let err = buf
            .expand(&mut pool, &mut cache, StubId::new(0, 0), 3, 1, 0)
            .unwrap_err();
        assert_eq!(err, MemError::IndexOutOfRange { index: 3, len: 0 });
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_failed_realloc_leaves_buffer_intact() {
        let config = MemConfig {
            usage_limit: 512 * 1024,
            ..Default::default()
        };
        let mut pool = PoolAllocator::new(&config);
        let mut cache = ExpansionCache::new();
        let mut buf = Buffer::allocate(&mut pool, 1, 16).unwrap();
        fill(&mut buf, b"keep");

        let err = buf
            .expand(&mut pool, &mut cache, StubId::new(5, 0), 4, 1 << 20, 0)
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(contents(&buf), b"keep");
        pool.free(buf.into_raw());
    }

    #[test]
    fn test_cache_round_robin() {
        let mut cache = ExpansionCache::new();
        for i in 0..EXPANSION_CACHE_SIZE as u32 {
            assert!(!cache.hit_or_insert(StubId::new(i, 0)));
        }
        assert!(cache.hit_or_insert(StubId::new(0, 0)));

        // Seventeenth entry evicts the oldest.
        assert!(!cache.hit_or_insert(StubId::new(99, 0)));
        assert!(!cache.contains(StubId::new(0, 0)));

        cache.forget(StubId::new(99, 0));
        assert!(!cache.contains(StubId::new(99, 0)));
    }
}
