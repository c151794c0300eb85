//! Segmented pool allocator.
//!
//! Buffers are served from a fixed table of weight classes ("pools"),
//! each a free list of equal-width units carved from bulk segments.
//! Requests above the largest class, or every request when pooling is
//! disabled, go to the system allocator and are tracked in a synthetic
//! system bucket for accounting only.
//!
//! ```text
//! size ──▶ SIZE_TABLE ──▶ PoolId::Class(c) ──▶ pools[c].free_head
//!   │                                              │ empty
//!   │ > MAX_POOLED                                  ▼
//!   └──────────────▶ PoolId::System          carve segment
//! ```
//!
//! Every outstanding byte is charged against an optional usage ceiling.

mod segment;
mod size_class;
mod system;

pub use segment::UNIT_ALIGN;
pub use size_class::FREE_UNIT_BYTE;

use crate::config::MemConfig;
use crate::error::{integrity_failure, MemError, Result};
use size_class::Pool;
use std::ptr::NonNull;
use system::SystemBucket;

/// Largest request accepted by any allocation entry point (2GB).
pub const MAX_ALLOC: usize = 1 << 31;

/// Largest unit width served from a pool.
pub const MAX_POOLED: usize = 4096;

/// Target bytes per carved segment.
const SEGMENT_BYTES: usize = 64 * 1024;

/// Minimum units per carved segment.
const MIN_SEGMENT_UNITS: usize = 4;

/// Unit widths of the pools, smallest first. All are multiples of
/// [`UNIT_ALIGN`].
pub const POOL_WIDTHS: [usize; 28] = [
    16, 32, 48, 64, 80, 96, 112, 128, // fine steps for headers and small series
    160, 192, 224, 256, // 32-byte steps
    320, 384, 448, 512, // 64-byte steps
    640, 768, 896, 1024, // 128-byte steps
    1280, 1536, 1792, 2048, // 256-byte steps
    2560, 3072, 3584, 4096, // 512-byte steps
];

const SIZE_TABLE_LEN: usize = MAX_POOLED / UNIT_ALIGN + 1;

/// Maps `ceil(size / UNIT_ALIGN)` to the smallest fitting class.
static SIZE_TABLE: [u8; SIZE_TABLE_LEN] = build_size_table();

const fn build_size_table() -> [u8; SIZE_TABLE_LEN] {
    let mut table = [0u8; SIZE_TABLE_LEN];
    let mut class = 0;
    let mut slot = 1;
    while slot < SIZE_TABLE_LEN {
        while POOL_WIDTHS[class] < slot * UNIT_ALIGN {
            class += 1;
        }
        table[slot] = class as u8;
        slot += 1;
    }
    table
}

/// Identifies where an allocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolId {
    /// One of the fixed weight classes.
    Class(u8),
    /// Direct system allocation.
    System,
}

impl PoolId {
    /// Whether this is a pooled weight class.
    #[inline]
    pub fn is_pooled(self) -> bool {
        matches!(self, PoolId::Class(_))
    }
}

/// An owned allocation. Must be returned with [`PoolAllocator::free`].
#[derive(Debug)]
pub struct RawAlloc {
    ptr: NonNull<u8>,
    pool: PoolId,
    size: usize,
}

impl RawAlloc {
    /// Start of the allocation.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Originating pool.
    #[inline]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// Usable size in bytes (the class width for pooled allocations).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// The pool allocator.
pub struct PoolAllocator {
    /// One pool per entry of [`POOL_WIDTHS`].
    pools: Vec<Pool>,
    /// Oversized and unpooled allocations.
    system: SystemBucket,
    /// Bytes charged and not yet credited.
    outstanding: usize,
    /// Usage ceiling (0 = unlimited).
    limit: usize,
    /// Route everything to the system bucket.
    disable_pools: bool,
    /// Round system allocations to a power of two.
    prefer_power_of_two: bool,
    /// Run double-free and ownership checks on every free.
    verify: bool,
    /// Allocation/free sequence counter for diagnostics.
    sequence: u64,
}

impl PoolAllocator {
    /// Create an allocator for the given configuration.
    ///
    /// No memory is reserved until the first allocation.
    pub fn new(config: &MemConfig) -> Self {
        let pools = POOL_WIDTHS
            .iter()
            .map(|&width| Pool::new(width, (SEGMENT_BYTES / width).max(MIN_SEGMENT_UNITS)))
            .collect();

        Self {
            pools,
            system: SystemBucket::new(),
            outstanding: 0,
            limit: config.usage_limit,
            disable_pools: config.disable_pools,
            prefer_power_of_two: config.prefer_power_of_two,
            verify: config.verify_heap,
            sequence: 0,
        }
    }

    // =========================================================================
    // Size classes
    // =========================================================================

    /// Pick the pool that would serve a request of `size` bytes.
    #[inline]
    pub fn size_to_pool(&self, size: usize) -> PoolId {
        if self.disable_pools || size > MAX_POOLED {
            PoolId::System
        } else {
            PoolId::Class(SIZE_TABLE[(size + UNIT_ALIGN - 1) / UNIT_ALIGN])
        }
    }

    /// Unit width of a pool, or `None` for the system bucket.
    pub fn unit_width(&self, pool: PoolId) -> Option<usize> {
        match pool {
            PoolId::Class(class) => self.pools.get(class as usize).map(Pool::width),
            PoolId::System => None,
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate at least `size` bytes.
    ///
    /// Zero and oversized requests are rejected before any pool is touched.
    pub fn allocate(&mut self, size: usize) -> Result<RawAlloc> {
        if size == 0 {
            return Err(MemError::ZeroWidth);
        }
        if size > MAX_ALLOC {
            return Err(MemError::TooLarge { requested: size });
        }

        match self.size_to_pool(size) {
            PoolId::Class(class) => self.allocate_from(class),
            PoolId::System => self.allocate_system(size),
        }
    }

    /// Allocate one unit from a specific class.
    pub fn allocate_from(&mut self, class: u8) -> Result<RawAlloc> {
        let pool = self
            .pools
            .get_mut(class as usize)
            .ok_or(MemError::TooLarge { requested: 0 })?;
        let width = pool.width();

        charge(&mut self.outstanding, self.limit, width)?;
        match pool.alloc() {
            Some(ptr) => {
                self.sequence += 1;
                Ok(RawAlloc {
                    ptr,
                    pool: PoolId::Class(class),
                    size: width,
                })
            }
            None => {
                self.outstanding -= width;
                Err(MemError::OutOfMemory { requested: width })
            }
        }
    }

    fn allocate_system(&mut self, size: usize) -> Result<RawAlloc> {
        let size = if self.prefer_power_of_two {
            size.checked_next_power_of_two()
                .ok_or(MemError::SizeOverflow)?
        } else {
            (size + UNIT_ALIGN - 1) & !(UNIT_ALIGN - 1)
        };

        charge(&mut self.outstanding, self.limit, size)?;
        match self.system.alloc(size) {
            Some(ptr) => {
                self.sequence += 1;
                Ok(RawAlloc {
                    ptr,
                    pool: PoolId::System,
                    size,
                })
            }
            None => {
                self.outstanding -= size;
                Err(MemError::OutOfMemory { requested: size })
            }
        }
    }

    /// Return an allocation to its originating pool or the system.
    pub fn free(&mut self, alloc: RawAlloc) {
        let RawAlloc { ptr, pool, size } = alloc;

        match pool {
            PoolId::Class(class) => {
                let Some(unit_pool) = self.pools.get_mut(class as usize) else {
                    integrity_failure("free to unknown pool", format_args!("class {}", class));
                };
                if self.verify {
                    if !unit_pool.owns_unit(ptr.as_ptr()) {
                        integrity_failure(
                            "free of foreign unit",
                            format_args!(
                                "pool {} (width {}) at sequence {}",
                                class,
                                unit_pool.width(),
                                self.sequence
                            ),
                        );
                    }
                    if unit_pool.is_free_unit(ptr) {
                        integrity_failure(
                            "double free",
                            format_args!(
                                "pool {} segment {:?} at sequence {}",
                                class,
                                unit_pool.segment_of(ptr.as_ptr()),
                                self.sequence
                            ),
                        );
                    }
                }
                // SAFETY: the allocation came from this pool and is consumed here.
                unsafe { unit_pool.free(ptr) };
            }
            PoolId::System => {
                // SAFETY: the allocation is consumed here.
                if !unsafe { self.system.free(ptr, size) } {
                    integrity_failure(
                        "system free mismatch",
                        format_args!("{} bytes at sequence {}", size, self.sequence),
                    );
                }
            }
        }

        self.outstanding -= size;
        self.sequence += 1;
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    /// Charge bytes allocated outside the pools (header records).
    pub fn charge(&mut self, bytes: usize) -> Result<()> {
        charge(&mut self.outstanding, self.limit, bytes)
    }

    /// Credit bytes previously charged.
    pub fn credit(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.outstanding);
        self.outstanding = self.outstanding.saturating_sub(bytes);
    }

    /// Bytes outstanding across pools, system blocks and headers.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Configured usage ceiling (0 = unlimited).
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Units on the free list of a class.
    pub fn free_units(&self, class: u8) -> usize {
        self.pools.get(class as usize).map_or(0, Pool::free_count)
    }

    /// Segments carved across all pools.
    pub fn segment_count(&self) -> usize {
        self.pools.iter().map(Pool::segment_count).sum()
    }

    /// Bytes reserved from the system by pool segments.
    pub fn reserved_bytes(&self) -> usize {
        self.pools.iter().map(Pool::reserved_bytes).sum()
    }

    /// Outstanding direct system blocks.
    pub fn system_blocks(&self) -> usize {
        self.system.len()
    }

    /// Bytes held by direct system blocks.
    pub fn system_bytes(&self) -> usize {
        self.system.bytes()
    }

    /// Allocation/free sequence number.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Check that an allocation's recorded size agrees with its origin.
    pub fn is_consistent(&self, alloc: &RawAlloc) -> bool {
        match alloc.pool {
            PoolId::Class(class) => self
                .pools
                .get(class as usize)
                .map_or(false, |pool| {
                    pool.width() == alloc.size && pool.owns_unit(alloc.ptr.as_ptr())
                }),
            PoolId::System => self.system.size_of(alloc.ptr.as_ptr()) == Some(alloc.size),
        }
    }
}

fn charge(outstanding: &mut usize, limit: usize, bytes: usize) -> Result<()> {
    let total = outstanding
        .checked_add(bytes)
        .ok_or(MemError::SizeOverflow)?;
    if limit != 0 && total > limit {
        return Err(MemError::UsageLimit {
            requested: bytes,
            limit,
        });
    }
    *outstanding = total;
    Ok(())
}
