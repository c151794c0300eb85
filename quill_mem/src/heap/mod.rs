//! The memory context.
//!
//! [`Heap`] owns every piece of allocator and collector state: the header
//! arena, the buffer pools, the guard list, the data stack, root scopes,
//! and the depletion counter that decides when to collect. There is one
//! mutator; every operation takes the heap by reference.
//!
//! Construction helpers live in `make`, content operations in `series`,
//! and the guard list, data stack and root scopes in `guards`.

mod guards;
mod make;
mod series;

pub use guards::Guarded;

use crate::buffer::{Buffer, ExpansionCache};
use crate::cell::Cell;
use crate::cleanup::{CleanerTable, CleanupFn};
use crate::collector::GcState;
use crate::config::{ConfigError, MemConfig};
use crate::error::{MemError, Result};
use crate::pool::{PoolAllocator, RawAlloc};
use crate::roots::ScopeTable;
use crate::stats::MemStats;
use crate::stub::{Content, Flavor, Readability, Slot, Stub, StubArena, StubFlags, StubId, STUB_SIZE};
use smallvec::SmallVec;

/// Main heap structure.
pub struct Heap {
    /// Configuration parameters.
    pub(crate) config: MemConfig,

    /// Header records.
    pub(crate) arena: StubArena,

    /// Buffer storage.
    pub(crate) pool: PoolAllocator,

    /// Owners whose buffers grew recently.
    pub(crate) expansions: ExpansionCache,

    /// Per-flavor teardown hooks.
    pub(crate) cleaners: CleanerTable,

    /// Open API root scopes.
    pub(crate) scopes: ScopeTable,

    /// Records and values pinned by in-progress native code.
    pub(crate) guards: SmallVec<[Guarded; 16]>,

    /// In-flight intermediate values.
    pub(crate) data_stack: Vec<Cell>,

    /// The canonical target of dangling references.
    pub(crate) inaccessible: StubId,

    /// Collector phase.
    pub(crate) state: GcState,

    /// A collection was requested while one was running.
    pub(crate) pending: bool,

    /// Bytes left before a collection is requested.
    pub(crate) depletion: isize,

    /// A collection has been requested by allocation pressure.
    pub(crate) gc_requested: bool,

    /// Statistics.
    pub(crate) stats: MemStats,

    /// Everything has already been released by `shutdown`.
    pub(crate) shut_down: bool,
}

impl Heap {
    /// Create a heap with the given configuration.
    pub fn new(config: MemConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Create a heap with default configuration.
    pub fn with_defaults() -> Self {
        Self::build(MemConfig::default())
    }

    /// Create a heap configured from the process environment.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::new(MemConfig::from_env())
    }

    fn build(config: MemConfig) -> Self {
        let mut arena = StubArena::new(config.stub_units_per_segment);
        let mut pool = PoolAllocator::new(&config);

        // Bootstrap: there is no caller to report this failure to.
        let canonical = Stub::new(Flavor::Inaccessible, StubFlags::MANAGED | StubFlags::MARKED);
        let inaccessible = match pool.charge(STUB_SIZE).and_then(|()| arena.alloc(canonical)) {
            Ok(id) => id,
            Err(_) => std::alloc::handle_alloc_error(std::alloc::Layout::new::<Stub>()),
        };

        let stats = MemStats::new();
        stats.record_stub(STUB_SIZE);

        tracing::debug!(
            target: "quill_mem::gc",
            ballast = config.ballast,
            pools = !config.disable_pools,
            stress = config.stress,
            "heap initialized"
        );

        Self {
            depletion: config.ballast as isize,
            config,
            arena,
            pool,
            expansions: ExpansionCache::new(),
            cleaners: CleanerTable::new(),
            scopes: ScopeTable::default(),
            guards: SmallVec::new(),
            data_stack: Vec::new(),
            inaccessible,
            state: GcState::Idle,
            pending: false,
            gc_requested: false,
            stats,
            shut_down: false,
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a header record with empty inline content.
    ///
    /// Only `MANAGED` and `ROOT` are taken from `flags`; the rest are
    /// derived from the flavor.
    pub fn alloc_stub(&mut self, flavor: Flavor, flags: StubFlags) -> Result<StubId> {
        let flags = flags & (StubFlags::MANAGED | StubFlags::ROOT);

        self.pool.charge(STUB_SIZE)?;
        let id = match self.arena.alloc(Stub::new(flavor, flags)) {
            Ok(id) => id,
            Err(err) => {
                self.pool.credit(STUB_SIZE);
                return Err(err);
            }
        };

        self.stats.record_stub(STUB_SIZE);
        self.deplete(STUB_SIZE);
        Ok(id)
    }

    /// Allocate raw storage of at least `size` bytes.
    pub fn alloc_buffer(&mut self, size: usize) -> Result<RawAlloc> {
        let alloc = self.pool.allocate(size)?;
        self.stats.record_buffer(alloc.size(), alloc.pool().is_pooled());
        self.deplete(alloc.size());
        Ok(alloc)
    }

    /// Return raw storage to its pool.
    pub fn free_buffer(&mut self, alloc: RawAlloc) {
        self.stats.record_buffer_freed(alloc.size());
        self.pool.free(alloc);
    }

    /// Allocate a buffer for `capacity` elements of `width` bytes.
    pub(crate) fn new_buffer(&mut self, width: usize, capacity: usize) -> Result<Buffer> {
        let buffer = Buffer::allocate(&mut self.pool, width, capacity)?;
        let size = buffer.raw().size();
        self.stats.record_buffer(size, buffer.raw().pool().is_pooled());
        self.deplete(size);
        Ok(buffer)
    }

    #[inline]
    pub(crate) fn deplete(&mut self, bytes: usize) {
        self.depletion = self.depletion.saturating_sub(bytes as isize);
        if self.depletion <= 0 || self.config.stress {
            self.gc_requested = true;
        }
    }

    // =========================================================================
    // Lifetime
    // =========================================================================

    /// Hand a record's lifetime to the collector. One-way.
    ///
    /// Managing a pairlist also manages its hash index.
    pub fn manage(&mut self, id: StubId) -> Result<()> {
        let stub = self.readable_mut(id)?;
        if stub.is_managed() {
            return Ok(());
        }
        stub.flags |= StubFlags::MANAGED;

        let hashlist = match stub.flavor {
            Flavor::Pairlist => stub.link.node(),
            _ => None,
        };
        if let Some(hashlist) = hashlist {
            if let Some(index) = self.arena.get_mut(hashlist) {
                index.flags |= StubFlags::MANAGED;
            }
        }
        Ok(())
    }

    /// Free a record the mutator still owns.
    pub fn free_unmanaged(&mut self, id: StubId) -> Result<()> {
        let stub = self.stub(id)?;
        if stub.is_managed() {
            return Err(MemError::Managed(id));
        }
        self.release(id);
        Ok(())
    }

    /// Decommission a record.
    ///
    /// Unmanaged records are freed at once. Managed records release their
    /// content now and become unreadable; the next collection rewrites
    /// every reference to them to the canonical inaccessible record and
    /// then frees them. Decaying the canonical record, or a record that is
    /// already unreadable, does nothing.
    pub fn decay(&mut self, id: StubId) -> Result<()> {
        if id == self.inaccessible {
            return Ok(());
        }
        let stub = self.stub(id)?;
        if !stub.is_readable() {
            return Ok(());
        }
        if !stub.is_managed() {
            self.release(id);
            return Ok(());
        }

        self.teardown(id);
        if let Some(stub) = self.arena.get_mut(id) {
            stub.readability = Readability::Unreadable;
            stub.link = Slot::Empty;
            stub.misc = Slot::Empty;
            stub.info = Slot::Empty;
            stub.flags.remove(
                StubFlags::LINK_NEEDS_MARK | StubFlags::MISC_NEEDS_MARK | StubFlags::INFO_NEEDS_MARK,
            );
        }
        tracing::trace!(target: "quill_mem::gc", %id, "decayed");
        Ok(())
    }

    /// Run teardown (if still readable) and free the arena slot.
    pub(crate) fn release(&mut self, id: StubId) {
        let Some(stub) = self.arena.get(id) else {
            return;
        };
        if stub.is_readable() && stub.flavor.needs_teardown() {
            self.teardown(id);
        }
        self.expansions.forget(id);
        if self.arena.free(id).is_some() {
            self.pool.credit(STUB_SIZE);
            self.stats.record_stub_freed(STUB_SIZE);
        }
    }

    /// Release owned storage: hooks first, then the buffer, then any
    /// bookmark cache.
    fn teardown(&mut self, id: StubId) {
        let Some(stub) = self.arena.get_mut(id) else {
            return;
        };
        let flavor = stub.flavor;

        let own_hook = match (flavor, stub.info) {
            (Flavor::Handle, Slot::Cleaner(hook)) => Some(hook),
            _ => None,
        };
        let flavor_hook = self.cleaners.get(flavor);
        if own_hook.is_some() || flavor_hook.is_some() {
            let (ptr, len) = if flavor == Flavor::Handle {
                handle_parts(stub)
            } else {
                stub.extract()
            };
            if let Some(hook) = own_hook {
                hook(ptr, len);
            }
            if let Some(hook) = flavor_hook {
                hook(ptr, len);
            }
        }
        if own_hook.is_some() {
            stub.info = Slot::Empty;
        }

        let bookmarks = match flavor {
            Flavor::String => stub.link.node(),
            _ => None,
        };
        if bookmarks.is_some() {
            stub.link = Slot::Empty;
        }

        let content = stub.take_content();
        if let Content::Dynamic(buffer) = content {
            self.free_buffer(buffer.into_raw());
        }
        if let Some(bookmarks) = bookmarks {
            self.release(bookmarks);
        }
        self.expansions.forget(id);
    }

    /// Release every record, running cleanup hooks.
    pub(crate) fn release_all(&mut self) {
        for id in self.arena.live_ids() {
            self.release(id);
        }
        self.guards.clear();
        self.data_stack.clear();
    }

    // =========================================================================
    // Record Access
    // =========================================================================

    /// Look up a record, readable or not.
    pub fn stub(&self, id: StubId) -> Result<&Stub> {
        self.arena.get(id).ok_or(MemError::StaleReference(id))
    }

    /// Look up a record whose content may be read.
    pub fn readable(&self, id: StubId) -> Result<&Stub> {
        let stub = self.stub(id)?;
        if !stub.is_readable() || stub.flavor == Flavor::Inaccessible {
            return Err(MemError::Inaccessible(id));
        }
        Ok(stub)
    }

    pub(crate) fn readable_mut(&mut self, id: StubId) -> Result<&mut Stub> {
        readable_in(&mut self.arena, id)
    }

    /// Whether `id` names a live record.
    #[inline]
    pub fn is_live(&self, id: StubId) -> bool {
        self.arena.contains(id)
    }

    /// Whether `id` names a live, readable record.
    pub fn is_readable(&self, id: StubId) -> bool {
        self.readable(id).is_ok()
    }

    /// Whether `id` names a managed record.
    pub fn is_managed(&self, id: StubId) -> bool {
        self.arena.get(id).map_or(false, Stub::is_managed)
    }

    /// Flavor of a record.
    pub fn flavor(&self, id: StubId) -> Result<Flavor> {
        self.stub(id).map(Stub::flavor)
    }

    /// The `link` slot of a record.
    pub fn link(&self, id: StubId) -> Result<Slot> {
        self.readable(id).map(Stub::link)
    }

    /// The `misc` slot of a record.
    pub fn misc(&self, id: StubId) -> Result<Slot> {
        self.readable(id).map(Stub::misc)
    }

    /// The `info` slot of a record.
    pub fn info(&self, id: StubId) -> Result<Slot> {
        self.readable(id).map(Stub::info)
    }

    /// Store a record's `link` slot.
    pub fn set_link(&mut self, id: StubId, slot: Slot) -> Result<()> {
        self.readable_mut(id)?.set_link(slot);
        Ok(())
    }

    /// Store a record's `misc` slot.
    pub fn set_misc(&mut self, id: StubId, slot: Slot) -> Result<()> {
        self.readable_mut(id)?.set_misc(slot);
        Ok(())
    }

    /// Store a record's `info` slot.
    pub fn set_info(&mut self, id: StubId, slot: Slot) -> Result<()> {
        self.readable_mut(id)?.set_info(slot);
        Ok(())
    }

    /// The canonical inaccessible record.
    #[inline]
    pub fn inaccessible(&self) -> StubId {
        self.inaccessible
    }

    /// Live records, not counting the canonical inaccessible one.
    #[inline]
    pub fn stub_count(&self) -> usize {
        self.arena.live_count() - 1
    }

    /// Ids of live records, not counting the canonical inaccessible one.
    pub fn stub_ids(&self) -> Vec<StubId> {
        let canonical = self.inaccessible;
        self.arena
            .iter()
            .map(|(id, _)| id)
            .filter(|id| *id != canonical)
            .collect()
    }

    // =========================================================================
    // Configuration and Accounting
    // =========================================================================

    /// Register the teardown hook for every record of a flavor.
    pub fn register_cleaner(&mut self, flavor: Flavor, hook: CleanupFn) -> Option<CleanupFn> {
        self.cleaners.register(flavor, hook)
    }

    /// Get the configuration.
    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    /// Get statistics.
    pub fn stats(&self) -> &MemStats {
        &self.stats
    }

    /// Get the pool allocator.
    pub fn pool(&self) -> &PoolAllocator {
        &self.pool
    }

    /// Get the header arena.
    pub fn arena(&self) -> &StubArena {
        &self.arena
    }

    /// Bytes outstanding across headers and buffers.
    #[inline]
    pub fn outstanding_bytes(&self) -> usize {
        self.pool.outstanding()
    }

    /// Bytes left before allocation pressure requests a collection.
    #[inline]
    pub fn depletion(&self) -> isize {
        self.depletion
    }

    /// Whether a collection has been requested.
    #[inline]
    pub fn gc_requested(&self) -> bool {
        self.gc_requested
    }

    /// Request a collection at the next safe point.
    pub fn request_collection(&mut self) {
        self.gc_requested = true;
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if !self.shut_down {
            self.release_all();
        }
    }
}

pub(crate) fn readable_in(arena: &mut StubArena, id: StubId) -> Result<&mut Stub> {
    let stub = arena.get_mut(id).ok_or(MemError::StaleReference(id))?;
    if !stub.is_readable() || stub.flavor == Flavor::Inaccessible {
        return Err(MemError::Inaccessible(id));
    }
    Ok(stub)
}

/// The `[pointer, length]` pair stored in a handle record.
pub(crate) fn handle_parts(stub: &Stub) -> (*mut u8, usize) {
    if stub.len() < 2 {
        return (std::ptr::null_mut(), 0);
    }
    // SAFETY: handle content is two initialized words.
    unsafe {
        let words = stub.data().cast::<usize>();
        (std::ptr::read(words) as *mut u8, std::ptr::read(words.add(1)))
    }
}
