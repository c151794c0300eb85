//! Header records ("stubs").
//!
//! Every object the runtime allocates is a fixed-size [`Stub`] living in
//! the [`StubArena`]. A stub carries identity flags, a [`Flavor`], three
//! generic cross-reference [`Slot`]s and its content: either a small
//! inline payload or a [`Buffer`] once it outgrows that.
//!
//! Stubs are addressed by [`StubId`], an index plus a generation. Freeing
//! a stub bumps its slot's generation, so an id that outlives its stub is
//! detected instead of aliasing whatever reuses the slot.

mod arena;
mod flavor;

pub use arena::StubArena;
pub use flavor::Flavor;

use crate::buffer::Buffer;
use crate::cell::{Cell, CELL_SIZE};
use crate::cleanup::CleanupFn;
use crate::roots::RootScopeId;
use std::fmt;
use std::mem::MaybeUninit;

/// Bytes of inline content: room for two cells.
pub const INLINE_BYTES: usize = 2 * CELL_SIZE;

const INLINE_WORDS: usize = INLINE_BYTES / 8;

/// Size of one header record.
pub const STUB_SIZE: usize = std::mem::size_of::<Stub>();

// =============================================================================
// Identity
// =============================================================================

/// Generational handle to a header record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StubId {
    index: u32,
    generation: u32,
}

impl StubId {
    /// Build an id from raw parts.
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation this id was issued for.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for StubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stub #{}.{}", self.index, self.generation)
    }
}

bitflags::bitflags! {
    /// Identity and collector bits of a header record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StubFlags: u16 {
        /// Set on every allocated record.
        const NODE = 1 << 0;
        /// Lifetime is owned by the collector.
        const MANAGED = 1 << 1;
        /// Reached during the current mark phase.
        const MARKED = 1 << 2;
        /// Kept alive from outside the graph.
        const ROOT = 1 << 3;
        /// Holds an inline pair of cells.
        const CELL = 1 << 4;
        /// Content lives in a separate buffer.
        const DYNAMIC = 1 << 5;
        /// `link` holds a followable reference.
        const LINK_NEEDS_MARK = 1 << 6;
        /// `misc` holds a followable reference.
        const MISC_NEEDS_MARK = 1 << 7;
        /// `info` holds a followable reference.
        const INFO_NEEDS_MARK = 1 << 8;
        /// Length cannot change after creation.
        const FIXED_SIZE = 1 << 9;
    }
}

/// Whether a record's content may be read.
///
/// Decommissioned records are kept in the arena until the next sweep so
/// references to them can be found and canonicalized. This is tracked
/// separately from the mark bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readability {
    /// Normal record.
    Readable,
    /// Decommissioned; content already released.
    Unreadable,
}

// =============================================================================
// Slots
// =============================================================================

/// A generic cross-reference slot (`link`, `misc`, `info`).
#[derive(Debug, Clone, Copy)]
pub enum Slot {
    /// Nothing stored.
    Empty,
    /// Reference to another record.
    Node(StubId),
    /// Owning root scope of an API record.
    Scope(RootScopeId),
    /// Teardown callback.
    Cleaner(CleanupFn),
    /// Plain data.
    Word(usize),
}

impl Slot {
    /// The referenced record, if any.
    #[inline]
    pub fn node(self) -> Option<StubId> {
        match self {
            Slot::Node(id) => Some(id),
            _ => None,
        }
    }

    /// Wrap an optional reference.
    #[inline]
    pub fn from_node(id: Option<StubId>) -> Self {
        id.map_or(Slot::Empty, Slot::Node)
    }
}

// =============================================================================
// Content
// =============================================================================

/// Inline payload storage, aligned for cells.
#[derive(Clone, Copy)]
#[repr(C, align(8))]
pub struct InlineData {
    words: [MaybeUninit<u64>; INLINE_WORDS],
}

impl InlineData {
    fn new() -> Self {
        Self {
            words: [MaybeUninit::uninit(); INLINE_WORDS],
        }
    }

    #[inline]
    fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr().cast()
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }
}

impl fmt::Debug for InlineData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InlineData { .. }")
    }
}

/// Content of a header record.
#[derive(Debug)]
pub enum Content {
    /// Small payload stored in the record itself.
    Inline {
        /// Raw storage.
        data: InlineData,
        /// Elements in use.
        used: usize,
    },
    /// Payload in a separately allocated buffer.
    Dynamic(Buffer),
}

impl Content {
    /// Empty inline content.
    pub fn empty() -> Self {
        Content::Inline {
            data: InlineData::new(),
            used: 0,
        }
    }
}

// =============================================================================
// Header Record
// =============================================================================

/// A header record.
#[derive(Debug)]
pub struct Stub {
    pub(crate) flags: StubFlags,
    pub(crate) readability: Readability,
    pub(crate) flavor: Flavor,
    pub(crate) link: Slot,
    pub(crate) misc: Slot,
    pub(crate) info: Slot,
    pub(crate) content: Content,
}

impl Stub {
    /// Create a record with empty inline content.
    pub fn new(flavor: Flavor, flags: StubFlags) -> Self {
        let mut flags = flags | StubFlags::NODE;
        if flavor == Flavor::Pairing {
            flags |= StubFlags::CELL;
        }
        if flavor.is_fixed_size() {
            flags |= StubFlags::FIXED_SIZE;
        }
        Self {
            flags,
            readability: Readability::Readable,
            flavor,
            link: Slot::Empty,
            misc: Slot::Empty,
            info: Slot::Empty,
            content: Content::empty(),
        }
    }

    /// Flag bits.
    #[inline]
    pub fn flags(&self) -> StubFlags {
        self.flags
    }

    /// Flavor.
    #[inline]
    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Readability state.
    #[inline]
    pub fn readability(&self) -> Readability {
        self.readability
    }

    /// Whether the record can be read.
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.readability == Readability::Readable
    }

    /// Whether the collector owns this record.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.flags.contains(StubFlags::MANAGED)
    }

    /// Whether the mark bit is set.
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags.contains(StubFlags::MARKED)
    }

    /// Whether this record is an external root.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.flags.contains(StubFlags::ROOT)
    }

    /// Whether content lives in a buffer.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self.content, Content::Dynamic(_))
    }

    /// The `link` slot.
    #[inline]
    pub fn link(&self) -> Slot {
        self.link
    }

    /// The `misc` slot.
    #[inline]
    pub fn misc(&self) -> Slot {
        self.misc
    }

    /// The `info` slot.
    #[inline]
    pub fn info(&self) -> Slot {
        self.info
    }

    /// Store `link`, updating its needs-mark bit.
    pub fn set_link(&mut self, slot: Slot) {
        self.link = slot;
        self.flags.set(
            StubFlags::LINK_NEEDS_MARK,
            self.flavor.follows_link() && slot.node().is_some(),
        );
    }

    /// Store `misc`, updating its needs-mark bit.
    pub fn set_misc(&mut self, slot: Slot) {
        self.misc = slot;
        self.flags.set(
            StubFlags::MISC_NEEDS_MARK,
            self.flavor.follows_misc() && slot.node().is_some(),
        );
    }

    /// Store `info`, updating its needs-mark bit.
    pub fn set_info(&mut self, slot: Slot) {
        self.info = slot;
        self.flags.set(
            StubFlags::INFO_NEEDS_MARK,
            self.flavor.follows_info() && slot.node().is_some(),
        );
    }

    /// Whether the collector must visit this record's contents.
    #[inline]
    pub fn has_followable(&self) -> bool {
        self.flavor.holds_cells()
            || self.flags.intersects(
                StubFlags::LINK_NEEDS_MARK | StubFlags::MISC_NEEDS_MARK | StubFlags::INFO_NEEDS_MARK,
            )
    }

    /// Element width.
    #[inline]
    pub fn width(&self) -> usize {
        self.flavor.width()
    }

    /// Elements in use.
    #[inline]
    pub fn len(&self) -> usize {
        match &self.content {
            Content::Inline { used, .. } => *used,
            Content::Dynamic(buf) => buf.len(),
        }
    }

    /// Whether no elements are in use.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element capacity from the logical start, terminator included.
    #[inline]
    pub fn capacity(&self) -> usize {
        match &self.content {
            Content::Inline { .. } => INLINE_BYTES / self.width(),
            Content::Dynamic(buf) => buf.rest(),
        }
    }

    /// The dynamic buffer, if promoted.
    #[inline]
    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.content {
            Content::Dynamic(buf) => Some(buf),
            Content::Inline { .. } => None,
        }
    }

    /// Pointer to the first element.
    #[inline]
    pub fn data(&self) -> *const u8 {
        match &self.content {
            Content::Inline { data, .. } => data.as_ptr(),
            Content::Dynamic(buf) => buf.data(),
        }
    }

    /// Mutable pointer to the first element.
    #[inline]
    pub(crate) fn data_mut(&mut self) -> *mut u8 {
        match &mut self.content {
            Content::Inline { data, .. } => data.as_mut_ptr(),
            Content::Dynamic(buf) => buf.data_mut(),
        }
    }

    /// Set the used length.
    ///
    /// # Safety
    ///
    /// Elements below `used` must be initialized and fit the capacity.
    pub(crate) unsafe fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        match &mut self.content {
            Content::Inline { used, .. } => *used = len,
            Content::Dynamic(buf) => buf.set_len(len),
        }
    }

    /// Read cell `index`.
    ///
    /// Returns `None` for non-cell flavors or out-of-range indexes.
    #[inline]
    pub fn cell(&self, index: usize) -> Option<Cell> {
        if !self.flavor.holds_cells() || index >= self.len() {
            return None;
        }
        // SAFETY: elements below `len` of a cell flavor are initialized cells.
        Some(unsafe { std::ptr::read(self.data().cast::<Cell>().add(index)) })
    }

    /// Overwrite cell `index`. Returns false if out of range.
    #[inline]
    pub(crate) fn write_cell(&mut self, index: usize, cell: Cell) -> bool {
        if !self.flavor.holds_cells() || index >= self.len() {
            return false;
        }
        // SAFETY: in range and aligned for cells.
        unsafe { std::ptr::write(self.data_mut().cast::<Cell>().add(index), cell) };
        true
    }

    /// Used content of a non-cell flavor as raw bytes.
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        if self.flavor.holds_cells() {
            return None;
        }
        let bytes = self.len() * self.width();
        if bytes == 0 {
            return Some(&[]);
        }
        // SAFETY: non-cell content below `len` is always written as plain data.
        Some(unsafe { std::slice::from_raw_parts(self.data(), bytes) })
    }

    /// Pointer and byte length of the used content.
    pub fn extract(&self) -> (*mut u8, usize) {
        (self.data() as *mut u8, self.len() * self.width())
    }

    /// Replace inline content with a buffer. One-way.
    pub(crate) fn promote(&mut self, buffer: Buffer) {
        debug_assert!(!self.is_dynamic());
        self.content = Content::Dynamic(buffer);
        self.flags |= StubFlags::DYNAMIC;
    }

    /// Take the content out, leaving it empty inline.
    pub(crate) fn take_content(&mut self) -> Content {
        std::mem::replace(&mut self.content, Content::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_id_display() {
        assert_eq!(StubId::new(12, 3).to_string(), "stub #12.3");
    }

    #[test]
    fn test_new_sets_node_and_flavor_bits() {
        let stub = Stub::new(Flavor::Pairing, StubFlags::MANAGED);
        assert!(stub.flags().contains(StubFlags::NODE | StubFlags::CELL));
        assert!(stub.flags().contains(StubFlags::FIXED_SIZE));
        assert!(stub.is_managed());
        assert!(!stub.is_dynamic());
        assert!(stub.is_readable());
    }

    #[test]
    fn test_inline_cells() {
        let mut stub = Stub::new(Flavor::Array, StubFlags::empty());
        assert_eq!(stub.capacity(), 2);
        unsafe {
            std::ptr::write(stub.data_mut().cast::<Cell>(), Cell::integer(10));
            stub.set_len(1);
        }
        assert_eq!(stub.cell(0), Some(Cell::integer(10)));
        assert_eq!(stub.cell(1), None);

        assert!(stub.write_cell(0, Cell::logic(true)));
        assert_eq!(stub.cell(0), Some(Cell::logic(true)));
        assert!(!stub.write_cell(1, Cell::blank()));
    }

    #[test]
    fn test_link_needs_mark_follows_flavor() {
        let target = StubId::new(1, 0);

        let mut varlist = Stub::new(Flavor::Varlist, StubFlags::empty());
        varlist.set_link(Slot::Node(target));
        assert!(varlist.flags().contains(StubFlags::LINK_NEEDS_MARK));
        varlist.set_link(Slot::Empty);
        assert!(!varlist.flags().contains(StubFlags::LINK_NEEDS_MARK));

        let mut string = Stub::new(Flavor::String, StubFlags::empty());
        string.set_link(Slot::Node(target));
        assert!(!string.flags().contains(StubFlags::LINK_NEEDS_MARK));
        assert!(!string.has_followable());
    }

    #[test]
    fn test_raw_bytes_only_for_plain_data() {
        let stub = Stub::new(Flavor::Array, StubFlags::empty());
        assert!(stub.raw_bytes().is_none());

        let bin = Stub::new(Flavor::Binary, StubFlags::empty());
        assert_eq!(bin.raw_bytes(), Some(&[][..]));
    }
}
