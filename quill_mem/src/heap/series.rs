//! Content operations: length, element access, growth and removal.

use super::{readable_in, Heap};
use crate::buffer::{Buffer, Growth};
use crate::cell::Cell;
use crate::error::{MemError, Result};
use crate::stub::{Content, Flavor, Slot, StubFlags, StubId, INLINE_BYTES};

impl Heap {
    /// Number of elements in a record.
    pub fn len(&self, id: StubId) -> Result<usize> {
        self.readable(id).map(|stub| stub.len())
    }

    /// Read cell `index` of a cell-holding record.
    pub fn cell_at(&self, id: StubId, index: usize) -> Result<Cell> {
        let stub = self.readable(id)?;
        if !stub.flavor.holds_cells() {
            return Err(MemError::WrongFlavor {
                expected: Flavor::Array,
                found: stub.flavor,
            });
        }
        stub.cell(index).ok_or(MemError::IndexOutOfRange {
            index,
            len: stub.len(),
        })
    }

    /// Overwrite cell `index` of a cell-holding record.
    pub fn set_cell(&mut self, id: StubId, index: usize, cell: Cell) -> Result<()> {
        let stub = self.readable_mut(id)?;
        if !stub.flavor.holds_cells() {
            return Err(MemError::WrongFlavor {
                expected: Flavor::Array,
                found: stub.flavor,
            });
        }
        let len = stub.len();
        if stub.write_cell(index, cell) {
            Ok(())
        } else {
            Err(MemError::IndexOutOfRange { index, len })
        }
    }

    /// Append one cell.
    pub fn push_cell(&mut self, id: StubId, cell: Cell) -> Result<()> {
        let len = self.len(id)?;
        self.insert_cells(id, len, &[cell])
    }

    /// Insert `cells` at `at`, moving later cells up.
    pub fn insert_cells(&mut self, id: StubId, at: usize, cells: &[Cell]) -> Result<()> {
        let flavor = self.readable(id)?.flavor;
        if !flavor.holds_cells() {
            return Err(MemError::WrongFlavor {
                expected: Flavor::Array,
                found: flavor,
            });
        }
        self.expand(id, at, cells.len())?;
        if let Some(stub) = self.arena.get_mut(id) {
            // SAFETY: `expand` made room for `cells.len()` cells at `at`.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    cells.as_ptr(),
                    stub.data_mut().cast::<Cell>().add(at),
                    cells.len(),
                );
            }
        }
        Ok(())
    }

    /// Raw content of a byte-sized or other plain-data record.
    pub fn bytes(&self, id: StubId) -> Result<&[u8]> {
        let stub = self.readable(id)?;
        stub.raw_bytes().ok_or(MemError::WrongFlavor {
            expected: Flavor::Binary,
            found: stub.flavor,
        })
    }

    /// Append bytes to a byte-sized record.
    pub fn append_bytes(&mut self, id: StubId, data: &[u8]) -> Result<()> {
        let flavor = self.readable(id)?.flavor;
        if !flavor.is_byte_sized() {
            return Err(MemError::WrongFlavor {
                expected: Flavor::Binary,
                found: flavor,
            });
        }
        self.append_raw(id, data)
    }

    /// Append whole elements given as raw bytes to a plain-data record.
    pub(crate) fn append_raw(&mut self, id: StubId, data: &[u8]) -> Result<()> {
        let stub = self.readable(id)?;
        let width = stub.width();
        if stub.flavor.holds_cells() || data.len() % width != 0 {
            return Err(MemError::WrongFlavor {
                expected: Flavor::Binary,
                found: stub.flavor,
            });
        }
        let at = stub.len();

        self.expand(id, at, data.len() / width)?;
        if let Some(stub) = self.arena.get_mut(id) {
            // SAFETY: `expand` made room past the old end.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), stub.data_mut().add(at * width), data.len());
            }
        }
        Ok(())
    }

    /// Make room for `delta` elements at `at`.
    ///
    /// Existing elements keep their order and values. The new region is
    /// filled with blank cells (or zero bytes) so it is safe to read.
    pub fn expand(&mut self, id: StubId, at: usize, delta: usize) -> Result<Growth> {
        let stub = readable_in(&mut self.arena, id)?;
        if stub.flags.contains(StubFlags::FIXED_SIZE) {
            return Err(MemError::FixedSize(id));
        }
        let len = stub.len();
        if at > len {
            return Err(MemError::IndexOutOfRange { index: at, len });
        }

        let terminator = stub.flavor.terminator();
        let growth = match &mut stub.content {
            Content::Dynamic(buffer) => {
                let old_size = buffer.raw().size();
                let growth = buffer.expand(
                    &mut self.pool,
                    &mut self.expansions,
                    id,
                    at,
                    delta,
                    terminator,
                )?;
                if growth == Growth::Reallocated {
                    let new_size = buffer.raw().size();
                    let pooled = buffer.raw().pool().is_pooled();
                    self.stats.record_reallocation();
                    self.stats.record_buffer_freed(old_size);
                    self.stats.record_buffer(new_size, pooled);
                    self.deplete(new_size);
                }
                growth
            }
            Content::Inline { .. } => self.expand_inline(id, at, delta)?,
        };

        self.init_region(id, at, delta);
        self.terminate(id);
        Ok(growth)
    }

    /// Grow inline content: slide within the record, or promote it.
    fn expand_inline(&mut self, id: StubId, at: usize, delta: usize) -> Result<Growth> {
        let stub = readable_in(&mut self.arena, id)?;
        let width = stub.width();
        let len = stub.len();
        let new_len = len.checked_add(delta).ok_or(MemError::SizeOverflow)?;
        let needed = new_len
            .checked_add(stub.flavor.terminator())
            .ok_or(MemError::SizeOverflow)?;

        if needed <= INLINE_BYTES / width {
            // SAFETY: both ranges are inside the inline storage.
            unsafe {
                let base = stub.data_mut();
                std::ptr::copy(base.add(at * width), base.add((at + delta) * width), (len - at) * width);
                stub.set_len(new_len);
            }
            return Ok(Growth::Slid);
        }

        let mut capacity = needed;
        if self.expansions.hit_or_insert(id) {
            capacity = capacity.checked_mul(2).ok_or(MemError::SizeOverflow)?;
        }
        let mut buffer: Buffer = self.new_buffer(width, capacity)?;

        let stub = readable_in(&mut self.arena, id)?;
        // SAFETY: the buffer holds at least `needed` elements.
        unsafe {
            let src = stub.data();
            let dst = buffer.data_mut();
            std::ptr::copy_nonoverlapping(src, dst, at * width);
            std::ptr::copy_nonoverlapping(
                src.add(at * width),
                dst.add((at + delta) * width),
                (len - at) * width,
            );
            buffer.set_len(new_len);
        }
        stub.promote(buffer);
        Ok(Growth::Reallocated)
    }

    /// Ensure room for `capacity` elements without changing the length.
    pub fn ensure_capacity(&mut self, id: StubId, capacity: usize) -> Result<()> {
        let stub = self.readable(id)?;
        let len = stub.len();
        let usable = stub.capacity().saturating_sub(stub.flavor.terminator());
        if capacity <= usable || capacity <= len {
            return Ok(());
        }
        self.expand(id, len, capacity - len)?;
        self.remove_tail(id, capacity - len)
    }

    /// Remove `count` elements from the head.
    ///
    /// Dynamic content only moves its bias, so a later insertion at the
    /// head of no more elements reuses the space without reallocating.
    pub fn remove_head(&mut self, id: StubId, count: usize) -> Result<()> {
        let stub = self.readable_mut(id)?;
        if stub.flags.contains(StubFlags::FIXED_SIZE) {
            return Err(MemError::FixedSize(id));
        }
        let len = stub.len();
        if count > len {
            return Err(MemError::IndexOutOfRange { index: count, len });
        }
        let width = stub.width();

        if let Content::Dynamic(buffer) = &mut stub.content {
            buffer.remove_head(count);
        } else {
            // SAFETY: both ranges are inside the inline storage.
            unsafe {
                let base = stub.data_mut();
                std::ptr::copy(base.add(count * width), base, (len - count) * width);
                stub.set_len(len - count);
            }
        }
        self.terminate(id);
        Ok(())
    }

    /// Remove `count` elements from the tail.
    pub fn remove_tail(&mut self, id: StubId, count: usize) -> Result<()> {
        let stub = self.readable_mut(id)?;
        if stub.flags.contains(StubFlags::FIXED_SIZE) {
            return Err(MemError::FixedSize(id));
        }
        let len = stub.len();
        if count > len {
            return Err(MemError::IndexOutOfRange { index: count, len });
        }
        // SAFETY: shrinking keeps every remaining element initialized.
        unsafe { stub.set_len(len - count) };
        self.terminate(id);
        Ok(())
    }

    /// Exchange the content of two records of the same width.
    ///
    /// Identities, flavors and slots stay put; only payloads (and the
    /// dynamic bit) move. String bookmark caches are dropped.
    pub fn swap_content(&mut self, a: StubId, b: StubId) -> Result<()> {
        let (width_a, fixed_a) = {
            let stub = self.readable(a)?;
            (stub.width(), stub.flags.contains(StubFlags::FIXED_SIZE))
        };
        let (width_b, fixed_b) = {
            let stub = self.readable(b)?;
            (stub.width(), stub.flags.contains(StubFlags::FIXED_SIZE))
        };
        if fixed_a {
            return Err(MemError::FixedSize(a));
        }
        if fixed_b {
            return Err(MemError::FixedSize(b));
        }
        if width_a != width_b {
            return Err(MemError::WidthMismatch(width_a, width_b));
        }
        if a == b {
            return Ok(());
        }

        let content_a = readable_in(&mut self.arena, a)?.take_content();
        let stub_b = readable_in(&mut self.arena, b)?;
        let content_b = std::mem::replace(&mut stub_b.content, content_a);
        let dynamic_b = stub_b.is_dynamic();
        stub_b.flags.set(StubFlags::DYNAMIC, dynamic_b);

        let stub_a = readable_in(&mut self.arena, a)?;
        stub_a.content = content_b;
        let dynamic_a = stub_a.is_dynamic();
        stub_a.flags.set(StubFlags::DYNAMIC, dynamic_a);

        self.expansions.forget(a);
        self.expansions.forget(b);
        self.drop_bookmarks(a);
        self.drop_bookmarks(b);
        self.terminate(a);
        self.terminate(b);
        Ok(())
    }

    // =========================================================================
    // String Bookmarks
    // =========================================================================

    /// Cache a codepoint-index to byte-offset mapping for a string.
    ///
    /// The cache is an unmanaged record owned by the string and released
    /// with it.
    pub fn set_bookmark(&mut self, string: StubId, index: usize, offset: usize) -> Result<()> {
        let stub = self.readable(string)?;
        if stub.flavor != Flavor::String {
            return Err(MemError::WrongFlavor {
                expected: Flavor::String,
                found: stub.flavor,
            });
        }
        let existing = stub.link.node();

        let bookmarks = match existing {
            Some(bookmarks) => bookmarks,
            None => {
                let bookmarks = self.make_series(Flavor::Bookmarks, 2, StubFlags::empty())?;
                self.readable_mut(string)?.set_link(Slot::Node(bookmarks));
                bookmarks
            }
        };

        let stub = self.readable_mut(bookmarks)?;
        // SAFETY: bookmark content always has room for two words inline.
        unsafe {
            let words = stub.data_mut().cast::<usize>();
            std::ptr::write(words, index);
            std::ptr::write(words.add(1), offset);
            stub.set_len(2);
        }
        Ok(())
    }

    /// The cached `(index, offset)` bookmark of a string, if any.
    pub fn bookmark(&self, string: StubId) -> Result<Option<(usize, usize)>> {
        let stub = self.readable(string)?;
        if stub.flavor != Flavor::String {
            return Err(MemError::WrongFlavor {
                expected: Flavor::String,
                found: stub.flavor,
            });
        }
        let Some(bookmarks) = stub.link.node() else {
            return Ok(None);
        };
        let cache = self.readable(bookmarks)?;
        if cache.len() < 2 {
            return Ok(None);
        }
        // SAFETY: two initialized words.
        let pair = unsafe {
            let words = cache.data().cast::<usize>();
            (std::ptr::read(words), std::ptr::read(words.add(1)))
        };
        Ok(Some(pair))
    }

    fn drop_bookmarks(&mut self, id: StubId) {
        let bookmarks = match self.arena.get_mut(id) {
            Some(stub) if stub.flavor == Flavor::String => {
                let node = stub.link.node();
                stub.set_link(Slot::Empty);
                node
            }
            _ => None,
        };
        if let Some(bookmarks) = bookmarks {
            self.release(bookmarks);
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Fill `delta` freshly inserted elements at `at`.
    fn init_region(&mut self, id: StubId, at: usize, delta: usize) {
        let Some(stub) = self.arena.get_mut(id) else {
            return;
        };
        let width = stub.width();
        // SAFETY: the region was just reserved by `expand`.
        unsafe {
            if stub.flavor.holds_cells() {
                let cells = stub.data_mut().cast::<Cell>().add(at);
                for offset in 0..delta {
                    std::ptr::write(cells.add(offset), Cell::blank());
                }
            } else {
                std::ptr::write_bytes(stub.data_mut().add(at * width), 0, delta * width);
            }
        }
    }

    /// Rewrite the zero terminator of a byte-sized record.
    pub(crate) fn terminate(&mut self, id: StubId) {
        if let Some(stub) = self.arena.get_mut(id) {
            if stub.flavor.is_byte_sized() && stub.len() < stub.capacity() {
                // SAFETY: byte flavors always reserve one unit past the end.
                unsafe { *stub.data_mut().add(stub.len()) = 0 };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_promotes_past_inline() {
        let mut heap = Heap::with_defaults();
        let id = heap.make_array(0, StubFlags::empty()).unwrap();
        for n in 0..5 {
            heap.push_cell(id, Cell::integer(n)).unwrap();
        }
        assert!(heap.stub(id).unwrap().is_dynamic());
        for n in 0..5 {
            assert_eq!(heap.cell_at(id, n as usize).unwrap(), Cell::integer(n));
        }
    }

    #[test]
    fn test_insert_in_middle() {
        let mut heap = Heap::with_defaults();
        let id = heap
            .make_array_from(&[Cell::integer(1), Cell::integer(4)], StubFlags::empty()).unwrap();
        heap.insert_cells(id, 1, &[Cell::integer(2), Cell::integer(3)]).unwrap();
        let values: Vec<_> = (0..4).map(|i| heap.cell_at(id, i).unwrap()).collect();
        assert_eq!(
            values,
            vec![Cell::integer(1), Cell::integer(2), Cell::integer(3), Cell::integer(4)]
        );
    }

    #[test]
    fn test_expand_fills_blanks() {
        let mut heap = Heap::with_defaults();
        let id = heap.make_array_from(&[Cell::integer(9)], StubFlags::empty()).unwrap();
        heap.expand(id, 0, 3).unwrap();
        assert_eq!(heap.len(id).unwrap(), 4);
        assert_eq!(heap.cell_at(id, 0).unwrap(), Cell::blank());
        assert_eq!(heap.cell_at(id, 3).unwrap(), Cell::integer(9));
    }

    #[test]
    fn test_remove_head_inline_and_dynamic() {
        let mut heap = Heap::with_defaults();
        let id = heap.make_bytes(b"abc", StubFlags::empty()).unwrap();
        heap.remove_head(id, 1).unwrap();
        assert_eq!(heap.bytes(id).unwrap(), b"bc");

        let big: Vec<u8> = (0..200).collect();
        let id = heap.make_bytes(&big, StubFlags::empty()).unwrap();
        heap.remove_head(id, 100).unwrap();
        assert_eq!(heap.stub(id).unwrap().buffer().unwrap().bias(), 100);
        assert_eq!(heap.bytes(id).unwrap(), &big[100..]);
    }

    #[test]
    fn test_out_of_range() {
        let mut heap = Heap::with_defaults();
        let id = heap.make_array(0, StubFlags::empty()).unwrap();
        assert_eq!(
            heap.cell_at(id, 0),
            Err(MemError::IndexOutOfRange { index: 0, len: 0 })
        );
        assert_eq!(
            heap.remove_tail(id, 1),
            Err(MemError::IndexOutOfRange { index: 1, len: 0 })
        );
    }

    #[test]
    fn test_fixed_size_refuses_growth() {
        let mut heap = Heap::with_defaults();
        let pair = heap
            .make_pairing(Cell::integer(1), Cell::integer(2), StubFlags::empty()).unwrap();
        assert_eq!(heap.push_cell(pair, Cell::blank()), Err(MemError::FixedSize(pair)));
    }

    #[test]
    fn test_ensure_capacity_keeps_length() {
        let mut heap = Heap::with_defaults();
        let id = heap.make_array_from(&[Cell::integer(1)], StubFlags::empty()).unwrap();
        heap.ensure_capacity(id, 50).unwrap();
        let stub = heap.stub(id).unwrap();
        assert_eq!(stub.len(), 1);
        assert!(stub.capacity() >= 50);
    }

    #[test]
    fn test_swap_content() {
        let mut heap = Heap::with_defaults();
        let small = heap.make_bytes(b"hi", StubFlags::empty()).unwrap();
        let big_data = vec![7u8; 500];
        let big = heap.make_bytes(&big_data, StubFlags::empty()).unwrap();

        heap.swap_content(small, big).unwrap();
        assert_eq!(heap.bytes(small).unwrap(), &big_data[..]);
        assert_eq!(heap.bytes(big).unwrap(), b"hi");
        assert!(heap.stub(small).unwrap().flags().contains(StubFlags::DYNAMIC));
        assert!(!heap.stub(big).unwrap().flags().contains(StubFlags::DYNAMIC));
    }

    #[test]
    fn test_swap_width_mismatch() {
        let mut heap = Heap::with_defaults();
        let bytes = heap.make_bytes(b"x", StubFlags::empty()).unwrap();
        let array = heap.make_array(1, StubFlags::empty()).unwrap();
        assert!(matches!(
            heap.swap_content(bytes, array),
            Err(MemError::WidthMismatch(..))
        ));
    }

    #[test]
    fn test_bookmarks() {
        let mut heap = Heap::with_defaults();
        let s = heap.make_string("héllo", StubFlags::empty()).unwrap();
        assert_eq!(heap.bookmark(s).unwrap(), None);

        heap.set_bookmark(s, 2, 3).unwrap();
        assert_eq!(heap.bookmark(s).unwrap(), Some((2, 3)));
        assert_eq!(heap.stub_count(), 2);

        heap.free_unmanaged(s).unwrap();
        assert_eq!(heap.stub_count(), 0);
    }
}
