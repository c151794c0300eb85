//! Construction helpers for each flavor.

use super::Heap;
use crate::cell::Cell;
use crate::cleanup::CleanupFn;
use crate::error::{MemError, Result};
use crate::roots::RootScopeId;
use crate::stub::{Flavor, Slot, StubFlags, StubId, INLINE_BYTES};

impl Heap {
    /// Allocate a record with room for `capacity` elements.
    ///
    /// Content stays inline when it fits; otherwise a buffer is allocated
    /// up front. Byte flavors reserve a terminator past `capacity`.
    pub fn make_series(
        &mut self,
        flavor: Flavor,
        capacity: usize,
        flags: StubFlags,
    ) -> Result<StubId> {
        let width = flavor.width();
        let needed = capacity
            .checked_add(flavor.terminator())
            .ok_or(MemError::SizeOverflow)?;

        let id = self.alloc_stub(flavor, flags)?;
        if needed > INLINE_BYTES / width {
            match self.new_buffer(width, needed) {
                Ok(buffer) => {
                    if let Some(stub) = self.arena.get_mut(id) {
                        stub.promote(buffer);
                    }
                }
                Err(err) => {
                    self.release(id);
                    return Err(err);
                }
            }
        }
        self.terminate(id);
        Ok(id)
    }

    /// Allocate an array with room for `capacity` cells.
    pub fn make_array(&mut self, capacity: usize, flags: StubFlags) -> Result<StubId> {
        self.make_series(Flavor::Array, capacity, flags)
    }

    /// Allocate an array holding a copy of `cells`.
    pub fn make_array_from(&mut self, cells: &[Cell], flags: StubFlags) -> Result<StubId> {
        self.make_filled(Flavor::Array, cells, flags)
    }

    /// Allocate a binary holding a copy of `data`.
    pub fn make_bytes(&mut self, data: &[u8], flags: StubFlags) -> Result<StubId> {
        let id = self.make_series(Flavor::Binary, data.len(), flags)?;
        self.fill_raw(id, data);
        Ok(id)
    }

    /// Allocate a string holding a copy of `text`.
    pub fn make_string(&mut self, text: &str, flags: StubFlags) -> Result<StubId> {
        let id = self.make_series(Flavor::String, text.len(), flags)?;
        self.fill_raw(id, text.as_bytes());
        Ok(id)
    }

    /// Allocate a managed symbol spelling.
    pub fn make_symbol(&mut self, name: &str) -> Result<StubId> {
        let id = self.make_series(Flavor::Symbol, name.len(), StubFlags::MANAGED)?;
        self.fill_raw(id, name.as_bytes());
        Ok(id)
    }

    /// Allocate a keylist of `keys`, optionally inheriting from `ancestor`.
    pub fn make_keylist(
        &mut self,
        keys: &[StubId],
        ancestor: Option<StubId>,
        flags: StubFlags,
    ) -> Result<StubId> {
        let cells: Vec<Cell> = keys.iter().map(|&key| Cell::word(key, None)).collect();
        let id = self.make_filled(Flavor::Keylist, &cells, flags)?;
        self.set_link(id, Slot::from_node(ancestor))?;
        Ok(id)
    }

    /// Allocate a varlist for `keylist` holding `values`.
    ///
    /// Slot 0 is the archetype, an object cell referring to the varlist
    /// itself, so values start at index 1.
    pub fn make_varlist(
        &mut self,
        keylist: StubId,
        values: &[Cell],
        flags: StubFlags,
    ) -> Result<StubId> {
        let id = self.make_series(Flavor::Varlist, values.len() + 1, flags)?;
        let mut cells = Vec::with_capacity(values.len() + 1);
        cells.push(Cell::object(id));
        cells.extend_from_slice(values);
        self.fill_cells(id, &cells);
        self.set_link(id, Slot::Node(keylist))?;
        Ok(id)
    }

    /// Allocate the details array of a callable.
    pub fn make_details(&mut self, cells: &[Cell], flags: StubFlags) -> Result<StubId> {
        self.make_filled(Flavor::Details, cells, flags)
    }

    /// Allocate a paramlist.
    ///
    /// Slot 0 is the archetype. `link` is the underlying paramlist, which
    /// is the paramlist itself when `underlying` is `None`; `misc` holds
    /// the details array.
    pub fn make_paramlist(
        &mut self,
        params: &[Cell],
        details: StubId,
        underlying: Option<StubId>,
        flags: StubFlags,
    ) -> Result<StubId> {
        let id = self.make_series(Flavor::Paramlist, params.len() + 1, flags)?;
        let mut cells = Vec::with_capacity(params.len() + 1);
        cells.push(Cell::action(id, None));
        cells.extend_from_slice(params);
        self.fill_cells(id, &cells);

        let stub = self.readable_mut(id)?;
        stub.set_link(Slot::Node(underlying.unwrap_or(id)));
        stub.set_misc(Slot::Node(details));
        Ok(id)
    }

    /// Attach (or clear) the meta context of a varlist or paramlist.
    pub fn set_meta(&mut self, id: StubId, meta: Option<StubId>) -> Result<()> {
        let stub = self.readable_mut(id)?;
        match stub.flavor {
            Flavor::Varlist => stub.set_misc(Slot::from_node(meta)),
            Flavor::Paramlist => stub.set_info(Slot::from_node(meta)),
            found => {
                return Err(MemError::WrongFlavor {
                    expected: Flavor::Varlist,
                    found,
                })
            }
        }
        Ok(())
    }

    /// The meta context of a varlist or paramlist.
    pub fn meta(&self, id: StubId) -> Result<Option<StubId>> {
        let stub = self.readable(id)?;
        match stub.flavor {
            Flavor::Varlist => Ok(stub.misc.node()),
            Flavor::Paramlist => Ok(stub.info.node()),
            found => Err(MemError::WrongFlavor {
                expected: Flavor::Varlist,
                found,
            }),
        }
    }

    /// Allocate a map: a managed pairlist linked to a managed hash index.
    pub fn make_map(&mut self, capacity: usize) -> Result<StubId> {
        let hashlist = self.make_series(Flavor::Hashlist, capacity, StubFlags::MANAGED)?;
        let pairlist = match self.make_series(
            Flavor::Pairlist,
            capacity.saturating_mul(2),
            StubFlags::MANAGED,
        ) {
            Ok(id) => id,
            Err(err) => {
                self.release(hashlist);
                return Err(err);
            }
        };
        self.set_link(pairlist, Slot::Node(hashlist))?;
        Ok(pairlist)
    }

    /// Append a key/value pair to a map and index it.
    pub fn map_insert(&mut self, pairlist: StubId, key: Cell, value: Cell) -> Result<()> {
        let stub = self.readable(pairlist)?;
        if stub.flavor != Flavor::Pairlist {
            return Err(MemError::WrongFlavor {
                expected: Flavor::Pairlist,
                found: stub.flavor,
            });
        }
        let position = stub.len();
        let hashlist = stub.link.node();

        // Reserve the index entry first so a failed insert changes nothing.
        if let Some(hashlist) = hashlist {
            let entries = self.len(hashlist)?;
            self.ensure_capacity(hashlist, entries + 1)?;
        }
        self.insert_cells(pairlist, position, &[key, value])?;
        if let Some(hashlist) = hashlist {
            let slot = u32::try_from(position / 2).map_err(|_| MemError::SizeOverflow)?;
            self.append_raw(hashlist, &slot.to_ne_bytes())?;
        }
        Ok(())
    }

    /// Number of pairs in a map.
    pub fn map_len(&self, pairlist: StubId) -> Result<usize> {
        self.len(pairlist).map(|len| len / 2)
    }

    /// Allocate a pairing of two cells.
    pub fn make_pairing(&mut self, key: Cell, value: Cell, flags: StubFlags) -> Result<StubId> {
        self.make_filled(Flavor::Pairing, &[key, value], flags)
    }

    /// Allocate a handle wrapping a foreign resource.
    ///
    /// `cleaner` runs exactly once with `(ptr, len)` when the handle dies.
    pub fn make_handle(
        &mut self,
        ptr: *mut u8,
        len: usize,
        cleaner: Option<CleanupFn>,
        flags: StubFlags,
    ) -> Result<StubId> {
        let id = self.make_series(Flavor::Handle, 2, flags)?;
        let stub = self.readable_mut(id)?;
        // SAFETY: handle content always has room for two words inline.
        unsafe {
            let words = stub.data_mut().cast::<usize>();
            std::ptr::write(words, ptr as usize);
            std::ptr::write(words.add(1), len);
            stub.set_len(2);
        }
        if let Some(cleaner) = cleaner {
            stub.set_info(Slot::Cleaner(cleaner));
        }
        Ok(id)
    }

    /// The `(pointer, length)` wrapped by a handle.
    pub fn handle_data(&self, id: StubId) -> Result<(*mut u8, usize)> {
        let stub = self.readable(id)?;
        if stub.flavor != Flavor::Handle {
            return Err(MemError::WrongFlavor {
                expected: Flavor::Handle,
                found: stub.flavor,
            });
        }
        Ok(super::handle_parts(stub))
    }

    /// Allocate an API root holding `value`, owned by `scope`.
    pub fn make_api_root(&mut self, value: Cell, scope: RootScopeId) -> Result<StubId> {
        if !self.scopes.is_open(scope) {
            return Err(MemError::ScopeClosed(scope.raw()));
        }
        let id = self.make_filled(Flavor::Api, &[value], StubFlags::MANAGED | StubFlags::ROOT)?;
        self.readable_mut(id)?.set_link(Slot::Scope(scope));
        Ok(id)
    }

    /// The value held by an API root.
    pub fn api_value(&self, id: StubId) -> Result<Cell> {
        self.cell_at(id, 0)
    }

    /// Free an API root explicitly.
    pub fn release_api_root(&mut self, id: StubId) -> Result<()> {
        let stub = self.stub(id)?;
        if stub.flavor != Flavor::Api {
            return Err(MemError::WrongFlavor {
                expected: Flavor::Api,
                found: stub.flavor,
            });
        }
        self.release(id);
        Ok(())
    }

    fn make_filled(&mut self, flavor: Flavor, cells: &[Cell], flags: StubFlags) -> Result<StubId> {
        let id = self.make_series(flavor, cells.len(), flags)?;
        self.fill_cells(id, cells);
        Ok(id)
    }

    /// Write `cells` into a fresh record sized for them.
    fn fill_cells(&mut self, id: StubId, cells: &[Cell]) {
        if let Some(stub) = self.arena.get_mut(id) {
            debug_assert!(stub.flavor.holds_cells() && cells.len() <= stub.capacity());
            // SAFETY: capacity was reserved by `make_series`.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    cells.as_ptr(),
                    stub.data_mut().cast::<Cell>(),
                    cells.len(),
                );
                stub.set_len(cells.len());
            }
        }
    }

    /// Write raw bytes into a fresh record sized for them.
    fn fill_raw(&mut self, id: StubId, data: &[u8]) {
        if let Some(stub) = self.arena.get_mut(id) {
            debug_assert!(data.len() + stub.flavor.terminator() <= stub.capacity() * stub.width());
            // SAFETY: capacity was reserved by `make_series`.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), stub.data_mut(), data.len());
                stub.set_len(data.len() / stub.width());
            }
        }
        self.terminate(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemConfig;

    #[test]
    fn test_small_array_stays_inline() {
        let mut heap = Heap::with_defaults();
        let id = heap.make_array(2, StubFlags::empty()).unwrap();
        assert!(!heap.stub(id).unwrap().is_dynamic());

        let big = heap.make_array(5, StubFlags::empty()).unwrap();
        assert!(heap.stub(big).unwrap().is_dynamic());
        assert!(heap.stub(big).unwrap().flags().contains(StubFlags::DYNAMIC));
    }

    #[test]
    fn test_string_is_terminated() {
        let mut heap = Heap::with_defaults();
        let id = heap.make_string("hello", StubFlags::empty()).unwrap();
        assert_eq!(heap.bytes(id).unwrap(), b"hello");
        let stub = heap.stub(id).unwrap();
        assert_eq!(unsafe { *stub.data().add(5) }, 0);
    }

    #[test]
    fn test_varlist_archetype() {
        let mut heap = Heap::with_defaults();
        let sym = heap.make_symbol("x").unwrap();
        let keys = heap.make_keylist(&[sym], None, StubFlags::MANAGED).unwrap();
        let ctx = heap
            .make_varlist(keys, &[Cell::integer(1)], StubFlags::MANAGED).unwrap();

        assert_eq!(heap.cell_at(ctx, 0).unwrap(), Cell::object(ctx));
        assert_eq!(heap.cell_at(ctx, 1).unwrap(), Cell::integer(1));
        assert_eq!(heap.link(ctx).unwrap().node(), Some(keys));
        assert!(heap
            .stub(ctx).unwrap()
            .flags()
            .contains(StubFlags::LINK_NEEDS_MARK));
    }

    #[test]
    fn test_paramlist_links() {
        let mut heap = Heap::with_defaults();
        let details = heap.make_details(&[Cell::integer(0)], StubFlags::MANAGED).unwrap();
        let params = heap
            .make_paramlist(&[], details, None, StubFlags::MANAGED).unwrap();

        assert_eq!(heap.link(params).unwrap().node(), Some(params));
        assert_eq!(heap.misc(params).unwrap().node(), Some(details));
        assert_eq!(heap.meta(params).unwrap(), None);
    }

    #[test]
    fn test_map_insert_indexes() {
        let mut heap = Heap::with_defaults();
        let map = heap.make_map(4).unwrap();
        heap.map_insert(map, Cell::integer(1), Cell::integer(10)).unwrap();
        heap.map_insert(map, Cell::integer(2), Cell::integer(20)).unwrap();

        assert_eq!(heap.map_len(map).unwrap(), 2);
        let hashlist = heap.link(map).unwrap().node().unwrap();
        assert_eq!(heap.len(hashlist).unwrap(), 2);
        assert!(heap.is_managed(hashlist));
    }

    #[test]
    fn test_failed_map_insert_leaves_map_unchanged() {
        let mut failures = 0;
        for pairs in 1..48i64 {
            let config = MemConfig {
                usage_limit: 64 * 1024,
                ..Default::default()
            };
            let mut heap = Heap::new(config).unwrap();
            let map = heap.make_map(0).unwrap();
            let hashlist = heap.link(map).unwrap().node().unwrap();
            for n in 0..pairs {
                heap.map_insert(map, Cell::integer(n), Cell::integer(n)).unwrap();
            }

            // Use up the limit so any growth fails.
            let mut filler = Vec::new();
            while let Ok(alloc) = heap.alloc_buffer(16) {
                filler.push(alloc);
            }

            let expected = match heap.map_insert(map, Cell::integer(-1), Cell::integer(-1)) {
                Ok(()) => pairs as usize + 1,
                Err(err) => {
                    assert!(err.is_out_of_memory());
                    failures += 1;
                    pairs as usize
                }
            };
            assert_eq!(heap.map_len(map).unwrap(), expected);
            assert_eq!(heap.len(hashlist).unwrap(), expected);

            for alloc in filler {
                heap.free_buffer(alloc);
            }
        }
        assert!(failures > 0);
    }

    #[test]
    fn test_handle_data() {
        let mut heap = Heap::with_defaults();
        let mut resource = [1u8, 2, 3];
        let id = heap
            .make_handle(resource.as_mut_ptr(), 3, None, StubFlags::empty()).unwrap();
        assert_eq!(
            heap.handle_data(id).unwrap(),
            (resource.as_mut_ptr(), 3)
        );
        heap.free_unmanaged(id).unwrap();
    }

    #[test]
    fn test_api_root_requires_open_scope() {
        let mut heap = Heap::with_defaults();
        let scope = heap.open_root_scope();
        let id = heap.make_api_root(Cell::integer(5), scope).unwrap();
        assert!(heap.stub(id).unwrap().is_root());
        assert_eq!(heap.api_value(id).unwrap(), Cell::integer(5));

        heap.close_root_scope(scope).unwrap();
        assert_eq!(
            heap.make_api_root(Cell::blank(), scope),
            Err(MemError::ScopeClosed(scope.raw()))
        );
        heap.release_api_root(id).unwrap();
        assert!(!heap.is_live(id));
    }
}
