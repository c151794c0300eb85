//! Guard list, data stack and root scopes.
//!
//! Native code that holds references across an allocation pushes them
//! here so a collection cannot reclaim them. Guards are strictly LIFO.

use super::Heap;
use crate::cell::Cell;
use crate::error::{integrity_failure, Result};
use crate::roots::RootScopeId;
use crate::stub::StubId;

/// An entry on the guard list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guarded {
    /// A record; unmanaged records have their contents kept alive.
    Stub(StubId),
    /// A value; its referenced records are kept alive.
    Cell(Cell),
}

impl Heap {
    // =========================================================================
    // Guards
    // =========================================================================

    /// Keep a record alive until the matching [`drop_guard_stub`](Self::drop_guard_stub).
    pub fn push_guard_stub(&mut self, id: StubId) -> Result<()> {
        self.stub(id)?;
        self.guards.push(Guarded::Stub(id));
        Ok(())
    }

    /// Keep a value's referents alive until the matching [`drop_guard`](Self::drop_guard).
    pub fn push_guard_cell(&mut self, cell: Cell) {
        self.guards.push(Guarded::Cell(cell));
    }

    /// Pop the most recent guard.
    pub fn drop_guard(&mut self) -> Option<Guarded> {
        self.guards.pop()
    }

    /// Pop the most recent guard, which must be `id`.
    ///
    /// A guarded reference may have been canonicalized by a collection in
    /// the meantime, so the canonical record also matches.
    pub fn drop_guard_stub(&mut self, id: StubId) {
        match self.guards.last().copied() {
            Some(Guarded::Stub(top)) if top == id || top == self.inaccessible => {
                self.guards.pop();
            }
            other => integrity_failure(
                "guard order",
                format_args!("dropping guard for {id}, top of list is {other:?}"),
            ),
        }
    }

    /// Entries on the guard list.
    #[inline]
    pub fn guard_depth(&self) -> usize {
        self.guards.len()
    }

    // =========================================================================
    // Data Stack
    // =========================================================================

    /// Push an in-flight value.
    pub fn push_data(&mut self, cell: Cell) {
        self.data_stack.push(cell);
    }

    /// Pop the most recent in-flight value.
    pub fn pop_data(&mut self) -> Option<Cell> {
        self.data_stack.pop()
    }

    /// Depth of the data stack.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data_stack.len()
    }

    /// Truncate the data stack to `len` entries.
    pub fn drop_data_to(&mut self, len: usize) {
        self.data_stack.truncate(len);
    }

    /// Value at `index` from the bottom, as rewritten by the last collection.
    pub fn data_at(&self, index: usize) -> Option<Cell> {
        self.data_stack.get(index).copied()
    }

    // =========================================================================
    // Root Scopes
    // =========================================================================

    /// Open a scope that can own API roots.
    pub fn open_root_scope(&mut self) -> RootScopeId {
        self.scopes.open()
    }

    /// Close a scope.
    ///
    /// Roots it still owns are released at the next collection when
    /// `auto_release_expired_roots` is set, and are an integrity failure
    /// otherwise.
    pub fn close_root_scope(&mut self, scope: RootScopeId) -> Result<()> {
        self.scopes.close(scope)
    }

    /// Whether a scope is still open.
    #[inline]
    pub fn is_scope_open(&self, scope: RootScopeId) -> bool {
        self.scopes.is_open(scope)
    }

    /// Number of open root scopes.
    pub fn root_scope_count(&self) -> usize {
        self.scopes.len()
    }
}
