//! Root tracking.
//!
//! GC roots are the starting points for marking:
//! - API records flagged `ROOT`, each owned by a root scope
//! - The guard list and data stack kept by the heap
//! - Whatever a [`RootProvider`] reports (call-stack frames, globals)

use crate::cell::Cell;
use crate::error::{MemError, Result};
use crate::stub::StubId;
use crate::trace::{Trace, Tracer};
use rustc_hash::FxHashSet;
use std::fmt;

/// Identifies a scope that owns API roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootScopeId(u32);

impl RootScopeId {
    /// Raw scope number.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RootScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope {}", self.0)
    }
}

/// Open root scopes.
#[derive(Debug, Default)]
pub(crate) struct ScopeTable {
    open: FxHashSet<u32>,
    next: u32,
}

impl ScopeTable {
    /// Open a new scope.
    pub fn open(&mut self) -> RootScopeId {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        self.open.insert(id);
        RootScopeId(id)
    }

    /// Close a scope. Its roots become eligible for release.
    pub fn close(&mut self, scope: RootScopeId) -> Result<()> {
        if self.open.remove(&scope.0) {
            Ok(())
        } else {
            Err(MemError::ScopeClosed(scope.0))
        }
    }

    /// Whether the scope is still open.
    #[inline]
    pub fn is_open(&self, scope: RootScopeId) -> bool {
        self.open.contains(&scope.0)
    }

    /// Number of open scopes.
    pub fn len(&self) -> usize {
        self.open.len()
    }
}

/// Something that can enumerate roots for a collection.
///
/// The evaluator implements this over its live frames; the collector
/// calls it once per cycle.
pub trait RootProvider {
    /// Report every root held by this provider.
    fn trace_roots(&mut self, tracer: &mut dyn Tracer);
}

impl RootProvider for () {
    #[inline]
    fn trace_roots(&mut self, _tracer: &mut dyn Tracer) {}
}

impl RootProvider for [Cell] {
    fn trace_roots(&mut self, tracer: &mut dyn Tracer) {
        self.trace(tracer);
    }
}

impl RootProvider for Vec<Cell> {
    fn trace_roots(&mut self, tracer: &mut dyn Tracer) {
        self.trace(tracer);
    }
}

/// A simple root set: global values and pinned records.
#[derive(Debug, Default)]
pub struct RootSet {
    /// Global values (module variables, builtins).
    globals: Vec<Cell>,
    /// Records held directly.
    stubs: Vec<StubId>,
}

impl RootSet {
    /// Create a new empty root set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global root.
    pub fn add_global(&mut self, value: Cell) {
        self.globals.push(value);
    }

    /// Pin a record.
    pub fn add_stub(&mut self, id: StubId) {
        self.stubs.push(id);
    }

    /// Unpin a record.
    pub fn remove_stub(&mut self, id: StubId) {
        self.stubs.retain(|s| *s != id);
    }

    /// Current globals, after any canonicalization by the last collection.
    pub fn globals(&self) -> &[Cell] {
        &self.globals
    }

    /// Current pinned records.
    pub fn stubs(&self) -> &[StubId] {
        &self.stubs
    }

    /// Clear all roots (for reset/shutdown).
    pub fn clear(&mut self) {
        self.globals.clear();
        self.stubs.clear();
    }

    /// Get number of global roots.
    pub fn global_count(&self) -> usize {
        self.globals.len()
    }
}

impl RootProvider for RootSet {
    fn trace_roots(&mut self, tracer: &mut dyn Tracer) {
        self.globals.trace(tracer);
        self.stubs.trace(tracer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CountingTracer;

    #[test]
    fn test_scope_lifecycle() {
        let mut scopes = ScopeTable::default();
        let a = scopes.open();
        let b = scopes.open();
        assert_ne!(a, b);
        assert!(scopes.is_open(a));

        scopes.close(a).unwrap();
        assert!(!scopes.is_open(a));
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes.close(a), Err(MemError::ScopeClosed(a.raw())));
    }

    #[test]
    fn test_root_set_trace() {
        let mut roots = RootSet::new();
        roots.add_global(Cell::integer(42));
        roots.add_global(Cell::block(StubId::new(1, 0), 0));
        roots.add_stub(StubId::new(2, 0));

        let mut tracer = CountingTracer::new();
        roots.trace_roots(&mut tracer);
        assert_eq!(tracer.cells, 2);
        assert_eq!(tracer.stubs, 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut roots = RootSet::new();
        roots.add_stub(StubId::new(1, 0));
        roots.add_stub(StubId::new(2, 0));
        roots.remove_stub(StubId::new(1, 0));
        assert_eq!(roots.stubs(), &[StubId::new(2, 0)]);

        roots.add_global(Cell::integer(1));
        roots.clear();
        assert_eq!(roots.global_count(), 0);
        assert!(roots.stubs().is_empty());
    }
}
