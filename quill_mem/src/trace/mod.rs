//! Reference tracing.
//!
//! The [`Tracer`] is the interface between anything that holds references
//! to header records and the collector. Tracers receive references by
//! `&mut` so the marker can rewrite a dangling reference in place to the
//! canonical inaccessible record.

use crate::cell::Cell;
use crate::stub::StubId;

/// Visitor for references held outside the heap (or copied out of it).
pub trait Tracer {
    /// Visit one reference. The tracer may rewrite it.
    fn trace_stub(&mut self, id: &mut StubId);

    /// Visit every followable reference of a cell.
    ///
    /// Only fields flagged by the cell kind's marking table are visited.
    fn trace_cell(&mut self, cell: &mut Cell) {
        cell.for_each_node_mut(|id| self.trace_stub(id));
    }
}

/// Types that hold references and can report them to a [`Tracer`].
///
/// # Example
///
/// ```ignore
/// use quill_mem::{Cell, Trace, Tracer};
///
/// struct Frame {
///     args: Vec<Cell>,
///     out: Cell,
/// }
///
/// impl Trace for Frame {
///     fn trace(&mut self, tracer: &mut dyn Tracer) {
///         self.args.trace(tracer);
///         tracer.trace_cell(&mut self.out);
///     }
/// }
/// ```
pub trait Trace {
    /// Report every reference held.
    fn trace(&mut self, tracer: &mut dyn Tracer);
}

// =============================================================================
// Trace implementations
// =============================================================================

impl Trace for () {
    #[inline]
    fn trace(&mut self, _tracer: &mut dyn Tracer) {}
}

impl Trace for Cell {
    #[inline]
    fn trace(&mut self, tracer: &mut dyn Tracer) {
        tracer.trace_cell(self);
    }
}

impl Trace for StubId {
    #[inline]
    fn trace(&mut self, tracer: &mut dyn Tracer) {
        tracer.trace_stub(self);
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&mut self, tracer: &mut dyn Tracer) {
        if let Some(inner) = self {
            inner.trace(tracer);
        }
    }
}

impl<T: Trace> Trace for [T] {
    fn trace(&mut self, tracer: &mut dyn Tracer) {
        for item in self {
            item.trace(tracer);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&mut self, tracer: &mut dyn Tracer) {
        self.as_mut_slice().trace(tracer);
    }
}

impl<T: Trace + ?Sized> Trace for Box<T> {
    fn trace(&mut self, tracer: &mut dyn Tracer) {
        (**self).trace(tracer);
    }
}

// =============================================================================
// Utility tracers
// =============================================================================

/// A tracer that does nothing.
pub struct NullTracer;

impl Tracer for NullTracer {
    #[inline]
    fn trace_stub(&mut self, _id: &mut StubId) {}
}

/// A tracer that counts what it sees.
#[derive(Debug, Default)]
pub struct CountingTracer {
    /// Cells visited.
    pub cells: usize,
    /// References visited.
    pub stubs: usize,
}

impl CountingTracer {
    /// Create a new counting tracer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for CountingTracer {
    fn trace_stub(&mut self, _id: &mut StubId) {
        self.stubs += 1;
    }

    fn trace_cell(&mut self, cell: &mut Cell) {
        self.cells += 1;
        cell.for_each_node_mut(|_| self.stubs += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_report_no_references() {
        let mut tracer = CountingTracer::new();
        let mut values = vec![Cell::integer(1), Cell::logic(false), Cell::blank()];
        values.trace(&mut tracer);
        assert_eq!(tracer.cells, 3);
        assert_eq!(tracer.stubs, 0);
    }

    #[test]
    fn test_container_trace() {
        let a = StubId::new(1, 0);
        let b = StubId::new(2, 0);
        let mut tracer = CountingTracer::new();

        let mut values = vec![Cell::block(a, 0), Cell::word(b, Some(a))];
        values.trace(&mut tracer);
        assert_eq!(tracer.stubs, 3);

        let mut maybe: Option<StubId> = Some(b);
        maybe.trace(&mut tracer);
        assert_eq!(tracer.stubs, 4);
    }

    #[test]
    fn test_rewriting_tracer() {
        struct Redirect(StubId);
        impl Tracer for Redirect {
            fn trace_stub(&mut self, id: &mut StubId) {
                *id = self.0;
            }
        }

        let target = StubId::new(9, 9);
        let mut cell = Cell::text(StubId::new(1, 0), 2);
        cell.trace(&mut Redirect(target));
        assert_eq!(cell.series(), Some(target));
    }

    #[test]
    fn test_null_tracer() {
        let mut cell = Cell::block(StubId::new(3, 0), 0);
        cell.trace(&mut NullTracer);
        assert_eq!(cell.series(), Some(StubId::new(3, 0)));
    }
}
