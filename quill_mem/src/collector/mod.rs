//! Mark-sweep collection.
//!
//! A cycle runs `Idle → Marking → Sweeping → Idle`:
//!
//! 1. Root enumeration: API roots (`ROOT` records whose scope is open),
//!    the guard list, the data stack, and whatever the caller's
//!    [`RootProvider`] reports.
//! 2. Propagation: breadth-first over the worklist (see [`mark`]).
//!    References to freed or decayed records are rewritten to the
//!    canonical inaccessible record.
//! 3. Sweep: unmarked managed records are torn down and freed, survivors
//!    have their mark cleared. Unmanaged records are never touched.
//!
//! After every cycle the depletion counter is reset to the configured
//! ballast, whatever was reclaimed.

mod mark;
mod sweep;

use crate::error::integrity_failure;
use crate::heap::{Guarded, Heap};
use crate::roots::RootProvider;
use crate::stats::GcTimer;
use crate::stub::{Slot, StubId};
use crate::trace::Trace;
use mark::Marker;
use rustc_hash::FxHashSet;
use std::time::Duration;

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    /// No collection running.
    Idle,
    /// Tracing from roots.
    Marking,
    /// Freeing unmarked records.
    Sweeping,
}

/// What a cycle does with unreachable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// Free them.
    Normal,
    /// List them without freeing anything or rewriting references.
    Report,
    /// The mutator is tearing down: honor only API roots.
    Shutdown,
}

/// Result of one collection cycle.
#[derive(Debug, Clone, Default)]
pub struct CollectOutcome {
    /// Records freed (or, in report mode, that would have been).
    pub reclaimed: usize,
    /// Managed records that survived.
    pub survivors: usize,
    /// Records marked during propagation.
    pub marked: usize,
    /// References rewritten to the canonical inaccessible record.
    pub canonicalized: usize,
    /// Would-be-swept records (report mode only).
    pub candidates: Vec<StubId>,
    /// Wall time of the cycle.
    pub pause: Duration,
}

impl Heap {
    /// Run a full collection with no external roots.
    ///
    /// Returns the number of records reclaimed.
    pub fn collect(&mut self) -> usize {
        self.collect_with(&mut ())
    }

    /// Run a full collection, tracing `roots` as well.
    pub fn collect_with(&mut self, roots: &mut dyn RootProvider) -> usize {
        self.collect_full(CollectMode::Normal, roots).reclaimed
    }

    /// List the records a collection would free, leaving the heap as is.
    pub fn sweep_candidates(&mut self, roots: &mut dyn RootProvider) -> Vec<StubId> {
        self.collect_full(CollectMode::Report, roots).candidates
    }

    /// Collect if allocation pressure (or stress mode) asked for it.
    pub fn collect_if_needed(&mut self, roots: &mut dyn RootProvider) -> Option<usize> {
        if self.gc_requested || self.config.stress {
            Some(self.collect_with(roots))
        } else {
            None
        }
    }

    /// Run one cycle in the given mode.
    ///
    /// A request made while a cycle is already running is deferred: it
    /// sets the pending flag and returns an empty outcome.
    pub fn collect_full(&mut self, mode: CollectMode, roots: &mut dyn RootProvider) -> CollectOutcome {
        if self.state != GcState::Idle {
            self.pending = true;
            self.gc_requested = true;
            tracing::debug!(target: "quill_mem::gc", state = ?self.state, "collection deferred");
            return CollectOutcome::default();
        }

        let timer = GcTimer::start("collect");
        let verify = self.config.verify_heap;
        let live_before = self.stub_count();
        if verify {
            self.verify_heap();
        }

        // Phase 1+2: mark
        self.state = GcState::Marking;
        let (marked, canonicalized) = self.mark(mode, roots, verify);
        let marked_ids = if verify { self.marked_ids() } else { FxHashSet::default() };

        // Phase 3: sweep
        self.state = GcState::Sweeping;
        let swept = self.sweep(mode, verify);
        self.state = GcState::Idle;

        if verify {
            let survivors: FxHashSet<StubId> = swept.survivor_ids.iter().copied().collect();
            if survivors != marked_ids {
                integrity_failure(
                    "survivor set",
                    format_args!(
                        "{} marked before sweep, {} survived",
                        marked_ids.len(),
                        survivors.len()
                    ),
                );
            }
        }

        let pause = timer.stop();
        if mode != CollectMode::Report {
            self.depletion = self.config.ballast as isize;
            self.gc_requested = false;
            self.stats.record_collection(pause, swept.reclaimed, canonicalized);
        }
        if self.pending {
            self.pending = false;
            self.gc_requested = true;
        }

        if self.config.trace {
            tracing::info!(
                target: "quill_mem::gc",
                ?mode,
                live_before,
                reclaimed = swept.reclaimed,
                survivors = swept.survivors,
                canonicalized,
                pause_us = pause.as_micros() as u64,
                "collection complete"
            );
        } else {
            tracing::debug!(
                target: "quill_mem::gc",
                ?mode,
                live_before,
                reclaimed = swept.reclaimed,
                survivors = swept.survivors,
                canonicalized,
                pause_us = pause.as_micros() as u64,
                "collection complete"
            );
        }

        CollectOutcome {
            reclaimed: swept.reclaimed,
            survivors: swept.survivors,
            marked,
            canonicalized,
            candidates: swept.candidates,
            pause,
        }
    }

    /// Release everything, running a final shutdown cycle first so
    /// unreachable records are torn down before the survivors.
    pub fn shutdown(mut self) -> CollectOutcome {
        let mut outcome = self.collect_full(CollectMode::Shutdown, &mut ());
        outcome.reclaimed += self.stub_count();
        self.release_all();
        self.shut_down = true;
        tracing::debug!(target: "quill_mem::gc", reclaimed = outcome.reclaimed, "heap shut down");
        outcome
    }

    /// Cross-check heap invariants outside of marking.
    ///
    /// Panics with an integrity failure if a record other than the
    /// canonical one is marked, or a dynamic buffer disagrees with the
    /// pool it came from.
    pub fn verify_heap(&self) {
        let canonical = self.inaccessible;
        for (id, stub) in self.arena.iter() {
            if id != canonical && stub.is_marked() {
                integrity_failure("stale mark", format_args!("{id} marked outside a collection"));
            }
            if let Some(buffer) = stub.buffer() {
                if !self.pool.is_consistent(buffer.raw()) {
                    integrity_failure(
                        "buffer ownership",
                        format_args!("{id} holds {} bytes from {:?}", buffer.raw().size(), buffer.raw().pool()),
                    );
                }
            }
        }
    }

    fn mark(&mut self, mode: CollectMode, roots: &mut dyn RootProvider, verify: bool) -> (usize, usize) {
        let api_roots = self.api_roots(mode);
        let rewrite = mode != CollectMode::Report;

        let mut marker = Marker::new(&mut self.arena, self.inaccessible, rewrite, verify);
        for id in api_roots {
            marker.mark_root(id);
        }

        if mode != CollectMode::Shutdown {
            for guarded in self.guards.iter_mut() {
                match guarded {
                    Guarded::Stub(id) => marker.mark_guarded(id),
                    Guarded::Cell(cell) => cell.trace(&mut marker),
                }
            }
            self.data_stack.trace(&mut marker);
            roots.trace_roots(&mut marker);
        }

        marker.drain();
        (marker.marked, marker.canonicalized)
    }

    /// Readable `ROOT` records whose owning scope is still open.
    fn api_roots(&self, mode: CollectMode) -> Vec<StubId> {
        let mut found = Vec::new();
        for (id, stub) in self.arena.iter() {
            if !stub.is_root() || !stub.is_readable() {
                continue;
            }
            match stub.link() {
                Slot::Scope(scope) if !self.scopes.is_open(scope) => {
                    if !self.config.auto_release_expired_roots && mode != CollectMode::Shutdown {
                        integrity_failure("expired root", format_args!("{id} outlived {scope}"));
                    }
                    tracing::trace!(target: "quill_mem::gc", %id, %scope, "releasing expired root");
                }
                _ => found.push(id),
            }
        }
        found
    }

    fn marked_ids(&self) -> FxHashSet<StubId> {
        let canonical = self.inaccessible;
        self.arena
            .iter()
            .filter(|(id, stub)| *id != canonical && stub.is_marked())
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::config::MemConfig;
    use crate::stub::StubFlags;

    #[test]
    fn test_empty_collection() {
        let mut heap = Heap::with_defaults();
        assert_eq!(heap.collect(), 0);
        assert_eq!(heap.stats().collections.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reentrant_request_is_deferred() {
        let mut heap = Heap::with_defaults();
        let lost = heap
            .make_array(1, StubFlags::MANAGED).unwrap();
        heap.state = GcState::Marking;

        assert_eq!(heap.collect(), 0);
        assert!(heap.pending);
        assert!(heap.gc_requested());
        assert!(heap.is_live(lost));

        heap.state = GcState::Idle;
        assert_eq!(heap.collect_if_needed(&mut ()), Some(1));
        assert!(!heap.pending);
        assert!(!heap.gc_requested());
    }

    #[test]
    fn test_depletion_reset_after_collect() {
        let config = MemConfig {
            ballast: 4096,
            ..Default::default()
        };
        let mut heap = Heap::new(config).unwrap();
        for _ in 0..64 {
            heap.make_array(4, StubFlags::MANAGED).unwrap();
        }
        assert!(heap.gc_requested());
        heap.collect();
        assert_eq!(heap.depletion(), 4096);
        assert!(!heap.gc_requested());
        assert_eq!(heap.collect_if_needed(&mut ()), None);
    }

    #[test]
    fn test_expired_root_released() {
        let mut heap = Heap::with_defaults();
        let scope = heap.open_root_scope();
        let root = heap.make_api_root(Cell::integer(1), scope).unwrap();

        assert_eq!(heap.collect(), 0);
        heap.close_root_scope(scope).unwrap();
        assert_eq!(heap.collect(), 1);
        assert!(!heap.is_live(root));
    }

    #[test]
    #[should_panic(expected = "memory integrity violation: expired root")]
    fn test_expired_root_is_fatal_without_auto_release() {
        let config = MemConfig {
            auto_release_expired_roots: false,
            ..Default::default()
        };
        let mut heap = Heap::new(config).unwrap();
        let scope = heap.open_root_scope();
        heap.make_api_root(Cell::integer(1), scope).unwrap();
        heap.close_root_scope(scope).unwrap();
        heap.collect();
    }

    #[test]
    fn test_report_leaves_heap_unchanged() {
        let mut heap = Heap::with_defaults();
        let lost = heap.make_array(1, StubFlags::MANAGED).unwrap();
        let before = heap.stats().collections.load(std::sync::atomic::Ordering::Relaxed);

        assert_eq!(heap.sweep_candidates(&mut ()), vec![lost]);
        assert!(heap.is_readable(lost));
        assert_eq!(
            heap.stats().collections.load(std::sync::atomic::Ordering::Relaxed),
            before
        );
    }

    #[test]
    fn test_verify_heap_clean() {
        let mut heap = Heap::with_defaults();
        let big = heap.make_array(100, StubFlags::MANAGED).unwrap();
        heap.push_guard_stub(big).unwrap();
        heap.collect();
        heap.verify_heap();
    }
}
