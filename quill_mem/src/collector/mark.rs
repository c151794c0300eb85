//! Breadth-first marking.
//!
//! The marker owns a FIFO worklist of records whose contents still need
//! visiting. Discovering an unmarked managed record sets its `MARKED` bit
//! and, if it has followable contents, queues it. Nothing recurses, so
//! arbitrarily deep graphs cannot overflow the native stack.
//!
//! ```text
//!   roots ──▶ mark_id ──▶ queue ──▶ scan ──▶ mark_id ──▶ ...
//!                │                    │
//!                └── stale/decayed ───┴──▶ rewrite to canonical
//! ```

use crate::cell::Cell;
use crate::error::integrity_failure;
use crate::stub::{Slot, StubArena, StubFlags, StubId};
use crate::trace::Tracer;
use std::collections::VecDeque;

/// Which header slot a scan is following.
#[derive(Debug, Clone, Copy)]
enum SlotField {
    Link,
    Misc,
    Info,
}

/// Marking tracer over the header arena.
pub(crate) struct Marker<'a> {
    arena: &'a mut StubArena,
    worklist: VecDeque<StubId>,
    inaccessible: StubId,
    /// Rewrite dangling references in place. Off for report-only cycles.
    rewrite: bool,
    verify: bool,
    /// Records newly marked.
    pub marked: usize,
    /// References rewritten to the canonical record.
    pub canonicalized: usize,
}

impl<'a> Marker<'a> {
    pub fn new(arena: &'a mut StubArena, inaccessible: StubId, rewrite: bool, verify: bool) -> Self {
        Self {
            arena,
            worklist: VecDeque::with_capacity(256),
            inaccessible,
            rewrite,
            verify,
            marked: 0,
            canonicalized: 0,
        }
    }

    /// Mark one reference, rewriting it if it dangles.
    pub fn mark_id(&mut self, id: &mut StubId) {
        if *id == self.inaccessible {
            return;
        }
        let Some(stub) = self.arena.get_mut(*id) else {
            self.canonicalize(id);
            return;
        };
        if !stub.is_readable() {
            self.canonicalize(id);
            return;
        }
        if stub.is_marked() {
            return;
        }
        if !stub.is_managed() {
            if self.verify {
                integrity_failure(
                    "unmanaged record reached by marking",
                    format_args!("{} ({})", id, stub.flavor().name()),
                );
            }
            return;
        }

        stub.flags |= StubFlags::MARKED;
        self.marked += 1;
        if stub.has_followable() {
            self.worklist.push_back(*id);
        }
    }

    /// Mark a root record. Roots are only reachable from outside the
    /// graph, so finding one already marked means the marks are corrupt.
    ///
    /// An unmanaged root is never swept, so only its contents are queued.
    pub fn mark_root(&mut self, id: StubId) {
        let Some(stub) = self.arena.get(id) else {
            return;
        };
        if !stub.is_managed() {
            self.queue_contents(id);
            return;
        }
        if self.verify && stub.is_marked() {
            integrity_failure("root already marked", format_args!("{id}"));
        }
        let mut id = id;
        self.mark_id(&mut id);
    }

    /// Mark a guarded record. Unmanaged records are not marked; only
    /// their contents are kept alive.
    pub fn mark_guarded(&mut self, id: &mut StubId) {
        let unmanaged = self.arena.get(*id).map_or(false, |stub| !stub.is_managed());
        if unmanaged {
            self.queue_contents(*id);
        } else {
            self.mark_id(id);
        }
    }

    /// Queue the contents of a record without marking it.
    ///
    /// Used for guarded unmanaged records, which the sweep ignores but
    /// whose referents must survive.
    pub fn queue_contents(&mut self, id: StubId) {
        if self.arena.get(id).map_or(false, |stub| stub.is_readable() && stub.has_followable()) {
            self.worklist.push_back(id);
        }
    }

    /// Process the worklist until it is empty.
    pub fn drain(&mut self) {
        while let Some(id) = self.worklist.pop_front() {
            self.scan(id);
        }
    }

    fn scan(&mut self, id: StubId) {
        let Some(stub) = self.arena.get(id) else {
            return;
        };
        let flags = stub.flags();
        let len = if stub.flavor().holds_cells() { stub.len() } else { 0 };

        for index in 0..len {
            let Some(original) = self.arena.get(id).and_then(|stub| stub.cell(index)) else {
                break;
            };
            let mut cell = original;
            self.trace_cell(&mut cell);
            if cell != original {
                if let Some(stub) = self.arena.get_mut(id) {
                    stub.write_cell(index, cell);
                }
            }
        }

        if flags.contains(StubFlags::LINK_NEEDS_MARK) {
            self.follow(id, SlotField::Link);
        }
        if flags.contains(StubFlags::MISC_NEEDS_MARK) {
            self.follow(id, SlotField::Misc);
        }
        if flags.contains(StubFlags::INFO_NEEDS_MARK) {
            self.follow(id, SlotField::Info);
        }
    }

    fn follow(&mut self, id: StubId, field: SlotField) {
        let slot = match self.arena.get(id) {
            Some(stub) => match field {
                SlotField::Link => stub.link(),
                SlotField::Misc => stub.misc(),
                SlotField::Info => stub.info(),
            },
            None => return,
        };
        let Some(original) = slot.node() else {
            return;
        };

        let mut target = original;
        self.mark_id(&mut target);
        if target != original {
            if let Some(stub) = self.arena.get_mut(id) {
                match field {
                    SlotField::Link => stub.set_link(Slot::Node(target)),
                    SlotField::Misc => stub.set_misc(Slot::Node(target)),
                    SlotField::Info => stub.set_info(Slot::Node(target)),
                }
            }
        }
    }

    fn canonicalize(&mut self, id: &mut StubId) {
        if self.rewrite {
            tracing::trace!(target: "quill_mem::gc", from = %id, "canonicalized reference");
            *id = self.inaccessible;
            self.canonicalized += 1;
        }
    }
}

impl Tracer for Marker<'_> {
    #[inline]
    fn trace_stub(&mut self, id: &mut StubId) {
        self.mark_id(id);
    }

    fn trace_cell(&mut self, cell: &mut Cell) {
        cell.for_each_node_mut(|id| self.mark_id(id));
    }
}
