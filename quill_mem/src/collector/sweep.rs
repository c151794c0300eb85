//! Sweep phase.

use super::CollectMode;
use crate::error::integrity_failure;
use crate::heap::Heap;
use crate::stub::{StubFlags, StubId};

/// What a sweep found.
#[derive(Debug, Default)]
pub(crate) struct SweepResult {
    pub reclaimed: usize,
    pub survivors: usize,
    /// Records that would have been freed (report mode only).
    pub candidates: Vec<StubId>,
    /// Survivor ids, gathered only when verifying.
    pub survivor_ids: Vec<StubId>,
}

impl Heap {
    /// Walk every header: clear survivors' marks and free the rest.
    ///
    /// Unmanaged records belong to the mutator and are left alone.
    pub(crate) fn sweep(&mut self, mode: CollectMode, verify: bool) -> SweepResult {
        let mut result = SweepResult::default();
        let canonical = self.inaccessible;

        for id in self.arena.live_ids() {
            if id == canonical {
                continue;
            }
            // Freed earlier in this sweep along with its owner.
            let Some(stub) = self.arena.get_mut(id) else {
                continue;
            };

            if !stub.is_managed() {
                if stub.is_marked() {
                    integrity_failure("unmanaged record marked", format_args!("{id}"));
                }
                continue;
            }

            if stub.is_marked() {
                stub.flags.remove(StubFlags::MARKED);
                result.survivors += 1;
                if verify {
                    result.survivor_ids.push(id);
                }
                continue;
            }

            result.reclaimed += 1;
            if mode == CollectMode::Report {
                result.candidates.push(id);
            } else {
                self.release(id);
            }
        }

        result
    }
}
