//! Segmented arena of header records.
//!
//! Records are carved in segments of a configured number of units and
//! never move once placed, so an index stays valid for the life of the
//! record. Free units are chained through an index free list; a free
//! unit is recognized by its variant alone, without walking the list.

use super::{Stub, StubId, STUB_SIZE};
use crate::error::{MemError, Result};

/// One arena unit.
#[derive(Debug)]
pub(crate) enum StubSlot {
    /// Unused; generation is the one the next occupant will get.
    Free {
        generation: u32,
        next_free: Option<u32>,
    },
    /// In use.
    Live { generation: u32, stub: Stub },
}

/// The header record arena.
pub struct StubArena {
    /// Fixed-size segments; never reallocated once carved.
    segments: Vec<Box<[StubSlot]>>,
    /// Units per segment.
    units_per_segment: usize,
    /// Head of the free index list.
    free_head: Option<u32>,
    /// Units on the free list.
    free_count: usize,
    /// Units in use.
    live_count: usize,
}

impl StubArena {
    /// Create an empty arena.
    pub fn new(units_per_segment: usize) -> Self {
        Self {
            segments: Vec::new(),
            units_per_segment: units_per_segment.max(1),
            free_head: None,
            free_count: 0,
            live_count: 0,
        }
    }

    /// Total units across all segments.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.segments.len() * self.units_per_segment
    }

    /// Units in use.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Units on the free list.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Number of carved segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Bytes occupied by one segment.
    #[inline]
    pub fn segment_bytes(&self) -> usize {
        self.units_per_segment * STUB_SIZE
    }

    /// Place a record, carving a new segment if no unit is free.
    pub fn alloc(&mut self, stub: Stub) -> Result<StubId> {
        if self.free_head.is_none() {
            self.carve()?;
        }
        let Some(index) = self.free_head else {
            return Err(MemError::OutOfMemory {
                requested: STUB_SIZE,
            });
        };

        let slot = self.slot_mut(index);
        let StubSlot::Free {
            generation,
            next_free,
        } = *slot
        else {
            crate::error::integrity_failure(
                "arena free list",
                format_args!("unit {} on the free list is live", index),
            );
        };

        *slot = StubSlot::Live { generation, stub };
        self.free_head = next_free;
        self.free_count -= 1;
        self.live_count += 1;
        Ok(StubId::new(index, generation))
    }

    /// Remove a record, returning it. The slot's generation is bumped.
    ///
    /// Returns `None` if `id` is stale or already free.
    pub fn free(&mut self, id: StubId) -> Option<Stub> {
        self.get(id)?;
        let next_free = self.free_head;
        let slot = self.slot_mut(id.index());
        let old = std::mem::replace(
            slot,
            StubSlot::Free {
                generation: id.generation().wrapping_add(1),
                next_free,
            },
        );
        self.free_head = Some(id.index());
        self.free_count += 1;
        self.live_count -= 1;

        match old {
            StubSlot::Live { stub, .. } => Some(stub),
            StubSlot::Free { .. } => None,
        }
    }

    /// Look up a live record.
    #[inline]
    pub fn get(&self, id: StubId) -> Option<&Stub> {
        match self.slot(id.index())? {
            StubSlot::Live { generation, stub } if *generation == id.generation() => Some(stub),
            _ => None,
        }
    }

    /// Look up a live record mutably.
    #[inline]
    pub fn get_mut(&mut self, id: StubId) -> Option<&mut Stub> {
        match self.slot_mut_checked(id.index())? {
            StubSlot::Live { generation, stub } if *generation == id.generation() => Some(stub),
            _ => None,
        }
    }

    /// Whether `id` names a live record.
    #[inline]
    pub fn contains(&self, id: StubId) -> bool {
        self.get(id).is_some()
    }

    /// Id of the record at `index`, if that unit is live.
    #[inline]
    pub fn id_at(&self, index: usize) -> Option<StubId> {
        match self.slot(u32::try_from(index).ok()?)? {
            StubSlot::Live { generation, .. } => Some(StubId::new(index as u32, *generation)),
            StubSlot::Free { .. } => None,
        }
    }

    /// Iterate live records in index order.
    pub fn iter(&self) -> impl Iterator<Item = (StubId, &Stub)> + '_ {
        self.segments
            .iter()
            .flat_map(|segment| segment.iter())
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                StubSlot::Live { generation, stub } => {
                    Some((StubId::new(index as u32, *generation), stub))
                }
                StubSlot::Free { .. } => None,
            })
    }

    /// Ids of every live record, in index order.
    pub fn live_ids(&self) -> Vec<StubId> {
        self.iter().map(|(id, _)| id).collect()
    }

    fn carve(&mut self) -> Result<()> {
        let units = self.units_per_segment;
        let base = self.capacity();
        let requested = units * STUB_SIZE;

        if base + units > u32::MAX as usize {
            return Err(MemError::OutOfMemory { requested });
        }
        self.segments
            .try_reserve(1)
            .map_err(|_| MemError::OutOfMemory { requested })?;
        let mut slots: Vec<StubSlot> = Vec::new();
        slots
            .try_reserve_exact(units)
            .map_err(|_| MemError::OutOfMemory { requested })?;

        // Chain the new units so the lowest index is handed out first.
        for offset in 0..units {
            let next_free = if offset + 1 < units {
                Some((base + offset + 1) as u32)
            } else {
                self.free_head
            };
            slots.push(StubSlot::Free {
                generation: 0,
                next_free,
            });
        }

        self.segments.push(slots.into_boxed_slice());
        self.free_head = Some(base as u32);
        self.free_count += units;

        tracing::trace!(
            target: "quill_mem::pool",
            units,
            segments = self.segments.len(),
            "carved header segment"
        );
        Ok(())
    }

    #[inline]
    fn slot(&self, index: u32) -> Option<&StubSlot> {
        let index = index as usize;
        self.segments
            .get(index / self.units_per_segment)?
            .get(index % self.units_per_segment)
    }

    #[inline]
    fn slot_mut_checked(&mut self, index: u32) -> Option<&mut StubSlot> {
        let index = index as usize;
        self.segments
            .get_mut(index / self.units_per_segment)?
            .get_mut(index % self.units_per_segment)
    }

    #[inline]
    fn slot_mut(&mut self, index: u32) -> &mut StubSlot {
        let units = self.units_per_segment;
        let index = index as usize;
        &mut self.segments[index / units][index % units]
    }
}
