//! Quill Memory Core
//!
//! Pooled allocation and mark-sweep collection for a tree-walking
//! evaluator's value graph.
//!
//! # Architecture
//!
//! - **Pools**: fixed-width size classes carved from bulk segments, with
//!   oversized requests routed to the system allocator. See [`pool`].
//!
//! - **Header records** ("stubs"): fixed-size records held in a
//!   generational arena and named by [`StubId`]. Small payloads live
//!   inline; larger ones are promoted to a [`Buffer`].
//!
//! - **Buffers**: growable storage with head slack ("bias") so removing
//!   from the front and inserting again never copies.
//!
//! - **Collector**: breadth-first mark-sweep over managed records.
//!   References to freed or decommissioned records are rewritten to one
//!   canonical inaccessible record instead of dangling.
//!
//! # Usage
//!
//! ```ignore
//! use quill_mem::{Cell, Heap, StubFlags};
//!
//! let mut heap = Heap::with_defaults();
//!
//! let block = heap.make_array(4, StubFlags::MANAGED)?;
//! heap.push_cell(block, Cell::integer(42))?;
//!
//! // Values held by native code must be guarded across allocation.
//! heap.push_guard_cell(Cell::block(block, 0));
//! heap.collect();
//! heap.drop_guard();
//! ```
//!
//! # Safety
//!
//! The collector requires that:
//! - Every reference held outside the heap is reported as a root
//!   (guard list, data stack, or a [`RootProvider`])
//! - Unmanaged records are freed by the mutator, never by the collector
//! - All access happens from one thread

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod cell;
pub mod cleanup;
pub mod collector;
pub mod config;
pub mod error;
pub mod heap;
pub mod pool;
pub mod roots;
pub mod stub;
pub mod trace;

mod stats;

// Re-exports for convenient access
pub use buffer::{Buffer, ExpansionCache, Growth};
pub use cell::{Cell, Kind, Payload};
pub use cleanup::CleanupFn;
pub use collector::{CollectMode, CollectOutcome, GcState};
pub use config::{ConfigError, MemConfig};
pub use error::{MemError, Result};
pub use heap::{Guarded, Heap};
pub use pool::{PoolAllocator, PoolId, RawAlloc};
pub use roots::{RootProvider, RootScopeId, RootSet};
pub use stats::{GcTimer, MemStats};
pub use stub::{Flavor, Readability, Slot, Stub, StubArena, StubFlags, StubId};
pub use trace::{CountingTracer, NullTracer, Trace, Tracer};
