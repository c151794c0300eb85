//! Error types for allocation and header access.
//!
//! Two very different failure classes live here:
//!
//! - [`MemError`]: recoverable conditions (out-of-memory, size limits,
//!   stale handles) that mutator code converts into language-level errors.
//! - [`integrity_failure`]: internal invariant violations. These mean the
//!   object graph is corrupt and the process must stop; they are never
//!   returned as values.

use crate::stub::{Flavor, StubId};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MemError>;

/// Recoverable memory errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    /// The operating system refused an allocation.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
    },

    /// A configured usage ceiling would be exceeded.
    #[error("memory limit of {limit} bytes exceeded (requested {requested} more)")]
    UsageLimit {
        /// Bytes requested.
        requested: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// A size computation overflowed.
    #[error("allocation size overflow")]
    SizeOverflow,

    /// The request exceeds the largest allocation the runtime supports.
    #[error("allocation of {requested} bytes exceeds the maximum supported size")]
    TooLarge {
        /// Bytes requested.
        requested: usize,
    },

    /// Zero-width allocations are rejected before reaching the pools.
    #[error("zero-width allocation")]
    ZeroWidth,

    /// The handle refers to a header that has been freed and reused.
    #[error("stale reference to {0}")]
    StaleReference(StubId),

    /// The handle refers to a decommissioned header.
    #[error("{0} is inaccessible")]
    Inaccessible(StubId),

    /// The operation does not apply to this kind of header.
    #[error("expected {expected:?} header, found {found:?}")]
    WrongFlavor {
        /// The flavor the operation needs.
        expected: Flavor,
        /// The flavor actually present.
        found: Flavor,
    },

    /// Index past the end of a header's content.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Current length.
        len: usize,
    },

    /// Explicit free of a header owned by the collector.
    #[error("{0} is managed and can only be reclaimed by the collector")]
    Managed(StubId),

    /// The header has a fixed size and cannot grow or shrink.
    #[error("{0} has fixed size")]
    FixedSize(StubId),

    /// Content swap between headers with different element widths.
    #[error("cannot swap content of width {0} with width {1}")]
    WidthMismatch(usize, usize),

    /// A root scope was closed twice or never opened.
    #[error("root scope {0} is not open")]
    ScopeClosed(u32),
}

impl MemError {
    /// Whether this error reports memory exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            MemError::OutOfMemory { .. } | MemError::UsageLimit { .. }
        )
    }
}

/// Report an internal invariant violation and stop.
///
/// Called from checks that only run in debug builds or when heap
/// verification is switched on; release builds without verification
/// never reach it.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn integrity_failure(what: &str, detail: std::fmt::Arguments<'_>) -> ! {
    panic!("memory integrity violation: {}: {}", what, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_classification() {
        assert!(MemError::OutOfMemory { requested: 8 }.is_out_of_memory());
        assert!(MemError::UsageLimit {
            requested: 8,
            limit: 4
        }
        .is_out_of_memory());
        assert!(!MemError::SizeOverflow.is_out_of_memory());
    }

    #[test]
    fn test_error_messages() {
        let err = MemError::IndexOutOfRange { index: 5, len: 2 };
        assert_eq!(err.to_string(), "index 5 out of range for length 2");

        let err = MemError::TooLarge { requested: 1 << 40 };
        assert!(err.to_string().contains("maximum supported size"));
    }

    #[test]
    #[should_panic(expected = "memory integrity violation")]
    fn test_integrity_failure_panics() {
        integrity_failure("test", format_args!("pool {}", 3));
    }
}
