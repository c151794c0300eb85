//! Teardown callbacks.
//!
//! A cleanup hook receives only extracted plain data, a raw pointer and a
//! length, never a live handle into the heap: it may run in the middle of
//! a sweep, when calling back into the wider runtime is unsafe.
//!
//! Hooks come from two places. A flavor may register one hook for all of
//! its records with [`CleanerTable::register`], and a handle record may
//! carry its own hook in its `info` slot. Each runs exactly once, before
//! the record's storage is released.

use crate::stub::Flavor;

/// Teardown callback: `(data pointer, length)`.
pub type CleanupFn = fn(*mut u8, usize);

/// Per-flavor teardown registrations.
#[derive(Debug, Clone, Default)]
pub struct CleanerTable {
    hooks: [Option<CleanupFn>; Flavor::COUNT],
}

impl CleanerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the hook for a flavor, returning the one it replaces.
    pub fn register(&mut self, flavor: Flavor, hook: CleanupFn) -> Option<CleanupFn> {
        self.hooks[flavor as usize].replace(hook)
    }

    /// Remove the hook for a flavor.
    pub fn unregister(&mut self, flavor: Flavor) -> Option<CleanupFn> {
        self.hooks[flavor as usize].take()
    }

    /// The hook registered for a flavor.
    #[inline]
    pub fn get(&self, flavor: Flavor) -> Option<CleanupFn> {
        self.hooks[flavor as usize]
    }
}
