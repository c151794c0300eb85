//! Memory statistics.
//!
//! Tracks allocation volume, pool traffic, and collection pauses
//! for monitoring, tuning, and tests that probe allocator behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics about allocator and collector activity.
#[derive(Debug)]
pub struct MemStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Total bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Total header records allocated since start.
    pub stubs_allocated: AtomicU64,
    /// Total bytes released since start.
    pub bytes_freed: AtomicU64,
    /// Total header records released since start.
    pub stubs_freed: AtomicU64,

    // =========================================================================
    // Pool Statistics
    // =========================================================================
    /// Buffer allocations served by a size-class pool.
    pub pool_allocations: AtomicU64,
    /// Buffer allocations routed to the system allocator.
    pub system_allocations: AtomicU64,
    /// Buffer reallocations performed by growth.
    pub reallocations: AtomicU64,

    // =========================================================================
    // Collection Statistics
    // =========================================================================
    /// Number of completed collections.
    pub collections: AtomicU64,
    /// Header records reclaimed by the collector.
    pub stubs_reclaimed: AtomicU64,
    /// References rewritten to the inaccessible sentinel.
    pub references_canonicalized: AtomicU64,
    /// Total time spent collecting (nanoseconds).
    pub gc_time_ns: AtomicU64,
    /// Duration of the most recent collection (nanoseconds).
    pub last_pause_ns: AtomicU64,
}

impl MemStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            bytes_allocated: AtomicU64::new(0),
            stubs_allocated: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            stubs_freed: AtomicU64::new(0),
            pool_allocations: AtomicU64::new(0),
            system_allocations: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            stubs_reclaimed: AtomicU64::new(0),
            references_canonicalized: AtomicU64::new(0),
            gc_time_ns: AtomicU64::new(0),
            last_pause_ns: AtomicU64::new(0),
        }
    }

    /// Record a header allocation.
    #[inline]
    pub fn record_stub(&self, size: usize) {
        self.stubs_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a header release.
    #[inline]
    pub fn record_stub_freed(&self, size: usize) {
        self.stubs_freed.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a buffer allocation.
    #[inline]
    pub fn record_buffer(&self, size: usize, pooled: bool) {
        self.bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        if pooled {
            self.pool_allocations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.system_allocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a buffer release.
    #[inline]
    pub fn record_buffer_freed(&self, size: usize) {
        self.bytes_freed.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a growth reallocation.
    #[inline]
    pub fn record_reallocation(&self) {
        self.reallocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed collection.
    pub fn record_collection(&self, duration: Duration, reclaimed: usize, canonicalized: usize) {
        let ns = duration.as_nanos() as u64;
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.gc_time_ns.fetch_add(ns, Ordering::Relaxed);
        self.last_pause_ns.store(ns, Ordering::Relaxed);
        self.stubs_reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        self.references_canonicalized
            .fetch_add(canonicalized as u64, Ordering::Relaxed);
    }

    /// Total buffer allocations, pooled and system.
    pub fn buffer_allocations(&self) -> u64 {
        self.pool_allocations.load(Ordering::Relaxed)
            + self.system_allocations.load(Ordering::Relaxed)
    }

    /// Get total collection time.
    pub fn total_gc_time(&self) -> Duration {
        Duration::from_nanos(self.gc_time_ns.load(Ordering::Relaxed))
    }

    /// Get average collection pause.
    pub fn avg_pause(&self) -> Duration {
        let count = self.collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.gc_time_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / count)
    }

    /// Get the most recent collection pause.
    pub fn last_pause(&self) -> Duration {
        Duration::from_nanos(self.last_pause_ns.load(Ordering::Relaxed))
    }

    /// Bytes allocated and not yet released.
    pub fn net_bytes(&self) -> u64 {
        self.bytes_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.bytes_freed.load(Ordering::Relaxed))
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.stubs_allocated.store(0, Ordering::Relaxed);
        self.bytes_freed.store(0, Ordering::Relaxed);
        self.stubs_freed.store(0, Ordering::Relaxed);
        self.pool_allocations.store(0, Ordering::Relaxed);
        self.system_allocations.store(0, Ordering::Relaxed);
        self.reallocations.store(0, Ordering::Relaxed);
        self.collections.store(0, Ordering::Relaxed);
        self.stubs_reclaimed.store(0, Ordering::Relaxed);
        self.references_canonicalized.store(0, Ordering::Relaxed);
        self.gc_time_ns.store(0, Ordering::Relaxed);
        self.last_pause_ns.store(0, Ordering::Relaxed);
    }

    /// Render a summary of the statistics.
    pub fn summary(&self) -> String {
        format!(
            "=== Memory Statistics ===\n\
             Allocations: {} stubs, {} ({} pooled buffers, {} system, {} regrowths)\n\
             Released: {} stubs, {}\n\
             Collections: {} ({} stubs reclaimed, {} references canonicalized)\n\
             GC Time: {:?} total ({:?} avg, {:?} last)\n",
            self.stubs_allocated.load(Ordering::Relaxed),
            format_bytes(self.bytes_allocated.load(Ordering::Relaxed)),
            self.pool_allocations.load(Ordering::Relaxed),
            self.system_allocations.load(Ordering::Relaxed),
            self.reallocations.load(Ordering::Relaxed),
            self.stubs_freed.load(Ordering::Relaxed),
            format_bytes(self.bytes_freed.load(Ordering::Relaxed)),
            self.collections.load(Ordering::Relaxed),
            self.stubs_reclaimed.load(Ordering::Relaxed),
            self.references_canonicalized.load(Ordering::Relaxed),
            self.total_gc_time(),
            self.avg_pause(),
            self.last_pause(),
        )
    }
}

impl Default for MemStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes in human-readable form.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Timer for measuring collector phases.
pub struct GcTimer {
    start: Instant,
    label: &'static str,
}

impl GcTimer {
    /// Start a new timer with the given label.
    pub fn start(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    /// Stop the timer and return the elapsed duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::trace!(target: "quill_mem::gc", phase = self.label, ?elapsed, "phase done");
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let stats = MemStats::new();

        stats.record_stub(64);
        stats.record_buffer(1024, true);
        stats.record_buffer(1 << 20, false);

        assert_eq!(stats.stubs_allocated.load(Ordering::Relaxed), 1);
        assert_eq!(stats.buffer_allocations(), 2);
        assert_eq!(
            stats.bytes_allocated.load(Ordering::Relaxed),
            64 + 1024 + (1 << 20)
        );

        stats.record_buffer_freed(1024);
        assert_eq!(stats.net_bytes(), 64 + (1 << 20));
    }

    #[test]
    fn test_gc_timing() {
        let stats = MemStats::new();

        stats.record_collection(Duration::from_micros(100), 3, 0);
        stats.record_collection(Duration::from_micros(200), 1, 2);

        assert_eq!(stats.collections.load(Ordering::Relaxed), 2);
        assert_eq!(stats.avg_pause(), Duration::from_micros(150));
        assert_eq!(stats.last_pause(), Duration::from_micros(200));
        assert_eq!(stats.stubs_reclaimed.load(Ordering::Relaxed), 4);
        assert_eq!(stats.references_canonicalized.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_reset() {
        let stats = MemStats::new();
        stats.record_stub(64);
        stats.record_collection(Duration::from_micros(5), 1, 0);
        stats.reset();
        assert_eq!(stats.net_bytes(), 0);
        assert_eq!(stats.avg_pause(), Duration::ZERO);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_summary_mentions_collections() {
        let stats = MemStats::new();
        stats.record_collection(Duration::from_micros(10), 7, 0);
        assert!(stats.summary().contains("7 stubs reclaimed"));
    }
}
