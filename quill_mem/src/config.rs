//! Memory configuration parameters.
//!
//! All sizes and thresholds are tunable. Defaults suit an interpreter
//! that allocates many small headers and collects every few megabytes.

use thiserror::Error;

/// Configuration for the allocator and collector.
///
/// # Example
///
/// ```ignore
/// use quill_mem::MemConfig;
///
/// // Collect often while hunting a liveness bug
/// let config = MemConfig {
///     ballast: 64 * 1024,
///     verify_heap: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct MemConfig {
    // =========================================================================
    // Collection Triggers
    // =========================================================================
    /// Bytes that may be allocated between collections.
    ///
    /// Each allocation decrements a depletion counter; once it reaches
    /// zero a collection is requested and the counter is reset to this
    /// value, regardless of how much the collection reclaimed.
    ///
    /// Default: 3MB
    pub ballast: usize,

    /// Request a collection after every allocation.
    ///
    /// Stress-testing mode for shaking out missing guards.
    ///
    /// Default: false
    pub stress: bool,

    // =========================================================================
    // Pools
    // =========================================================================
    /// Header records carved per header segment.
    ///
    /// Default: 512
    pub stub_units_per_segment: usize,

    /// Route every buffer allocation to the system allocator.
    ///
    /// Lets address sanitizers see each allocation individually.
    /// Observable behavior is unchanged.
    ///
    /// Default: false
    pub disable_pools: bool,

    /// Round system (oversized) allocations up to a power of two.
    ///
    /// Default: false
    pub prefer_power_of_two: bool,

    /// Ceiling on outstanding bytes. Allocations beyond it fail with
    /// an out-of-memory error.
    ///
    /// Set to 0 for unlimited.
    ///
    /// Default: 0 (unlimited)
    pub usage_limit: usize,

    // =========================================================================
    // Roots
    // =========================================================================
    /// Collect API roots whose owning scope has closed.
    ///
    /// When false, finding such a root is an integrity failure.
    ///
    /// Default: true
    pub auto_release_expired_roots: bool,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Log each collection at info level instead of debug.
    ///
    /// Default: false
    pub trace: bool,

    /// Cross-check heap invariants during every collection.
    ///
    /// Expensive but useful for debugging collector bugs.
    ///
    /// Default: false (enabled in debug builds)
    pub verify_heap: bool,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            // Triggers
            ballast: 3 * 1024 * 1024, // 3MB
            stress: false,

            // Pools
            stub_units_per_segment: 512,
            disable_pools: false,
            prefer_power_of_two: false,
            usage_limit: 0, // Unlimited

            // Roots
            auto_release_expired_roots: true,

            // Debugging
            trace: false,
            verify_heap: cfg!(debug_assertions),
        }
    }
}

impl MemConfig {
    /// Minimum header records per segment.
    pub const MIN_UNITS_PER_SEGMENT: usize = 8;

    /// Create a configuration for small-footprint embeddings.
    pub fn low_memory() -> Self {
        Self {
            ballast: 256 * 1024, // 256KB
            stub_units_per_segment: 128,
            ..Default::default()
        }
    }

    /// Create a configuration that collects on every allocation.
    pub fn stress_testing() -> Self {
        Self {
            stress: true,
            verify_heap: true,
            ..Default::default()
        }
    }

    /// Create a configuration for running under memory sanitizers.
    pub fn sanitizer() -> Self {
        Self {
            disable_pools: true,
            ..Default::default()
        }
    }

    /// Resolve overrides from the process environment.
    ///
    /// Recognized variables:
    /// - `QUILL_GC_STRESS`: collect on every allocation
    /// - `QUILL_NO_POOLS`: route all buffers to the system allocator
    /// - `QUILL_GC_BALLAST`: bytes between collections
    /// - `QUILL_MEM_LIMIT`: usage ceiling in bytes
    /// - `QUILL_GC_TRACE`: log collections at info level
    pub fn from_env() -> Self {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Resolve overrides using a custom variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let flag = |name: &str| {
            lookup(name)
                .map(|v| !v.is_empty() && v != "0")
                .unwrap_or(false)
        };
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<usize>().ok());

        config.stress = flag("QUILL_GC_STRESS");
        config.disable_pools = flag("QUILL_NO_POOLS");
        config.trace = flag("QUILL_GC_TRACE");
        if let Some(ballast) = number("QUILL_GC_BALLAST") {
            config.ballast = ballast;
        }
        if let Some(limit) = number("QUILL_MEM_LIMIT") {
            config.usage_limit = limit;
        }

        config
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ballast == 0 {
            return Err(ConfigError::ZeroBallast);
        }
        if self.stub_units_per_segment < Self::MIN_UNITS_PER_SEGMENT {
            return Err(ConfigError::SegmentTooSmall);
        }
        let segment_bytes = self
            .stub_units_per_segment
            .saturating_mul(crate::stub::STUB_SIZE);
        if self.usage_limit != 0 && self.usage_limit < segment_bytes {
            return Err(ConfigError::LimitTooSmall);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Ballast must be non-zero.
    #[error("ballast must be at least one byte")]
    ZeroBallast,
    /// Too few header records per segment.
    #[error("header segments must hold at least 8 units")]
    SegmentTooSmall,
    /// The usage limit cannot hold a single header segment.
    #[error("usage limit is smaller than one header segment")]
    LimitTooSmall,
}
