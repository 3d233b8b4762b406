//! Configuration Module - Collector Tuning Parameters
//!
//! Manages all configuration parameters for BGC.
//! Proper configuration balances throughput, latency, and memory footprint.

/// Main configuration for the BGC collector
///
/// Stores all parameters affecting collector behavior.
/// Most parameters have sensible defaults.
///
/// # Examples
///
/// ```rust
/// use bgc::GcConfig;
///
/// // Use default configuration
/// let config = GcConfig::default();
///
/// // Custom configuration for parallel marking
/// let config = GcConfig {
///     parallel_marking: true,
///     marker_threads: Some(4),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Initial heap size in bytes
    ///
    /// `Collector::should_collect` suggests a cycle once block storage
    /// reaches this size; the trigger then grows with the heap.
    /// Default: 1MB
    pub initial_heap_size: usize,

    /// Maximum heap size in bytes
    ///
    /// Hard limit for heap growth. Allocation returns OOM if exceeded.
    /// Default: 64MB
    pub max_heap_size: usize,

    /// Heap block size in bytes
    ///
    /// Small objects share a block of this size; larger objects get a
    /// dedicated block. Must be a power of two.
    /// Default: 4KB
    pub block_size: usize,

    /// Initial mark stack capacity in entries
    ///
    /// The stack doubles after any cycle that overflowed it.
    /// Default: 4096
    pub mark_stack_capacity: usize,

    /// Enable parallel marking
    ///
    /// Drains the mark stack with a pool of marker threads instead of the
    /// single-threaded tracing loop.
    /// Default: false
    pub parallel_marking: bool,

    /// Number of marker threads for parallel marking
    ///
    /// If None, auto-detects based on CPU cores:
    /// markers = min(4, num_cpus / 2)
    ///
    /// Default: Auto-detect
    pub marker_threads: Option<usize>,

    /// Enable incremental marking
    ///
    /// `collect_a_little` performs one bounded slice of mark work per call;
    /// words written during an active cycle dirty their block for a rescan.
    /// Default: false
    pub incremental: bool,

    /// Track back pointers for retention diagnostics
    ///
    /// Builds the inverse points-to graph each cycle. Diagnostic only,
    /// never affects collection correctness.
    /// Default: false
    pub track_back_pointers: bool,

    /// Leak-finding mode
    ///
    /// Unreachable objects are reported through the logger instead of
    /// being reclaimed.
    /// Default: false
    pub find_leaks: bool,

    /// Enable java-style unreachable finalization
    ///
    /// Objects registered with `FinalizeOrdering::Unreachable` are revived
    /// rather than finalized when they turn out to be reachable from another
    /// object already scheduled for finalization. Known-risky legacy
    /// behavior; opt-in only.
    /// Default: false
    pub java_finalization: bool,

    /// Record allocation call chains in debug headers
    ///
    /// Reserves fixed-depth call-chain slots in every debug allocation.
    /// Default: false
    pub save_call_chains: bool,

    /// Enable verbose collector logging
    ///
    /// Logs cycle start/end, phase durations, mark statistics.
    /// Default: false
    pub verbose: bool,

    /// Enable statistics collection
    ///
    /// Emits the per-cycle mark, finalization, and blacklist stat events
    /// through the logger. Counters are maintained either way.
    /// Default: true
    pub stats_enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        let num_cpus = num_cpus::get();

        GcConfig {
            initial_heap_size: MB,
            max_heap_size: 64 * MB,
            block_size: 4 * KB,
            mark_stack_capacity: 4096,
            parallel_marking: false,
            marker_threads: Some((num_cpus / 2).clamp(1, 4)),
            incremental: false,
            track_back_pointers: false,
            find_leaks: false,
            java_finalization: false,
            save_call_chains: false,
            verbose: false,
            stats_enabled: true,
        }
    }
}

impl GcConfig {
    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    /// Returns error if configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_heap_size == 0 {
            return Err(ConfigError::InvalidHeapSize(
                "max_heap_size must be > 0".to_string(),
            ));
        }

        if self.initial_heap_size > self.max_heap_size {
            return Err(ConfigError::InvalidHeapSize(
                "initial_heap_size cannot exceed max_heap_size".to_string(),
            ));
        }

        if !self.block_size.is_power_of_two() || self.block_size < 256 {
            return Err(ConfigError::InvalidBlockSize(
                "block_size must be a power of two >= 256".to_string(),
            ));
        }

        if self.mark_stack_capacity < 16 {
            return Err(ConfigError::InvalidMarkStack(
                "mark_stack_capacity must be >= 16".to_string(),
            ));
        }

        if let Some(threads) = self.marker_threads {
            if threads == 0 {
                return Err(ConfigError::InvalidMarkerThreads(
                    "marker_threads must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - BGC_INITIAL_HEAP
    /// - BGC_MAX_HEAP
    /// - BGC_MARKERS (implies parallel marking when > 1)
    /// - BGC_ENABLE_INCREMENTAL
    /// - BGC_BACKTRACES
    /// - BGC_FIND_LEAK
    /// - BGC_VERBOSE
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BGC_INITIAL_HEAP") {
            if let Ok(size) = val.parse::<usize>() {
                config.initial_heap_size = size;
            }
        }

        if let Ok(val) = std::env::var("BGC_MAX_HEAP") {
            if let Ok(size) = val.parse::<usize>() {
                config.max_heap_size = size;
            }
        }

        if let Ok(val) = std::env::var("BGC_MARKERS") {
            if let Ok(threads) = val.parse::<usize>() {
                config.marker_threads = Some(threads.max(1));
                config.parallel_marking = threads > 1;
            }
        }

        if let Ok(val) = std::env::var("BGC_ENABLE_INCREMENTAL") {
            config.incremental = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("BGC_BACKTRACES") {
            config.track_back_pointers = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("BGC_FIND_LEAK") {
            config.find_leaks = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("BGC_VERBOSE") {
            config.verbose = parse_bool(&val);
        }

        config
    }

    /// Effective marker thread count
    pub fn effective_markers(&self) -> usize {
        if !self.parallel_marking {
            return 1;
        }
        self.marker_threads
            .unwrap_or_else(|| (num_cpus::get() / 2).clamp(1, 4))
            .max(1)
    }
}

fn parse_bool(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(String),

    #[error("Invalid mark stack: {0}")]
    InvalidMarkStack(String),

    #[error("Invalid marker threads: {0}")]
    InvalidMarkerThreads(String),
}

pub(crate) const KB: usize = 1024;
pub(crate) const MB: usize = 1024 * 1024;
