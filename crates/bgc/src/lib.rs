//! # BGC - Conservative Mark & Finalize Core
//!
//! A conservative tracing collector core: explicit mark-stack tracing
//! with descriptor-driven scanning, optional parallel and incremental
//! marking, ordered finalization with disappearing links, debug object
//! headers, and reverse-reachability diagnostics.
//!
//! "Conservative" means candidate pointers are untrusted words: every
//! value found while scanning runs through a cheap plausible-range check
//! and then a block-header lookup before it can mark anything. An integer
//! that happens to look like a heap address can retain an object; it can
//! never corrupt the collector.
//!
//! ## Quick start
//!
//! ```rust
//! use bgc::{BlockKind, Collector, GcConfig};
//!
//! let gc = Collector::new(GcConfig::default()).unwrap();
//!
//! let root = gc.allocate_conservative(32, BlockKind::Normal).unwrap();
//! let child = gc.allocate_conservative(32, BlockKind::Normal).unwrap();
//! gc.heap().write_word(root, child).unwrap();
//! gc.add_root_object(root).unwrap();
//!
//! let summary = gc.collect("example").unwrap();
//! assert_eq!(summary.cycle, 1);
//! ```
//!
//! ## Degradation, not failure
//!
//! The mark stack overflowing, a blacklist filling up, or a rejected
//! finalizer registration all degrade service (a rescan, a saturated
//! diagnostic, a counted soft failure) rather than abort. Hard errors are
//! reserved for heap exhaustion and caller bugs, surfaced as [`GcError`].
//!
//! ## Subsystems
//!
//! - [`heap`] - block registry, header lookup, word access
//! - [`descr`] - object layout descriptors and their side tables
//! - [`marker`] - mark state machine, stack, blacklist, parallel pool
//! - [`finalize`] - disappearing links and ordered finalizers
//! - [`debug`] - guarded allocations with corruption reports
//! - [`backgraph`] - reverse reachability and backwards heights
//! - [`gc`] - the [`Collector`] tying everything together

pub mod backgraph;
pub mod config;
pub mod debug;
pub mod descr;
pub mod error;
pub mod finalize;
pub mod gc;
pub mod heap;
pub mod logging;
pub mod marker;
pub mod stats;

pub use backgraph::{BackEdges, BackGraph, MAX_IN};
pub use config::{ConfigError, GcConfig};
pub use debug::{AllocSite, CorruptionReport, DebugState};
pub use descr::{
    make_descriptor, BitmapDescr, GcDescr, MarkProc, MarkProcTable, TypeDescrTable, BITMAP_BITS,
    MAX_BITMAP_WORDS,
};
pub use error::{GcError, Result};
pub use finalize::{FinalizeOrdering, FinalizeOutcome, FinalizerFn, FinalizerNotifier};
pub use gc::Collector;
pub use heap::{BlockKind, Heap, WORD_BYTES};
pub use logging::{configure_logger, GcEvent, GcLogger, GcLoggerConfig, LogLevel};
pub use marker::{MarkState, ScanSink};
pub use stats::{CollectionSummary, GcStats, MarkSnapshot};

/// Collector with the default configuration
pub fn new_collector() -> Result<Collector> {
    Collector::new(GcConfig::default())
}

/// Collector configured from `BGC_*` environment variables
pub fn collector_from_env() -> Result<Collector> {
    Collector::new(GcConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_collector_defaults() {
        let gc = new_collector().unwrap();
        assert!(!gc.config().parallel_marking);
        assert_eq!(gc.stats().total_cycles(), 0);
    }
}
