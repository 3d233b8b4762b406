//! Stats Module - Collector Performance Monitoring
//!
//! Collects counters for:
//! - Mark phase work (objects marked, bytes scanned, range splits)
//! - Degradation events (stack overflows, blacklist hits)
//! - Finalization activity
//! - Per-cycle summaries

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters updated from inside the tracing loop.
///
/// Shared by reference between the sequential marker and all parallel
/// marker workers; every field is an atomic.
#[derive(Debug, Default)]
pub struct MarkCounters {
    /// Objects whose mark bit transitioned 0 -> 1 this process lifetime
    pub objects_marked: AtomicU64,
    /// Bytes of object/root memory scanned for candidate pointers
    pub bytes_scanned: AtomicU64,
    /// Mark stack entries pushed
    pub entries_pushed: AtomicU64,
    /// Large ranges split in place
    pub range_splits: AtomicU64,
    /// Candidate words that passed the cheap range filter but had no header
    pub blacklist_hits: AtomicU64,
    /// Mark stack overflow events
    pub stack_overflows: AtomicU64,
}

impl MarkCounters {
    pub fn snapshot(&self) -> MarkSnapshot {
        MarkSnapshot {
            objects_marked: self.objects_marked.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            entries_pushed: self.entries_pushed.load(Ordering::Relaxed),
            range_splits: self.range_splits.load(Ordering::Relaxed),
            blacklist_hits: self.blacklist_hits.load(Ordering::Relaxed),
            stack_overflows: self.stack_overflows.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`MarkCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkSnapshot {
    pub objects_marked: u64,
    pub bytes_scanned: u64,
    pub entries_pushed: u64,
    pub range_splits: u64,
    pub blacklist_hits: u64,
    pub stack_overflows: u64,
}

impl MarkSnapshot {
    /// Difference against an earlier snapshot (per-cycle deltas)
    pub fn delta(&self, earlier: &MarkSnapshot) -> MarkSnapshot {
        MarkSnapshot {
            objects_marked: self.objects_marked - earlier.objects_marked,
            bytes_scanned: self.bytes_scanned - earlier.bytes_scanned,
            entries_pushed: self.entries_pushed - earlier.entries_pushed,
            range_splits: self.range_splits - earlier.range_splits,
            blacklist_hits: self.blacklist_hits - earlier.blacklist_hits,
            stack_overflows: self.stack_overflows - earlier.stack_overflows,
        }
    }
}

/// GcStats - central statistics repository for one collector
pub struct GcStats {
    /// Total completed collection cycles
    total_cycles: AtomicU64,
    /// Cycles that degraded to a full rescan after a stack overflow
    degraded_cycles: AtomicU64,
    /// Finalizers invoked
    finalizers_run: AtomicU64,
    /// Disappearing links cleared
    links_cleared: AtomicU64,
    /// Bytes reclaimed by sweep accounting
    bytes_reclaimed: AtomicUsize,
    /// Mark-phase counters
    pub mark: MarkCounters,
    /// Collector construction time
    start_time: Instant,
}

impl GcStats {
    pub fn new() -> Self {
        Self {
            total_cycles: AtomicU64::new(0),
            degraded_cycles: AtomicU64::new(0),
            finalizers_run: AtomicU64::new(0),
            links_cleared: AtomicU64::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            mark: MarkCounters::default(),
            start_time: Instant::now(),
        }
    }

    pub fn record_cycle(&self, degraded: bool) {
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded_cycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_finalizers(&self, count: u64) {
        self.finalizers_run.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_links_cleared(&self, count: u64) {
        self.links_cleared.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, bytes: usize) {
        self.bytes_reclaimed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles.load(Ordering::Relaxed)
    }

    pub fn degraded_cycles(&self) -> u64 {
        self.degraded_cycles.load(Ordering::Relaxed)
    }

    pub fn finalizers_run(&self) -> u64 {
        self.finalizers_run.load(Ordering::Relaxed)
    }

    pub fn links_cleared(&self) -> u64 {
        self.links_cleared.load(Ordering::Relaxed)
    }

    pub fn bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one completed collection, returned by `Collector::collect`
#[derive(Debug, Clone)]
pub struct CollectionSummary {
    /// Cycle number (1-based)
    pub cycle: u64,
    /// Wall-clock duration of the whole cycle
    pub duration: Duration,
    /// Mark-phase deltas for this cycle
    pub mark: MarkSnapshot,
    /// Whether the cycle degraded to a full rescan at least once
    pub degraded: bool,
    /// Disappearing links cleared this cycle
    pub links_cleared: usize,
    /// Finalizers newly enqueued this cycle
    pub finalizers_ready: usize,
    /// Unreachable-ordering objects revived instead of finalized
    pub finalizers_revived: usize,
    /// Bytes of unreachable objects reclaimed (0 in leak-finding mode)
    pub bytes_reclaimed: usize,
    /// Unreachable objects left in place by leak-finding mode
    pub leaked_objects: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_accounting() {
        let stats = GcStats::new();
        stats.record_cycle(false);
        stats.record_cycle(true);

        assert_eq!(stats.total_cycles(), 2);
        assert_eq!(stats.degraded_cycles(), 1);
    }

    #[test]
    fn test_mark_snapshot_delta() {
        let counters = MarkCounters::default();
        counters.objects_marked.store(5, Ordering::Relaxed);
        let before = counters.snapshot();

        counters.objects_marked.store(12, Ordering::Relaxed);
        counters.bytes_scanned.store(640, Ordering::Relaxed);
        let after = counters.snapshot();

        let delta = after.delta(&before);
        assert_eq!(delta.objects_marked, 7);
        assert_eq!(delta.bytes_scanned, 640);
    }
}
