//! Collector - Cycle Orchestration
//!
//! Ties the subsystems together and owns the shared side tables. One
//! collection cycle runs:
//!
//! 1. clear mark bits, reset the blacklist
//! 2. mark: push phases, then drain (sequentially, in bounded slices, or
//!    handed to the parallel pool), with overflow recovery folded in
//! 3. finalization pass: clear dead links, order and enqueue finalizers,
//!    resurrect the ready ones
//! 4. back-graph rebuild when retention diagnostics are on
//! 5. sweep: reclaim unmarked objects, or report them in leak mode
//!
//! Finalizer callbacks never run inside a cycle; the embedder calls
//! `invoke_finalizers` at a point of its choosing. Each collector is a
//! self-contained value with its own heap and registries, so two
//! collectors never share state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::backgraph::BackGraph;
use crate::config::GcConfig;
use crate::debug::{self, AllocSite, DebugState};
use crate::descr::{make_descriptor, GcDescr, MarkProc, MarkProcTable, TypeDescrTable};
use crate::error::{GcError, Result};
use crate::finalize::{FinalizeOrdering, FinalizeRegistry, FinalizerFn, FinalizerNotifier};
use crate::heap::{round_up_words, BlockKind, Heap, WORD_BYTES};
use crate::logging::{configure_logger, log_event, GcEvent, GcLoggerConfig, LogLevel};
use crate::marker::{MarkContext, MarkSources, MarkState, Marker, ParallelMarker};
use crate::stats::{CollectionSummary, GcStats, MarkSnapshot};

/// Call-chain slots reserved per debug header when enabled
const CALL_CHAIN_DEPTH: usize = 8;

struct ActiveCycle {
    cycle: u64,
    started: Instant,
    mark_before: MarkSnapshot,
}

/// A complete, self-contained collector instance
pub struct Collector {
    config: GcConfig,
    heap: Heap,
    procs: MarkProcTable,
    types: TypeDescrTable,
    blacklist: crate::marker::Blacklist,
    marker: Mutex<Marker>,
    finalizers: FinalizeRegistry,
    back_graph: BackGraph,
    debug: DebugState,
    stats: GcStats,
    /// (start, bytes) ranges scanned conservatively every cycle
    roots: RwLock<Vec<(usize, usize)>>,
    /// Individual heap objects pinned as roots
    root_objects: RwLock<Vec<usize>>,
    cycle: AtomicU64,
    active: Mutex<Option<ActiveCycle>>,
    /// Heap size at which `should_collect` starts answering yes
    heap_trigger: AtomicUsize,
}

impl Collector {
    pub fn new(config: GcConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| GcError::Configuration(e.to_string()))?;

        if config.verbose {
            configure_logger(GcLoggerConfig {
                level: LogLevel::Debug,
                console: true,
                ..Default::default()
            });
        }

        let debug = if config.save_call_chains {
            DebugState::with_call_chains(CALL_CHAIN_DEPTH)
        } else {
            DebugState::new()
        };

        Ok(Self {
            heap: Heap::new(config.max_heap_size, config.block_size),
            procs: MarkProcTable::new(),
            types: TypeDescrTable::new(),
            blacklist: crate::marker::Blacklist::new(),
            marker: Mutex::new(Marker::new(config.mark_stack_capacity, config.incremental)),
            finalizers: FinalizeRegistry::new(),
            back_graph: BackGraph::new(),
            debug,
            stats: GcStats::new(),
            roots: RwLock::new(Vec::new()),
            root_objects: RwLock::new(Vec::new()),
            cycle: AtomicU64::new(0),
            active: Mutex::new(None),
            heap_trigger: AtomicUsize::new(config.initial_heap_size),
            config,
        })
    }

    // === Accessors ===

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn blacklist(&self) -> &crate::marker::Blacklist {
        &self.blacklist
    }

    pub fn back_graph(&self) -> &BackGraph {
        &self.back_graph
    }

    pub fn debug_state(&self) -> &DebugState {
        &self.debug
    }

    /// Whether heap growth since the last cycle warrants a collection.
    /// Advisory only; the embedder decides when to call `collect`.
    pub fn should_collect(&self) -> bool {
        self.heap.total_bytes() >= self.heap_trigger.load(Ordering::Relaxed)
    }

    fn ctx(&self) -> MarkContext<'_> {
        MarkContext {
            heap: &self.heap,
            procs: &self.procs,
            types: &self.types,
            blacklist: &self.blacklist,
            counters: &self.stats.mark,
        }
    }

    // === Allocation ===

    pub fn allocate(&self, size: usize, kind: BlockKind, descr: GcDescr) -> Result<usize> {
        self.heap.allocate(size, kind, descr)
    }

    /// Allocate with a per-word pointer layout
    pub fn allocate_with_layout(
        &self,
        size: usize,
        kind: BlockKind,
        pointer_words: &[bool],
    ) -> Result<usize> {
        self.heap.allocate(size, kind, make_descriptor(pointer_words))
    }

    /// Allocate with every word treated as a possible pointer
    pub fn allocate_conservative(&self, size: usize, kind: BlockKind) -> Result<usize> {
        self.heap
            .allocate(size, kind, GcDescr::Length(round_up_words(size)))
    }

    /// Allocate an object that must be declared before mutation once an
    /// incremental cycle is active; see [`Collector::end_stubborn_change`]
    pub fn allocate_stubborn(&self, size: usize) -> Result<usize> {
        self.heap.allocate(
            size,
            BlockKind::Stubborn,
            GcDescr::Length(round_up_words(size)),
        )
    }

    /// Note that a stubborn object was mutated, so an active incremental
    /// cycle rescans its block
    pub fn end_stubborn_change(&self, addr: usize) -> Result<()> {
        let block = self.heap.header_for(addr).ok_or_else(|| {
            GcError::InvalidUsage(format!("stubborn change on non-heap address {addr:#x}"))
        })?;
        block.set_dirty();
        Ok(())
    }

    pub fn debug_allocate(
        &self,
        size: usize,
        kind: BlockKind,
        pointer_words: &[bool],
        site: AllocSite,
    ) -> Result<usize> {
        debug::debug_allocate(&self.heap, &self.debug, size, kind, pointer_words, site)
    }

    pub fn debug_free(&self, payload: usize) -> Result<()> {
        debug::debug_free(&self.heap, &self.debug, payload)
    }

    pub fn debug_realloc(
        &self,
        payload: usize,
        new_size: usize,
        kind: BlockKind,
        site: AllocSite,
    ) -> Result<usize> {
        debug::debug_realloc(&self.heap, &self.debug, payload, new_size, kind, site)
    }

    pub fn check_debug_object(&self, payload: usize) -> Result<()> {
        debug::check_object(&self.heap, &self.debug, payload)
    }

    /// Explicitly free an object. Freeing a non-heap address or freeing
    /// twice is a caller bug.
    pub fn free(&self, addr: usize) -> Result<()> {
        let block = self
            .heap
            .header_for(addr)
            .ok_or_else(|| GcError::InvalidUsage(format!("free of non-heap address {addr:#x}")))?;
        let index = block
            .object_index(addr)
            .ok_or_else(|| GcError::Internal("header lookup lost the object".to_string()))?;
        if block.is_free(index) {
            return Err(GcError::InvalidUsage(format!("double free of {addr:#x}")));
        }
        let base = block.base_of_index(index);
        self.finalizers.unregister_finalizer(base);
        block.set_free(index);
        Ok(())
    }

    // === Roots ===

    /// Register a word-aligned memory range scanned conservatively as a
    /// root every cycle. The range must stay valid until unregistered.
    pub fn register_root_range(&self, start: usize, bytes: usize) -> Result<()> {
        if start % WORD_BYTES != 0 || bytes % WORD_BYTES != 0 {
            return Err(GcError::InvalidUsage(format!(
                "root range {start:#x}+{bytes} is not word aligned"
            )));
        }
        self.roots.write().push((start, bytes));
        Ok(())
    }

    /// Returns true if a range starting at `start` was registered
    pub fn unregister_root_range(&self, start: usize) -> bool {
        let mut roots = self.roots.write();
        let before = roots.len();
        roots.retain(|&(s, _)| s != start);
        roots.len() != before
    }

    /// Pin a single heap object as a root
    pub fn add_root_object(&self, obj: usize) -> Result<()> {
        if self.heap.header_for(obj).is_none() {
            return Err(GcError::InvalidUsage(format!(
                "root object {obj:#x} is not in the heap"
            )));
        }
        self.root_objects.write().push(obj);
        Ok(())
    }

    pub fn remove_root_object(&self, obj: usize) -> bool {
        let mut objects = self.root_objects.write();
        let before = objects.len();
        objects.retain(|&o| o != obj);
        objects.len() != before
    }

    // === Descriptors ===

    /// Register a mark procedure; the returned index goes into
    /// `GcDescr::Proc` descriptors
    pub fn register_mark_proc(&self, proc_fn: MarkProc) -> usize {
        self.procs.register(proc_fn)
    }

    /// Register a type descriptor resolved through `GcDescr::PerObject`
    pub fn register_type_descriptor(&self, key: usize, descr: GcDescr) {
        self.types.register(key, descr);
    }

    // === Finalization ===

    /// Register a slot to be zeroed when `target` becomes unreachable.
    /// Returns false (and counts a failure) for an invalid registration.
    pub fn register_disappearing_link(&self, slot: usize, target: usize) -> bool {
        if slot % WORD_BYTES != 0 || self.heap.header_for(target).is_none() {
            self.finalizers.record_failure();
            return false;
        }
        self.finalizers.register_link(slot, target);
        true
    }

    pub fn unregister_disappearing_link(&self, slot: usize) -> bool {
        self.finalizers.unregister_link(slot)
    }

    /// Register a finalizer for a heap object.
    /// `FinalizeOrdering::Unreachable` requires `java_finalization`.
    pub fn register_finalizer(
        &self,
        obj: usize,
        callback: FinalizerFn,
        ordering: FinalizeOrdering,
    ) -> Result<Option<FinalizerFn>> {
        if self.heap.header_for(obj).is_none() {
            self.finalizers.record_failure();
            return Err(GcError::InvalidUsage(format!(
                "finalizer target {obj:#x} is not in the heap"
            )));
        }
        if ordering == FinalizeOrdering::Unreachable && !self.config.java_finalization {
            self.finalizers.record_failure();
            return Err(GcError::Configuration(
                "unreachable finalization requires java_finalization".to_string(),
            ));
        }
        Ok(self.finalizers.register_finalizer(obj, callback, ordering))
    }

    pub fn unregister_finalizer(&self, obj: usize) -> bool {
        self.finalizers.unregister_finalizer(obj)
    }

    pub fn set_finalizer_notifier(&self, notifier: Option<FinalizerNotifier>) {
        self.finalizers.set_notifier(notifier);
    }

    /// Run every queued finalizer. Never called from inside a cycle.
    pub fn invoke_finalizers(&self) -> usize {
        let count = self.finalizers.invoke_finalizers();
        self.stats.record_finalizers(count as u64);
        count
    }

    pub fn ready_finalizers(&self) -> usize {
        self.finalizers.ready_count()
    }

    pub fn finalization_failures(&self) -> u64 {
        self.finalizers.failures()
    }

    // === Collection ===

    /// Run one full collection cycle
    pub fn collect(&self, reason: &str) -> Result<CollectionSummary> {
        let roots = self.roots.read().clone();
        let root_objects = self.root_objects.read().clone();
        let sources = MarkSources {
            root_ranges: &roots,
            root_objects: &root_objects,
        };
        let ctx = self.ctx();

        let mut marker = self.marker.lock();
        self.begin_cycle(&mut marker, reason);
        let cycle = self.cycle.load(Ordering::Relaxed);
        log_event(GcEvent::PhaseStart {
            phase: "mark".to_string(),
            cycle,
        });
        let mark_started = Instant::now();

        if self.config.parallel_marking && self.config.effective_markers() > 1 {
            // Push phases stay sequential; the drain goes to the pool
            while !matches!(marker.state(), MarkState::RootsPushed | MarkState::Idle) {
                marker.mark_some(&ctx, &sources);
            }
            if marker.state() == MarkState::RootsPushed {
                let entries = marker.take_entries();
                let capacity = self.config.mark_stack_capacity.max(entries.len() * 2);
                let overflowed = ParallelMarker::new(entries, capacity)?
                    .run(&ctx, self.config.effective_markers());
                marker.note_parallel_result(&ctx, overflowed);
            }
        }
        // Sequential drain, plus any overflow recovery from either path
        while !marker.mark_some(&ctx, &sources) {}
        log_event(GcEvent::PhaseEnd {
            phase: "mark".to_string(),
            duration_ms: mark_started.elapsed().as_secs_f64() * 1000.0,
            cycle,
        });

        // Released before finalization so the notifier hook can re-enter
        // the collector without deadlocking
        let degraded = marker.take_degraded();
        drop(marker);
        self.finish_cycle(degraded, &ctx)
    }

    /// Perform one bounded slice of incremental collection work.
    /// Returns the summary once a slice completes the cycle.
    pub fn collect_a_little(&self) -> Result<Option<CollectionSummary>> {
        if !self.config.incremental {
            return Err(GcError::InvalidUsage(
                "collect_a_little requires incremental marking".to_string(),
            ));
        }
        let roots = self.roots.read().clone();
        let root_objects = self.root_objects.read().clone();
        let sources = MarkSources {
            root_ranges: &roots,
            root_objects: &root_objects,
        };
        let ctx = self.ctx();

        let mut marker = self.marker.lock();
        if self.active.lock().is_none() {
            self.begin_cycle(&mut marker, "incremental");
            return Ok(None);
        }
        if marker.mark_some(&ctx, &sources) {
            let degraded = marker.take_degraded();
            drop(marker);
            return self.finish_cycle(degraded, &ctx).map(Some);
        }
        Ok(None)
    }

    fn begin_cycle(&self, marker: &mut Marker, reason: &str) {
        let mut active = self.active.lock();
        if active.is_some() {
            // An incremental cycle is already underway; join it
            return;
        }
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        log_event(GcEvent::CycleStart {
            cycle,
            reason: reason.to_string(),
        });
        self.heap.clear_all_marks();
        self.blacklist.clear();
        if self.config.incremental {
            self.heap.set_dirty_tracking(true);
        }
        marker.prepare_cycle();
        *active = Some(ActiveCycle {
            cycle,
            started: Instant::now(),
            mark_before: self.stats.mark.snapshot(),
        });
    }

    /// Complete the cycle after marking. The caller must have released
    /// the marker lock; the finalization pass runs a notifier hook that
    /// may re-enter the collector.
    fn finish_cycle(&self, degraded: bool, ctx: &MarkContext<'_>) -> Result<CollectionSummary> {
        self.heap.set_dirty_tracking(false);

        let active = self.active.lock().take().ok_or_else(|| {
            GcError::Internal("cycle finished without being started".to_string())
        })?;
        let mark_delta = self.stats.mark.snapshot().delta(&active.mark_before);
        if self.config.stats_enabled {
            log_event(GcEvent::MarkStats {
                marked_count: mark_delta.objects_marked,
                scanned_bytes: mark_delta.bytes_scanned,
                range_splits: mark_delta.range_splits,
            });
        }

        let outcome = self.finalizers.finalize_pass(ctx);
        self.stats.record_links_cleared(outcome.links_cleared as u64);
        if self.config.stats_enabled {
            log_event(GcEvent::FinalizeStats {
                links_cleared: outcome.links_cleared,
                enqueued: outcome.enqueued,
                revived: outcome.revived,
            });
        }

        if self.config.track_back_pointers {
            self.back_graph.rebuild(ctx);
            self.back_graph.report_height();
        }

        let (reclaimed, leaked) = self.sweep();
        self.stats.record_reclaimed(reclaimed);
        self.stats.record_cycle(degraded);
        if self.config.stats_enabled {
            log_event(GcEvent::BlacklistStats {
                entries: self.blacklist.len(),
                hits: mark_delta.blacklist_hits,
            });
        }

        // Next advisory trigger scales with the surviving heap
        self.heap_trigger.store(
            (self.heap.total_bytes() * 2).max(self.config.initial_heap_size),
            Ordering::Relaxed,
        );

        let duration = active.started.elapsed();
        log_event(GcEvent::CycleEnd {
            cycle: active.cycle,
            duration_ms: duration.as_secs_f64() * 1000.0,
            reclaimed_bytes: reclaimed,
        });

        Ok(CollectionSummary {
            cycle: active.cycle,
            duration,
            mark: mark_delta,
            degraded,
            links_cleared: outcome.links_cleared,
            finalizers_ready: outcome.enqueued,
            finalizers_revived: outcome.revived,
            bytes_reclaimed: reclaimed,
            leaked_objects: leaked,
        })
    }

    /// Reclaim unmarked objects, or report them in leak-finding mode.
    /// Returns (bytes reclaimed, objects reported leaked).
    fn sweep(&self) -> (usize, usize) {
        let mut reclaimed = 0usize;
        let mut leaked = 0usize;
        for block in self.heap.blocks_snapshot() {
            if block.kind() == BlockKind::Uncollectable {
                continue;
            }
            for idx in block.allocated_indices() {
                if block.is_marked(idx) {
                    continue;
                }
                let base = block.base_of_index(idx);
                let payload = base + self.debug.header_words() * WORD_BYTES;
                if self.config.find_leaks {
                    leaked += 1;
                    log_event(GcEvent::LeakReport {
                        address: base,
                        size: block.object_size(),
                    });
                    if let Some((label, line)) = self.debug.site_of(payload) {
                        log::trace!("leaked object {base:#x} allocated at {label}:{line}");
                    }
                } else {
                    self.debug.forget(payload);
                    block.set_free(idx);
                    reclaimed += block.object_size();
                }
            }
        }
        (reclaimed, leaked)
    }
}
