//! Finalization - Disappearing Links and Ordered Finalizers
//!
//! Two registries, both side tables keyed by address:
//!
//! - disappearing links: a slot address whose word is cleared to zero when
//!   the object it names becomes unreachable
//! - finalizable objects: a callback invoked after the object is found
//!   unreachable, with a choice of ordering discipline
//!
//! The pass runs after marking, before sweep:
//!
//! 1. clear links whose target is unmarked
//! 2. snapshot the unmarked finalizable set
//! 3. trace the referents of ordered entries (without marking the entries
//!    themselves), so an object reachable from another finalizable object
//!    is deferred to a later cycle; if the trace overflows, every ordered
//!    entry is deferred instead of trusting the partial result
//! 4. move the still-unmarked entries to the ready queue, then mark each
//!    ready object and trace it, so the object and everything its
//!    finalizer might touch survive the sweep
//! 5. drop links whose own slot sits in a dead object, before the sweep
//!    recycles the memory under them
//! 6. notify the registered hook, outside all locks
//!
//! Callbacks never run inside the pass; `invoke_finalizers` drains the
//! ready queue whenever the embedder chooses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap::write_word_raw;
use crate::marker::{mark_and_push, push_contents, push_contents_ex, MarkContext};
use crate::marker::{MarkEntry, MarkStack};

/// When a finalizable object may be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOrdering {
    /// Deferred while reachable from another finalizable object
    Normal,
    /// As Normal, but the object's pointers into itself are ignored, so a
    /// self-referential object can still be finalized
    IgnoreSelf,
    /// Enqueued as soon as unreachable, ignoring other finalizers
    NoOrder,
    /// Java-style: if another finalizable object still reaches it, the
    /// object is revived for this cycle instead of deferred
    Unreachable,
}

/// Entry capacity of the ordering-trace stack
const ORDER_TRACE_ENTRIES: usize = 1 << 20;

/// Finalizer callback, invoked with the object base address
pub type FinalizerFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Hook invoked when new finalizers become ready
pub type FinalizerNotifier = Arc<dyn Fn() + Send + Sync>;

struct Registration {
    callback: FinalizerFn,
    ordering: FinalizeOrdering,
}

/// A finalizer whose object was found unreachable
pub struct ReadyFinalizer {
    pub object: usize,
    callback: FinalizerFn,
}

/// Result of one finalization pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub links_cleared: usize,
    pub enqueued: usize,
    pub revived: usize,
}

/// Registry for disappearing links and finalizable objects
#[derive(Default)]
pub struct FinalizeRegistry {
    /// slot address -> target object base
    links: Mutex<HashMap<usize, usize>>,
    /// object base -> registration
    registrations: Mutex<HashMap<usize, Registration>>,
    ready: Mutex<VecDeque<ReadyFinalizer>>,
    notifier: Mutex<Option<FinalizerNotifier>>,
    /// Registrations rejected (bad address, disallowed ordering)
    failures: AtomicU64,
}

impl FinalizeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // === Disappearing links ===

    /// Register `slot` to be cleared when `target` dies.
    /// Re-registering a slot replaces its previous target.
    pub fn register_link(&self, slot: usize, target: usize) {
        self.links.lock().insert(slot, target);
    }

    /// Returns true if the slot was registered
    pub fn unregister_link(&self, slot: usize) -> bool {
        self.links.lock().remove(&slot).is_some()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    // === Finalizers ===

    /// Register a finalizer, returning any callback it replaced
    pub fn register_finalizer(
        &self,
        object: usize,
        callback: FinalizerFn,
        ordering: FinalizeOrdering,
    ) -> Option<FinalizerFn> {
        self.registrations
            .lock()
            .insert(object, Registration { callback, ordering })
            .map(|old| old.callback)
    }

    /// Returns true if the object had a finalizer
    pub fn unregister_finalizer(&self, object: usize) -> bool {
        self.registrations.lock().remove(&object).is_some()
    }

    pub fn finalizer_count(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn set_notifier(&self, notifier: Option<FinalizerNotifier>) {
        *self.notifier.lock() = notifier;
    }

    /// Count a rejected registration
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    // === The pass ===

    /// Run the finalization pass against the current mark state.
    /// Must run after marking completes and before the sweep.
    pub fn finalize_pass(&self, ctx: &MarkContext<'_>) -> FinalizeOutcome {
        self.finalize_pass_with(ctx, ORDER_TRACE_ENTRIES)
    }

    fn finalize_pass_with(
        &self,
        ctx: &MarkContext<'_>,
        trace_capacity: usize,
    ) -> FinalizeOutcome {
        let mut outcome = FinalizeOutcome::default();

        // 1. Clear links to unmarked targets
        {
            let mut links = self.links.lock();
            links.retain(|&slot, &mut target| {
                if is_marked(ctx, target) {
                    true
                } else {
                    write_word_raw(slot, 0);
                    outcome.links_cleared += 1;
                    false
                }
            });
        }

        // 2. Snapshot the unmarked finalizable set
        let dead: Vec<(usize, FinalizeOrdering)> = {
            let regs = self.registrations.lock();
            regs.iter()
                .filter(|(&obj, _)| !is_marked(ctx, obj))
                .map(|(&obj, reg)| (obj, reg.ordering))
                .collect()
        };
        if dead.is_empty() {
            self.purge_dead_slots(ctx);
            return outcome;
        }

        // 3. Trace referents of ordered entries without marking the
        // entries themselves; whatever gets marked here is reachable from
        // some other finalizable object
        let mut stack = MarkStack::new(trace_capacity);
        for &(obj, ordering) in &dead {
            let ignore = match ordering {
                FinalizeOrdering::Normal => None,
                FinalizeOrdering::IgnoreSelf => Some(object_extent(ctx, obj)),
                FinalizeOrdering::NoOrder | FinalizeOrdering::Unreachable => continue,
            };
            if let Some(entry) = object_entry(ctx, obj) {
                push_contents_ex(ctx, &mut stack, &entry, ignore.flatten());
            }
        }
        drain(ctx, &mut stack);

        // An overflowed trace discarded entries, so the mark bits below
        // understate reachability; no ordered entry may be enqueued on
        // that evidence
        let trace_complete = !stack.take_overflowed();
        if !trace_complete {
            log::warn!("finalization ordering trace overflowed, deferring ordered entries");
        }

        // 4. Enqueue the entries still unmarked; revive Unreachable ones
        // that another finalizer's referents now reach
        let mut newly_ready = Vec::new();
        {
            let mut regs = self.registrations.lock();
            for &(obj, ordering) in &dead {
                let marked_now = is_marked(ctx, obj);
                let take = match ordering {
                    FinalizeOrdering::NoOrder => true,
                    FinalizeOrdering::Normal | FinalizeOrdering::IgnoreSelf => {
                        trace_complete && !marked_now
                    }
                    FinalizeOrdering::Unreachable => {
                        if marked_now {
                            outcome.revived += 1;
                            false
                        } else {
                            trace_complete
                        }
                    }
                };
                if take {
                    if let Some(reg) = regs.remove(&obj) {
                        newly_ready.push(ReadyFinalizer {
                            object: obj,
                            callback: reg.callback,
                        });
                    }
                }
            }
        }

        // Entries deferred on an incomplete trace keep their mark until
        // the retry, or the sweep would free them out from under their
        // registrations
        if !trace_complete {
            for &(obj, _) in &dead {
                mark_and_push(ctx, &mut stack, obj);
            }
        }

        // Ready objects are resurrected: they and their referents must
        // survive until the finalizer has run
        for ready in &newly_ready {
            mark_and_push(ctx, &mut stack, ready.object);
        }
        drain(ctx, &mut stack);

        outcome.enqueued = newly_ready.len();
        self.ready.lock().extend(newly_ready);

        // 5. Registrations whose slot died go with their object
        self.purge_dead_slots(ctx);

        // 6. Notify outside all locks
        if outcome.enqueued > 0 {
            let notifier = self.notifier.lock().clone();
            if let Some(notify) = notifier {
                notify();
            }
        }

        outcome
    }

    /// Drop links whose slot's own object is unreachable. The sweep is
    /// about to recycle that memory, and a stale entry would clear
    /// whatever object lands on the address next. The slot word itself is
    /// left untouched.
    fn purge_dead_slots(&self, ctx: &MarkContext<'_>) {
        self.links.lock().retain(|&slot, _| {
            match ctx.heap.header_for(slot) {
                Some(_) => is_marked(ctx, slot),
                // Slots outside the heap are never recycled by the sweep
                None => true,
            }
        });
    }

    /// Invoke every queued finalizer, outside all registry locks.
    /// Returns the number invoked.
    pub fn invoke_finalizers(&self) -> usize {
        let batch: Vec<ReadyFinalizer> = self.ready.lock().drain(..).collect();
        let count = batch.len();
        for ready in batch {
            (ready.callback)(ready.object);
        }
        count
    }
}

fn is_marked(ctx: &MarkContext<'_>, obj: usize) -> bool {
    match ctx.heap.header_for(obj) {
        Some(block) => block
            .object_index(obj)
            .map(|i| !block.is_free(i) && block.is_marked(i))
            .unwrap_or(false),
        None => false,
    }
}

fn object_entry(ctx: &MarkContext<'_>, obj: usize) -> Option<MarkEntry> {
    let block = ctx.heap.header_for(obj)?;
    let index = block.object_index(obj)?;
    if block.is_free(index) || !block.kind().is_scanned() {
        return None;
    }
    Some(MarkEntry {
        start: block.base_of_index(index),
        descr: block.descr(index),
    })
}

fn object_extent(ctx: &MarkContext<'_>, obj: usize) -> Option<(usize, usize)> {
    let block = ctx.heap.header_for(obj)?;
    let index = block.object_index(obj)?;
    let base = block.base_of_index(index);
    Some((base, base + block.object_size()))
}

fn drain(ctx: &MarkContext<'_>, stack: &mut MarkStack) {
    while let Some(entry) = stack.pop() {
        push_contents(ctx, stack, &entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descr::{GcDescr, MarkProcTable, TypeDescrTable};
    use crate::heap::{read_word_raw, BlockKind, Heap, WORD_BYTES};
    use crate::marker::Blacklist;
    use crate::stats::MarkCounters;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        heap: Heap,
        procs: MarkProcTable,
        types: TypeDescrTable,
        blacklist: Blacklist,
        counters: MarkCounters,
        registry: FinalizeRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                heap: Heap::new(1024 * 1024, 4096),
                procs: MarkProcTable::new(),
                types: TypeDescrTable::new(),
                blacklist: Blacklist::new(),
                counters: MarkCounters::default(),
                registry: FinalizeRegistry::new(),
            }
        }

        fn ctx(&self) -> MarkContext<'_> {
            MarkContext {
                heap: &self.heap,
                procs: &self.procs,
                types: &self.types,
                blacklist: &self.blacklist,
                counters: &self.counters,
            }
        }

        fn alloc(&self, words: usize) -> usize {
            self.heap
                .allocate(
                    words * WORD_BYTES,
                    BlockKind::Normal,
                    GcDescr::Length(words * WORD_BYTES),
                )
                .unwrap()
        }

        fn mark(&self, obj: usize) {
            let block = self.heap.header_for(obj).unwrap();
            block.set_mark(block.object_index(obj).unwrap());
        }

        fn is_marked(&self, obj: usize) -> bool {
            let block = self.heap.header_for(obj).unwrap();
            block.is_marked(block.object_index(obj).unwrap())
        }

        fn noop_finalizer() -> FinalizerFn {
            Arc::new(|_| {})
        }
    }

    #[test]
    fn test_link_cleared_for_dead_target() {
        let f = Fixture::new();
        let holder = f.alloc(2);
        let target = f.alloc(2);
        f.heap.write_word(holder, target).unwrap();
        f.registry.register_link(holder, target);

        // target unmarked = unreachable
        let outcome = f.registry.finalize_pass(&f.ctx());

        assert_eq!(outcome.links_cleared, 1);
        assert_eq!(read_word_raw(holder), 0, "slot zeroed");
        assert_eq!(f.registry.link_count(), 0, "registration consumed");
    }

    #[test]
    fn test_link_kept_for_live_target() {
        let f = Fixture::new();
        let holder = f.alloc(2);
        let target = f.alloc(2);
        f.heap.write_word(holder, target).unwrap();
        f.registry.register_link(holder, target);
        f.mark(holder);
        f.mark(target);

        let outcome = f.registry.finalize_pass(&f.ctx());

        assert_eq!(outcome.links_cleared, 0);
        assert_eq!(read_word_raw(holder), target);
        assert_eq!(f.registry.link_count(), 1);
    }

    #[test]
    fn test_link_in_dead_holder_dropped_without_clearing() {
        let f = Fixture::new();
        let holder = f.alloc(2);
        let target = f.alloc(2);
        f.heap.write_word(holder, target).unwrap();
        f.registry.register_link(holder, target);
        f.mark(target); // target lives on; the holder does not

        let outcome = f.registry.finalize_pass(&f.ctx());

        assert_eq!(outcome.links_cleared, 0);
        assert_eq!(read_word_raw(holder), target, "dying slot left untouched");
        assert_eq!(f.registry.link_count(), 0, "stale registration dropped");
    }

    #[test]
    fn test_ordered_finalization_defers_referenced_object() {
        let f = Fixture::new();
        let a = f.alloc(2);
        let b = f.alloc(2);
        f.heap.write_word(a, b).unwrap(); // a -> b, both finalizable

        f.registry
            .register_finalizer(a, Fixture::noop_finalizer(), FinalizeOrdering::Normal);
        f.registry
            .register_finalizer(b, Fixture::noop_finalizer(), FinalizeOrdering::Normal);

        let outcome = f.registry.finalize_pass(&f.ctx());

        // Only a is ready; b is reachable from a and waits a cycle
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(f.registry.finalizer_count(), 1);
        assert_eq!(f.registry.ready_count(), 1);
    }

    #[test]
    fn test_no_order_ignores_references() {
        let f = Fixture::new();
        let a = f.alloc(2);
        let b = f.alloc(2);
        f.heap.write_word(a, b).unwrap();

        f.registry
            .register_finalizer(a, Fixture::noop_finalizer(), FinalizeOrdering::NoOrder);
        f.registry
            .register_finalizer(b, Fixture::noop_finalizer(), FinalizeOrdering::NoOrder);

        let outcome = f.registry.finalize_pass(&f.ctx());
        assert_eq!(outcome.enqueued, 2);
    }

    #[test]
    fn test_self_cycle_blocks_normal_but_not_ignore_self() {
        let f = Fixture::new();
        let a = f.alloc(2);
        f.heap.write_word(a, a).unwrap(); // self loop

        f.registry
            .register_finalizer(a, Fixture::noop_finalizer(), FinalizeOrdering::Normal);
        let outcome = f.registry.finalize_pass(&f.ctx());
        assert_eq!(outcome.enqueued, 0, "self reference defers forever");

        let f = Fixture::new();
        let a = f.alloc(2);
        f.heap.write_word(a, a).unwrap();
        f.registry
            .register_finalizer(a, Fixture::noop_finalizer(), FinalizeOrdering::IgnoreSelf);
        let outcome = f.registry.finalize_pass(&f.ctx());
        assert_eq!(outcome.enqueued, 1, "self pointers ignored");
    }

    #[test]
    fn test_unreachable_revived_when_reached_by_other_finalizer() {
        let f = Fixture::new();
        let a = f.alloc(2);
        let b = f.alloc(2);
        f.heap.write_word(a, b).unwrap();

        f.registry
            .register_finalizer(a, Fixture::noop_finalizer(), FinalizeOrdering::Normal);
        f.registry
            .register_finalizer(b, Fixture::noop_finalizer(), FinalizeOrdering::Unreachable);

        let outcome = f.registry.finalize_pass(&f.ctx());

        assert_eq!(outcome.enqueued, 1, "only a enqueued");
        assert_eq!(outcome.revived, 1, "b revived, not deferred silently");
        assert!(f.is_marked(b), "revived object survives the sweep");
        assert_eq!(f.registry.finalizer_count(), 1, "b stays registered");
    }

    #[test]
    fn test_ready_object_and_referents_resurrected() {
        let f = Fixture::new();
        let a = f.alloc(2);
        let kept = f.alloc(2);
        f.heap.write_word(a, kept).unwrap();
        f.registry
            .register_finalizer(a, Fixture::noop_finalizer(), FinalizeOrdering::NoOrder);

        f.registry.finalize_pass(&f.ctx());

        assert!(f.is_marked(a), "ready object marked");
        assert!(f.is_marked(kept), "finalizer can still reach kept");
    }

    #[test]
    fn test_invoke_finalizers_runs_callbacks() {
        let f = Fixture::new();
        let a = f.alloc(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let callback: FinalizerFn = {
            let hits = Arc::clone(&hits);
            let seen = Arc::clone(&seen);
            Arc::new(move |obj| {
                hits.fetch_add(1, Ordering::SeqCst);
                seen.store(obj, Ordering::SeqCst);
            })
        };
        f.registry
            .register_finalizer(a, callback, FinalizeOrdering::NoOrder);

        f.registry.finalize_pass(&f.ctx());
        assert_eq!(hits.load(Ordering::SeqCst), 0, "pass never invokes");

        assert_eq!(f.registry.invoke_finalizers(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), a);
        assert_eq!(f.registry.invoke_finalizers(), 0, "queue drained");
    }

    #[test]
    fn test_notifier_called_on_new_ready() {
        let f = Fixture::new();
        let a = f.alloc(2);
        let notified = Arc::new(AtomicUsize::new(0));
        let notifier: FinalizerNotifier = {
            let notified = Arc::clone(&notified);
            Arc::new(move || {
                notified.fetch_add(1, Ordering::SeqCst);
            })
        };
        f.registry.set_notifier(Some(notifier));
        f.registry
            .register_finalizer(a, Fixture::noop_finalizer(), FinalizeOrdering::NoOrder);

        f.registry.finalize_pass(&f.ctx());
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // No new ready finalizers, no notification
        f.registry.finalize_pass(&f.ctx());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overflowed_ordering_trace_defers_everything() {
        let f = Fixture::new();
        let hub = f.alloc(40);
        for i in 0..40 {
            let child = f.alloc(2);
            f.heap.write_word(hub + i * WORD_BYTES, child).unwrap();
        }
        let lone = f.alloc(2);
        f.registry
            .register_finalizer(hub, Fixture::noop_finalizer(), FinalizeOrdering::Normal);
        f.registry
            .register_finalizer(lone, Fixture::noop_finalizer(), FinalizeOrdering::Normal);

        // The hub's fanout overflows a minimum-size trace stack, so the
        // pass cannot tell whether lone is reachable from hub
        let outcome = f.registry.finalize_pass_with(&f.ctx(), 16);

        assert_eq!(outcome.enqueued, 0, "incomplete trace enqueues nothing");
        assert_eq!(f.registry.finalizer_count(), 2, "both retried next cycle");
        assert!(f.is_marked(hub), "deferred entries survive the sweep");
        assert!(f.is_marked(lone), "deferred entries survive the sweep");
    }

    #[test]
    fn test_unregister() {
        let f = Fixture::new();
        let a = f.alloc(2);
        f.registry
            .register_finalizer(a, Fixture::noop_finalizer(), FinalizeOrdering::NoOrder);
        assert!(f.registry.unregister_finalizer(a));
        assert!(!f.registry.unregister_finalizer(a));

        f.registry.register_link(a, a);
        assert!(f.registry.unregister_link(a));
        assert!(!f.registry.unregister_link(a));
    }
}
