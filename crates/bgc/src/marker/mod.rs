//! Marker Module - Tracing Engine and Mark State Machine
//!
//! Marking is an explicit worklist algorithm: roots are pushed as entries,
//! then entries are popped and their pointer words fed back through the
//! candidate filter until the stack drains. The filter has two tiers: a
//! cheap plausible-range comparison, then a block-header lookup. Words
//! that pass the first tier but fail the second are recorded on the
//! blacklist as probable non-pointers.
//!
//! The cycle advances through a small state machine:
//!
//! ```text
//! Idle -> PushRescuers -> PushUncollectable -> RootsPushed -> Idle
//!                \                 \              |
//!                 +-- PartiallyInvalid            +-- Invalid
//! ```
//!
//! `PushRescuers` re-pushes marked objects of blocks dirtied since the
//! cycle started (incremental mode). `PushUncollectable` pushes the
//! uncollectable blocks and the registered roots. `RootsPushed` drains
//! the stack in bounded slices; in incremental mode a drained stack
//! rescans any blocks dirtied mid-cycle before the phase completes, so a
//! pointer stored into an already-scanned object is still found. A stack
//! overflow in any phase moves to an
//! invalid state; recovery grows the stack and rebuilds the worklist from
//! mark bits, so overflow degrades a cycle but never loses an object.

pub mod blacklist;
pub mod mark_stack;
pub mod parallel;

pub use blacklist::Blacklist;
pub use mark_stack::{MarkEntry, MarkStack, MARK_STACK_DISCARDS};
pub use parallel::ParallelMarker;

use std::sync::atomic::Ordering;

use crate::descr::{GcDescr, MarkProcTable, TypeDescrTable};
use crate::heap::{read_word_raw, BlockKind, Heap, WORD_BYTES};
use crate::logging::{log_event, GcEvent};
use crate::stats::MarkCounters;

/// Ranges wider than this many words are scanned in chunks, with the
/// remainder re-pushed, so one huge object cannot monopolize a slice or
/// hide work from parallel stealing.
pub const SPLIT_RANGE_WORDS: usize = 128;

/// Bytes of scanning credit consumed per `mark_some` slice
pub const MARK_CREDIT_BYTES: usize = 4096;

/// Bound on `PerObject` indirection chains before giving up
const MAX_TYPE_HOPS: usize = 8;

/// Phase of the current collection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkState {
    /// No cycle in progress, or the cycle's marking is complete
    Idle,
    /// Re-pushing marked objects of dirtied blocks
    PushRescuers,
    /// Pushing uncollectable blocks and registered roots
    PushUncollectable,
    /// Roots pushed; draining the stack
    RootsPushed,
    /// Stack overflowed before all roots were pushed
    PartiallyInvalid,
    /// Stack overflowed while draining
    Invalid,
}

/// Everything the tracing functions need, borrowed from the collector
pub struct MarkContext<'a> {
    pub heap: &'a Heap,
    pub procs: &'a MarkProcTable,
    pub types: &'a TypeDescrTable,
    pub blacklist: &'a Blacklist,
    pub counters: &'a MarkCounters,
}

/// Root sources for one cycle
#[derive(Default, Clone, Copy)]
pub struct MarkSources<'a> {
    /// (start address, byte length) ranges scanned conservatively
    pub root_ranges: &'a [(usize, usize)],
    /// Individual heap objects treated as roots
    pub root_objects: &'a [usize],
}

/// Interface handed to registered mark procedures
pub struct ScanSink<'a> {
    ctx: &'a MarkContext<'a>,
    stack: &'a mut MarkStack,
    ignore: Option<(usize, usize)>,
}

impl ScanSink<'_> {
    /// Feed one candidate word through the pointer filter
    pub fn push_candidate(&mut self, word: usize) {
        if let Some((lo, hi)) = self.ignore {
            if word >= lo && word < hi {
                return;
            }
        }
        mark_and_push(self.ctx, self.stack, word);
    }

    /// Read a word of a heap object, None if the address is not in the heap
    pub fn read_word(&self, addr: usize) -> Option<usize> {
        self.ctx.heap.header_for(addr)?;
        Some(read_word_raw(addr))
    }
}

/// Filter a candidate word and mark the object it points at.
///
/// Returns the object base address when the candidate is a live heap
/// pointer (whether or not it was already marked), None otherwise. A
/// newly marked object of a scanned kind with a non-trivial descriptor
/// is pushed for later scanning.
pub(crate) fn mark_and_push(
    ctx: &MarkContext<'_>,
    stack: &mut MarkStack,
    candidate: usize,
) -> Option<usize> {
    let (lo, hi) = ctx.heap.plausible_range();
    if candidate < lo || candidate >= hi {
        return None;
    }

    let block = match ctx.heap.header_for(candidate) {
        Some(block) => block,
        None => {
            // Passed the cheap filter but owns no block: probable integer
            ctx.blacklist.record(candidate);
            ctx.counters.blacklist_hits.fetch_add(1, Ordering::Relaxed);
            return None;
        }
    };

    let index = block.object_index(candidate)?;
    if block.is_free(index) {
        return None;
    }

    let base = block.base_of_index(index);
    if block.set_mark(index) {
        // Already marked; idempotent, nothing to push
        return Some(base);
    }
    ctx.counters.objects_marked.fetch_add(1, Ordering::Relaxed);

    if block.kind().is_scanned() {
        let descr = block.descr(index);
        if !descr.is_pointer_free() {
            stack.push(MarkEntry { start: base, descr });
            ctx.counters.entries_pushed.fetch_add(1, Ordering::Relaxed);
        }
    }
    Some(base)
}

/// Scan one entry, pushing whatever live pointers it contains.
/// Returns the bytes scanned, for slice credit accounting.
pub(crate) fn push_contents(
    ctx: &MarkContext<'_>,
    stack: &mut MarkStack,
    entry: &MarkEntry,
) -> usize {
    push_contents_ex(ctx, stack, entry, None)
}

/// As [`push_contents`], skipping candidates inside `ignore` (used for
/// self-pointer-ignoring finalization ordering).
pub(crate) fn push_contents_ex(
    ctx: &MarkContext<'_>,
    stack: &mut MarkStack,
    entry: &MarkEntry,
    ignore: Option<(usize, usize)>,
) -> usize {
    let consider = |stack: &mut MarkStack, word: usize| {
        if let Some((lo, hi)) = ignore {
            if word >= lo && word < hi {
                return;
            }
        }
        mark_and_push(ctx, stack, word);
    };

    let descr = match resolve_descr(ctx, entry.start, entry.descr.clone()) {
        Some(descr) => descr,
        None => return 0,
    };

    let scanned = match descr {
        GcDescr::Length(bytes) => {
            let words = bytes / WORD_BYTES;
            let scan_words = if words > SPLIT_RANGE_WORDS {
                // Re-push the tail so it stays visible as separate work
                let done = SPLIT_RANGE_WORDS * WORD_BYTES;
                stack.push(MarkEntry {
                    start: entry.start + done,
                    descr: GcDescr::Length(bytes - done),
                });
                ctx.counters.entries_pushed.fetch_add(1, Ordering::Relaxed);
                ctx.counters.range_splits.fetch_add(1, Ordering::Relaxed);
                SPLIT_RANGE_WORDS
            } else {
                words
            };
            for i in 0..scan_words {
                consider(stack, read_word_raw(entry.start + i * WORD_BYTES));
            }
            scan_words * WORD_BYTES
        }
        GcDescr::Bitmap(bitmap) => {
            let mut width = 0;
            for off in bitmap.offsets() {
                consider(stack, read_word_raw(entry.start + off * WORD_BYTES));
                width = off + 1;
            }
            width * WORD_BYTES
        }
        GcDescr::Proc { index, env } => {
            if let Some(proc_fn) = ctx.procs.get(index) {
                let mut sink = ScanSink { ctx, stack, ignore };
                proc_fn(&mut sink, entry.start, env);
            }
            WORD_BYTES
        }
        // resolve_descr never returns PerObject
        GcDescr::PerObject { .. } => 0,
    };

    ctx.counters
        .bytes_scanned
        .fetch_add(scanned as u64, Ordering::Relaxed);
    scanned
}

/// Chase `PerObject` indirections down to a concrete descriptor.
///
/// The object's first word is the type key (or, indirect, a pointer to a
/// record whose first word is the key). A zero word is the free-list
/// sentinel; zero, an unknown key, or a chain longer than
/// [`MAX_TYPE_HOPS`] all resolve to "no pointers".
pub(crate) fn resolve_descr(
    ctx: &MarkContext<'_>,
    start: usize,
    descr: GcDescr,
) -> Option<GcDescr> {
    let mut current = descr;
    for _ in 0..MAX_TYPE_HOPS {
        match current {
            GcDescr::PerObject { indirect } => {
                let first = read_word_raw(start);
                if first == 0 {
                    return None;
                }
                let key = if indirect {
                    ctx.heap.header_for(first)?;
                    read_word_raw(first)
                } else {
                    first
                };
                if key == 0 {
                    return None;
                }
                current = ctx.types.lookup(key)?;
            }
            other => return Some(other),
        }
    }
    None
}

/// Marker - owns the mark stack and drives the cycle state machine
pub struct Marker {
    state: MarkState,
    stack: MarkStack,
    incremental: bool,
    degraded: bool,
}

impl Marker {
    pub fn new(stack_capacity: usize, incremental: bool) -> Self {
        Self {
            state: MarkState::Idle,
            stack: MarkStack::new(stack_capacity),
            incremental,
            degraded: false,
        }
    }

    pub fn state(&self) -> MarkState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == MarkState::Idle
    }

    /// Whether any overflow degraded the current cycle; cleared here
    pub fn take_degraded(&mut self) -> bool {
        std::mem::take(&mut self.degraded)
    }

    /// Begin a cycle. Mark bits must already be clear.
    pub fn prepare_cycle(&mut self) {
        self.stack.clear();
        self.state = MarkState::PushRescuers;
    }

    /// Perform one bounded slice of marking work.
    /// Returns true when marking for the cycle is complete.
    pub fn mark_some(&mut self, ctx: &MarkContext<'_>, sources: &MarkSources<'_>) -> bool {
        match self.state {
            MarkState::Idle => true,

            MarkState::PushRescuers => {
                if self.incremental {
                    self.push_rescuers(ctx);
                }
                if !self.check_push_overflow(ctx) {
                    self.state = MarkState::PushUncollectable;
                }
                false
            }

            MarkState::PushUncollectable => {
                self.push_uncollectable(ctx);
                self.push_roots(ctx, sources);
                if !self.check_push_overflow(ctx) {
                    self.state = MarkState::RootsPushed;
                }
                false
            }

            MarkState::RootsPushed => {
                let mut credit = MARK_CREDIT_BYTES as i64;
                while credit > 0 {
                    if self.stack.overflowed() {
                        self.enter_invalid(ctx, MarkState::Invalid);
                        return false;
                    }
                    let entry = match self.stack.pop() {
                        Some(entry) => entry,
                        None => {
                            // Writes since the stack last drained may have
                            // stored pointers into already-scanned objects;
                            // their blocks are dirty and must be rescanned
                            // before the cycle can end
                            if self.incremental {
                                self.push_rescuers(ctx);
                                if self.stack.overflowed() {
                                    self.enter_invalid(ctx, MarkState::Invalid);
                                    return false;
                                }
                                if !self.stack.is_empty() {
                                    continue;
                                }
                            }
                            self.state = MarkState::Idle;
                            return true;
                        }
                    };
                    let scanned = push_contents(ctx, &mut self.stack, &entry);
                    credit -= scanned.max(WORD_BYTES) as i64;
                }
                if self.stack.overflowed() {
                    self.enter_invalid(ctx, MarkState::Invalid);
                }
                false
            }

            MarkState::Invalid | MarkState::PartiallyInvalid => {
                self.recover(ctx, sources);
                false
            }
        }
    }

    /// Run marking to completion. Returns true if the cycle degraded.
    pub fn run_to_completion(&mut self, ctx: &MarkContext<'_>, sources: &MarkSources<'_>) -> bool {
        while !self.mark_some(ctx, sources) {}
        self.take_degraded()
    }

    /// Hand the pending worklist to a parallel run
    pub fn take_entries(&mut self) -> Vec<MarkEntry> {
        self.stack.drain_all()
    }

    /// Fold a parallel run's outcome back into the state machine
    pub fn note_parallel_result(&mut self, ctx: &MarkContext<'_>, overflowed: bool) {
        debug_assert_eq!(self.state, MarkState::RootsPushed);
        if overflowed {
            ctx.counters.stack_overflows.fetch_add(1, Ordering::Relaxed);
            self.degraded = true;
            self.state = MarkState::Invalid;
        } else if self.incremental {
            // Blocks dirtied during the cycle still need a rescan; the
            // next drained slice performs it before going idle
            self.state = MarkState::RootsPushed;
        } else {
            self.state = MarkState::Idle;
        }
    }

    fn push_rescuers(&mut self, ctx: &MarkContext<'_>) {
        for block in ctx.heap.take_dirty_blocks() {
            if !block.kind().is_scanned() {
                continue;
            }
            for idx in block.marked_indices() {
                let descr = block.descr(idx);
                if descr.is_pointer_free() {
                    continue;
                }
                self.stack.push(MarkEntry {
                    start: block.base_of_index(idx),
                    descr,
                });
                ctx.counters.entries_pushed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn push_uncollectable(&mut self, ctx: &MarkContext<'_>) {
        for block in ctx.heap.blocks_snapshot() {
            if block.kind() != BlockKind::Uncollectable {
                continue;
            }
            for idx in block.allocated_indices() {
                mark_and_push(ctx, &mut self.stack, block.base_of_index(idx));
            }
        }
    }

    fn push_roots(&mut self, ctx: &MarkContext<'_>, sources: &MarkSources<'_>) {
        for &(start, bytes) in sources.root_ranges {
            self.stack.push(MarkEntry {
                start,
                descr: GcDescr::Length(bytes),
            });
            ctx.counters.entries_pushed.fetch_add(1, Ordering::Relaxed);
        }
        for &obj in sources.root_objects {
            mark_and_push(ctx, &mut self.stack, obj);
        }
    }

    /// Overflow during a push phase degrades to PartiallyInvalid.
    /// Returns true if an overflow was handled.
    fn check_push_overflow(&mut self, ctx: &MarkContext<'_>) -> bool {
        if self.stack.overflowed() {
            self.enter_invalid(ctx, MarkState::PartiallyInvalid);
            true
        } else {
            false
        }
    }

    fn enter_invalid(&mut self, ctx: &MarkContext<'_>, state: MarkState) {
        self.stack.take_overflowed();
        self.degraded = true;
        ctx.counters.stack_overflows.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "mark stack overflow at capacity {}, rebuilding worklist",
            self.stack.capacity()
        );
        log_event(GcEvent::StackOverflow {
            discarded: MARK_STACK_DISCARDS,
            new_capacity: self.stack.capacity() * 2,
        });
        self.state = state;
    }

    /// Rebuild the worklist after an overflow: grow the stack, re-push the
    /// roots, and re-push the contents of every marked object. Mark bits
    /// are never discarded, so nothing reachable is lost.
    fn recover(&mut self, ctx: &MarkContext<'_>, sources: &MarkSources<'_>) {
        self.stack.grow();
        self.stack.clear();

        self.push_roots(ctx, sources);
        for block in ctx.heap.blocks_snapshot() {
            if !block.kind().is_scanned() {
                continue;
            }
            for idx in block.marked_indices() {
                let descr = block.descr(idx);
                if descr.is_pointer_free() {
                    continue;
                }
                self.stack.push(MarkEntry {
                    start: block.base_of_index(idx),
                    descr,
                });
                ctx.counters.entries_pushed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.stack.overflowed() {
            // Still too small; grow again on the next slice
            self.enter_invalid(ctx, MarkState::Invalid);
        } else {
            self.state = MarkState::RootsPushed;
        }
    }
}
