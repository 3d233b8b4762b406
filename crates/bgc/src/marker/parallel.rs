//! Parallel Marking - Shared Worklist with Work Stealing
//!
//! The sequential marker pushes the roots, then hands its worklist to a
//! pool of scoped workers. Workers steal small batches from a shared
//! stack into a private local stack, trace from the local stack, and
//! spill half of it back when it grows past its cap so idle workers can
//! pick the work up. Large ranges are kept visible on the shared stack
//! rather than consumed whole.
//!
//! Termination is distributed: a worker that finds the shared stack empty
//! re-checks under the lock that no other worker is still active (an
//! active worker may spill entries back at any moment). Only when both
//! hold does the pool wind down.
//!
//! Mark bits are atomic, so two workers racing on the same object cost a
//! duplicate scan at worst, never a missed mark.

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use std::sync::atomic::Ordering;

use crate::descr::GcDescr;
use crate::error::{GcError, Result};
use crate::heap::WORD_BYTES;
use crate::marker::mark_stack::{MarkEntry, MarkStack};
use crate::marker::{push_contents, MarkContext};

/// Target steal weight per acquisition
pub const ENTRIES_TO_GET: usize = 5;

/// Cap on a worker's private stack before it spills half back
pub const LOCAL_MARK_STACK_CAP: usize = 1024;

/// Ranges wider than this are shared rather than consumed whole, and
/// count as multiple units toward the steal weight
pub const SHARE_BYTES: usize = 2048;

struct Shared {
    entries: Vec<MarkEntry>,
    /// Index of the first unconsumed entry; stealing advances this cursor
    /// instead of shifting the vector
    first_nonempty: usize,
    /// Workers currently tracing a stolen batch
    active: usize,
    overflowed: bool,
}

impl Shared {
    fn is_drained(&self) -> bool {
        self.first_nonempty >= self.entries.len()
    }
}

/// Coordinator for one parallel mark phase
pub struct ParallelMarker {
    shared: Mutex<Shared>,
    work_available: Condvar,
    capacity: usize,
}

impl ParallelMarker {
    /// Seed the shared stack with the sequential marker's pending entries.
    /// The seed is trusted work that must not be discarded, so a seed
    /// larger than the stack is rejected rather than overflowed.
    pub fn new(initial: Vec<MarkEntry>, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(LOCAL_MARK_STACK_CAP);
        if initial.len() > capacity {
            return Err(GcError::MarkStackOverflow { capacity });
        }
        Ok(Self {
            shared: Mutex::new(Shared {
                entries: initial,
                first_nonempty: 0,
                active: 0,
                overflowed: false,
            }),
            work_available: Condvar::new(),
            capacity,
        })
    }

    /// Trace to completion with `workers` threads.
    /// Returns true if the shared stack overflowed; the caller then
    /// rebuilds the worklist from mark bits exactly as after a
    /// sequential overflow.
    pub fn run(&self, ctx: &MarkContext<'_>, workers: usize) -> bool {
        let workers = workers.max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker(ctx));
            }
        });
        self.shared.lock().overflowed
    }

    fn worker(&self, ctx: &MarkContext<'_>) {
        let mut local = MarkStack::new(LOCAL_MARK_STACK_CAP);
        let backoff = Backoff::new();

        loop {
            {
                let mut shared = self.shared.lock();
                if shared.is_drained() {
                    if shared.active == 0 {
                        // Nothing pending and nobody can produce more
                        self.work_available.notify_all();
                        return;
                    }
                    if backoff.is_completed() {
                        self.work_available.wait(&mut shared);
                    } else {
                        drop(shared);
                        backoff.snooze();
                    }
                    continue;
                }

                let mut weight = 0;
                while weight < ENTRIES_TO_GET && !shared.is_drained() {
                    let entry = shared.entries[shared.first_nonempty].clone();
                    shared.first_nonempty += 1;
                    weight += 1 + entry.scan_bytes() / SHARE_BYTES;
                    local.push(entry);
                }
                if shared.is_drained() {
                    shared.entries.clear();
                    shared.first_nonempty = 0;
                }
                shared.active += 1;
            }
            backoff.reset();

            self.drain_local(ctx, &mut local);

            let mut shared = self.shared.lock();
            shared.active -= 1;
            if shared.active == 0 && shared.is_drained() {
                self.work_available.notify_all();
            }
        }
    }

    fn drain_local(&self, ctx: &MarkContext<'_>, local: &mut MarkStack) {
        while let Some(entry) = local.pop() {
            if self.try_share_large(ctx, &entry, local) {
                continue;
            }
            push_contents(ctx, local, &entry);
            if local.len() > LOCAL_MARK_STACK_CAP / 2 {
                self.return_half(local);
            }
        }
        if local.take_overflowed() {
            self.shared.lock().overflowed = true;
        }
    }

    /// If this is a wide range and the shared stack sits empty, split it
    /// and publish the tail so idle workers have something to steal.
    /// Returns true if the entry was requeued locally in split form.
    fn try_share_large(
        &self,
        ctx: &MarkContext<'_>,
        entry: &MarkEntry,
        local: &mut MarkStack,
    ) -> bool {
        let bytes = match entry.descr {
            GcDescr::Length(bytes) if bytes > SHARE_BYTES => bytes,
            _ => return false,
        };
        let half = ((bytes / WORD_BYTES) / 2) * WORD_BYTES;
        if half == 0 {
            return false;
        }

        let mut shared = self.shared.lock();
        if !shared.is_drained() {
            return false;
        }
        if shared.entries.len() >= self.capacity {
            shared.overflowed = true;
            return false;
        }
        shared.entries.push(MarkEntry {
            start: entry.start + half,
            descr: GcDescr::Length(bytes - half),
        });
        ctx.counters.range_splits.fetch_add(1, Ordering::Relaxed);
        ctx.counters.entries_pushed.fetch_add(1, Ordering::Relaxed);
        self.work_available.notify_all();
        drop(shared);

        local.push(MarkEntry {
            start: entry.start,
            descr: GcDescr::Length(half),
        });
        true
    }

    /// Spill half of an overgrown local stack back to the shared one
    fn return_half(&self, local: &mut MarkStack) {
        let spill = local.len() / 2;
        let mut shared = self.shared.lock();
        for _ in 0..spill {
            let entry = match local.pop() {
                Some(entry) => entry,
                None => break,
            };
            if shared.entries.len() >= self.capacity {
                shared.overflowed = true;
                break;
            }
            shared.entries.push(entry);
        }
        self.work_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descr::{MarkProcTable, TypeDescrTable};
    use crate::heap::{BlockKind, Heap};
    use crate::marker::Blacklist;
    use crate::stats::MarkCounters;

    struct Fixture {
        heap: Heap,
        procs: MarkProcTable,
        types: TypeDescrTable,
        blacklist: Blacklist,
        counters: MarkCounters,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                heap: Heap::new(8 * 1024 * 1024, 4096),
                procs: MarkProcTable::new(),
                types: TypeDescrTable::new(),
                blacklist: Blacklist::new(),
                counters: MarkCounters::default(),
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

        fn is_marked(&self, addr: usize) -> bool {
            let block = self.heap.header_for(addr).unwrap();
            block.is_marked(block.object_index(addr).unwrap())
        }
    }

    #[test]
    fn test_parallel_marks_linked_list() {
        let f = Fixture::new();
        let mut nodes = Vec::new();
        let mut prev = 0usize;
        for _ in 0..500 {
            let node = f.alloc(2);
            if prev != 0 {
                f.heap.write_word(prev, node).unwrap();
            }
            nodes.push(node);
            prev = node;
        }

        let ctx = f.ctx();
        let mut seed = MarkStack::new(64);
        crate::marker::mark_and_push(&ctx, &mut seed, nodes[0]);

        let pm = ParallelMarker::new(seed.drain_all(), 4096).unwrap();
        let overflowed = pm.run(&ctx, 4);

        assert!(!overflowed);
        for node in nodes {
            assert!(f.is_marked(node));
        }
    }

    #[test]
    fn test_parallel_marks_wide_fanout() {
        let f = Fixture::new();
        let hub_words = 512;
        let hub = f
            .heap
            .allocate(
                hub_words * WORD_BYTES,
                BlockKind::Normal,
                GcDescr::Length(hub_words * WORD_BYTES),
            )
            .unwrap();
        let mut leaves = Vec::new();
        for i in 0..hub_words {
            let leaf = f.alloc(2);
            f.heap.write_word(hub + i * WORD_BYTES, leaf).unwrap();
            leaves.push(leaf);
        }

        let ctx = f.ctx();
        let mut seed = MarkStack::new(64);
        crate::marker::mark_and_push(&ctx, &mut seed, hub);

        let pm = ParallelMarker::new(seed.drain_all(), 8192).unwrap();
        let overflowed = pm.run(&ctx, 3);

        assert!(!overflowed);
        for leaf in leaves {
            assert!(f.is_marked(leaf));
        }
    }

    #[test]
    fn test_single_worker_equivalent() {
        let f = Fixture::new();
        let a = f.alloc(2);
        let b = f.alloc(2);
        f.heap.write_word(a, b).unwrap();

        let ctx = f.ctx();
        let mut seed = MarkStack::new(64);
        crate::marker::mark_and_push(&ctx, &mut seed, a);

        let pm = ParallelMarker::new(seed.drain_all(), 4096).unwrap();
        assert!(!pm.run(&ctx, 1));
        assert!(f.is_marked(a) && f.is_marked(b));
    }

    #[test]
    fn test_empty_seed_terminates() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let pm = ParallelMarker::new(Vec::new(), 4096).unwrap();
        assert!(!pm.run(&ctx, 4));
    }

    #[test]
    fn test_oversized_seed_rejected() {
        let seed: Vec<MarkEntry> = (0..LOCAL_MARK_STACK_CAP + 1)
            .map(|i| MarkEntry {
                start: i * WORD_BYTES,
                descr: GcDescr::Length(WORD_BYTES),
            })
            .collect();

        // The requested capacity is clamped up to the local-stack cap,
        // so only a seed beyond that is refused
        match ParallelMarker::new(seed, 16) {
            Err(GcError::MarkStackOverflow { capacity }) => {
                assert_eq!(capacity, LOCAL_MARK_STACK_CAP);
            }
            other => panic!("expected overflow error, got {:?}", other.map(|_| ())),
        }
    }
}
