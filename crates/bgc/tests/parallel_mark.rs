//! Parallel marking must reach exactly what sequential marking reaches

mod common;

use bgc::descr::{GcDescr, MarkProcTable, TypeDescrTable};
use bgc::heap::{BlockKind, Heap, WORD_BYTES};
use bgc::marker::{Blacklist, MarkContext, MarkEntry, ParallelMarker};
use bgc::stats::MarkCounters;
use bgc::{Collector, GcConfig};

use common::*;

#[test]
fn test_worker_counts_agree_on_random_graph() {
    // The same seed wires the same graph in every collector, so the
    // per-index outcomes are directly comparable
    for workers in [0usize, 1, 2, 4] {
        let gc = Collector::new(GcConfig {
            find_leaks: true,
            parallel_marking: workers > 0,
            marker_threads: (workers > 0).then_some(workers),
            ..Default::default()
        })
        .unwrap();
        let dag = build_dag(&gc, 300, 42);
        dag.pin_roots(&gc);

        let summary = gc.collect("equivalence").unwrap();
        assert!(!summary.degraded, "{workers} workers");

        let expected = dag.reachable();
        for (i, &node) in dag.nodes.iter().enumerate() {
            assert_eq!(
                is_marked(&gc, node),
                expected[i],
                "{workers} workers disagree on node {i}"
            );
        }
    }
}

#[test]
fn test_parallel_collection_of_deep_chain() {
    let gc = Collector::new(GcConfig {
        parallel_marking: true,
        marker_threads: Some(4),
        ..Default::default()
    })
    .unwrap();

    let head = alloc(&gc, 2);
    gc.add_root_object(head).unwrap();
    let mut nodes = vec![head];
    for _ in 0..500 {
        let node = alloc(&gc, 2);
        let prev = *nodes.last().unwrap();
        set_ptr(&gc, prev, 0, node);
        nodes.push(node);
    }
    let loner = alloc(&gc, 2);

    gc.collect("chain").unwrap();
    for &node in &nodes {
        assert!(!is_free(&gc, node));
    }
    assert!(is_free(&gc, loner));
}

#[test]
fn test_parallel_collection_of_empty_heap_terminates() {
    let gc = Collector::new(GcConfig {
        parallel_marking: true,
        marker_threads: Some(4),
        ..Default::default()
    })
    .unwrap();
    let summary = gc.collect("empty").unwrap();
    assert_eq!(summary.cycle, 1);
    assert_eq!(summary.mark.objects_marked, 0);
}

// === Engine-level equivalence on one shared heap ===

struct EngineFixture {
    heap: Heap,
    procs: MarkProcTable,
    types: TypeDescrTable,
    blacklist: Blacklist,
    counters: MarkCounters,
}

impl EngineFixture {
    fn new() -> Self {
        Self {
            heap: Heap::new(16 * 1024 * 1024, 4096),
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

    fn marked_bases(&self) -> Vec<usize> {
        let mut bases = Vec::new();
        for block in self.heap.blocks_snapshot() {
            for idx in block.marked_indices() {
                bases.push(block.base_of_index(idx));
            }
        }
        bases.sort_unstable();
        bases
    }

    /// Mark the root and run one parallel drain seeded with its entry
    fn run_with_workers(&self, root: usize, workers: usize) -> Vec<usize> {
        self.heap.clear_all_marks();
        let block = self.heap.header_for(root).unwrap();
        block.set_mark(block.object_index(root).unwrap());

        let seed = vec![MarkEntry {
            start: root,
            descr: block.descr(block.object_index(root).unwrap()),
        }];
        let overflowed = ParallelMarker::new(seed, 4096)
            .unwrap()
            .run(&self.ctx(), workers);
        assert!(!overflowed);
        self.marked_bases()
    }
}

#[test]
fn test_engine_runs_mark_the_same_set() {
    let f = EngineFixture::new();

    // A hub with wide fanout plus a deep tail hanging off one spoke
    let root = f.alloc(64);
    for i in 0..63 {
        let spoke = f.alloc(2);
        f.heap.write_word(root + i * WORD_BYTES, spoke).unwrap();
    }
    let mut tail = f.alloc(2);
    f.heap.write_word(root + 63 * WORD_BYTES, tail).unwrap();
    for _ in 0..300 {
        let next = f.alloc(2);
        f.heap.write_word(tail, next).unwrap();
        tail = next;
    }
    let _unreachable = f.alloc(2);

    let baseline = f.run_with_workers(root, 1);
    assert!(baseline.len() > 300);
    for workers in [2, 4] {
        assert_eq!(
            f.run_with_workers(root, workers),
            baseline,
            "{workers} workers"
        );
    }
}
