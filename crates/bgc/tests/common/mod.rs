//! Shared fixtures for the integration suites

#![allow(dead_code)]

use bgc::{BlockKind, Collector, GcConfig, WORD_BYTES};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Collector with defaults
pub fn collector() -> Collector {
    Collector::new(GcConfig::default()).unwrap()
}

/// Collector in leak-finding mode: the sweep leaves objects and mark bits
/// in place, so tests can inspect the outcome of the mark phase directly
pub fn leak_collector() -> Collector {
    Collector::new(GcConfig {
        find_leaks: true,
        ..Default::default()
    })
    .unwrap()
}

/// Allocate a conservatively scanned object of `words` words
pub fn alloc(gc: &Collector, words: usize) -> usize {
    gc.allocate_conservative(words * WORD_BYTES, BlockKind::Normal)
        .unwrap()
}

/// Allocate with an explicit per-word pointer layout
pub fn alloc_layout(gc: &Collector, layout: &[bool]) -> usize {
    gc.allocate_with_layout(layout.len() * WORD_BYTES, BlockKind::Normal, layout)
        .unwrap()
}

/// Store `target` into word `slot` of `obj`
pub fn set_ptr(gc: &Collector, obj: usize, slot: usize, target: usize) {
    gc.heap()
        .write_word(obj + slot * WORD_BYTES, target)
        .unwrap();
}

pub fn is_marked(gc: &Collector, addr: usize) -> bool {
    let block = gc.heap().header_for(addr).expect("address in heap");
    block.is_marked(block.object_index(addr).unwrap())
}

pub fn is_free(gc: &Collector, addr: usize) -> bool {
    let block = gc.heap().header_for(addr).expect("address in heap");
    block.is_free(block.object_index(addr).unwrap())
}

/// Pointer slots declared per DAG node
pub const DAG_SLOTS: usize = 4;

/// A randomly wired acyclic object graph and its ground truth
pub struct Dag {
    /// Node base addresses, in allocation order
    pub nodes: Vec<usize>,
    /// Successor node indices per node
    pub edges: Vec<Vec<usize>>,
    /// Root node indices
    pub roots: Vec<usize>,
}

/// Build a random DAG of `n` nodes. Each node is an 8-word object whose
/// first four words are declared pointer slots; every edge targets a
/// lower-numbered node, so the graph is acyclic by construction. The same
/// seed always wires the same edges.
pub fn build_dag(gc: &Collector, n: usize, seed: u64) -> Dag {
    assert!(n >= 2);
    let mut rng = StdRng::seed_from_u64(seed);
    let layout = [true, true, true, true, false, false, false, false];

    let mut nodes = Vec::with_capacity(n);
    let mut edges = Vec::with_capacity(n);
    for i in 0..n {
        let node = alloc_layout(gc, &layout);
        let mut out = Vec::new();
        if i > 0 {
            for slot in 0..rng.gen_range(0..=DAG_SLOTS) {
                let succ = rng.gen_range(0..i);
                set_ptr(gc, node, slot, nodes[succ]);
                out.push(succ);
            }
        }
        nodes.push(node);
        edges.push(out);
    }

    let mut roots = vec![n - 1, n / 2];
    if n > 16 {
        roots.push(7);
    }
    Dag { nodes, edges, roots }
}

impl Dag {
    /// Per-node reachability from the roots
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut work = self.roots.clone();
        while let Some(i) = work.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            work.extend(self.edges[i].iter().copied());
        }
        seen
    }

    pub fn pin_roots(&self, gc: &Collector) {
        for &r in &self.roots {
            gc.add_root_object(self.nodes[r]).unwrap();
        }
    }
}
