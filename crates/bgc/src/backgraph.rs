//! Back Graph - Reverse Reachability Diagnostics
//!
//! An inverted view of the heap's pointer graph: for each object, which
//! objects point at it. The graph answers "why is this still alive" style
//! questions and yields the backwards height metric, the length of the
//! longest chain of predecessors behind an object. A steadily growing
//! height across cycles is the classic signature of an unbounded data
//! structure that keeps its history reachable.
//!
//! An object gains at most [`MAX_IN`] recorded predecessors; past that it
//! is saturated and treated like a root, since enumerating every pointer
//! to a hub object costs more than the diagnostic is worth.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::descr::GcDescr;
use crate::heap::{read_word_raw, WORD_BYTES};
use crate::logging::{log_event, GcEvent};
use crate::marker::{resolve_descr, MarkContext};

/// Predecessors recorded per object before saturation
pub const MAX_IN: usize = 10;

/// Recorded predecessors of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackEdges {
    One(usize),
    Many(Vec<usize>),
    /// Too many predecessors; the object counts as a height-0 base
    Saturated,
}

enum Height {
    InProgress,
    Known(usize),
}

/// Reverse pointer graph over object base addresses
#[derive(Default)]
pub struct BackGraph {
    edges: Mutex<HashMap<usize, BackEdges>>,
}

impl BackGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.edges.lock().clear();
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().len()
    }

    /// Record that `source` points at `target`
    pub fn add_edge(&self, target: usize, source: usize) {
        let mut edges = self.edges.lock();
        match edges.get_mut(&target) {
            None => {
                edges.insert(target, BackEdges::One(source));
            }
            Some(BackEdges::One(existing)) => {
                if *existing != source {
                    let pair = vec![*existing, source];
                    edges.insert(target, BackEdges::Many(pair));
                }
            }
            Some(BackEdges::Many(sources)) => {
                if !sources.contains(&source) {
                    if sources.len() >= MAX_IN {
                        edges.insert(target, BackEdges::Saturated);
                    } else {
                        sources.push(source);
                    }
                }
            }
            Some(BackEdges::Saturated) => {}
        }
    }

    /// Predecessors recorded for an object; None if saturated
    pub fn in_degree(&self, obj: usize) -> Option<usize> {
        match self.edges.lock().get(&obj) {
            None => Some(0),
            Some(BackEdges::One(_)) => Some(1),
            Some(BackEdges::Many(sources)) => Some(sources.len()),
            Some(BackEdges::Saturated) => None,
        }
    }

    /// Rebuild the whole graph from the heap's current contents.
    /// Enumerates pointer words per descriptor; procedure-scanned objects
    /// contribute no edges, since their layout is opaque.
    pub fn rebuild(&self, ctx: &MarkContext<'_>) {
        let mut edges = self.edges.lock();
        edges.clear();
        drop(edges);

        for block in ctx.heap.blocks_snapshot() {
            if !block.kind().is_scanned() {
                continue;
            }
            for idx in block.allocated_indices() {
                let base = block.base_of_index(idx);
                for word in pointer_words(ctx, base, block.descr(idx)) {
                    if let Some(target_block) = ctx.heap.header_for(word) {
                        if let Some(target_idx) = target_block.object_index(word) {
                            if !target_block.is_free(target_idx) {
                                self.add_edge(target_block.base_of_index(target_idx), base);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Longest predecessor chain behind an object.
    /// Cycles and saturated objects terminate the chain.
    pub fn backwards_height(&self, obj: usize) -> usize {
        let edges = self.edges.lock();
        let mut memo = HashMap::new();
        height(&edges, obj, &mut memo)
    }

    /// (max backwards height, object carrying it) over the whole graph,
    /// reported through the logger
    pub fn report_height(&self) -> Option<(usize, usize)> {
        let edges = self.edges.lock();
        let mut memo = HashMap::new();
        let best = edges
            .keys()
            .map(|&obj| (height(&edges, obj, &mut memo), obj))
            .max_by_key(|&(h, _)| h)?;
        log_event(GcEvent::BackGraphHeight {
            height: best.0,
            deepest: best.1,
        });
        Some(best)
    }
}

fn height(
    edges: &HashMap<usize, BackEdges>,
    obj: usize,
    memo: &mut HashMap<usize, Height>,
) -> usize {
    height_walk(edges, obj, memo).0
}

/// Depth-first walk returning (height, walk touched an open cycle).
/// A height computed through an open cycle depends on where the walk
/// entered it, so it is dropped from the memo instead of cached.
fn height_walk(
    edges: &HashMap<usize, BackEdges>,
    obj: usize,
    memo: &mut HashMap<usize, Height>,
) -> (usize, bool) {
    match memo.get(&obj) {
        Some(Height::Known(h)) => return (*h, false),
        // Cycle: the in-progress node contributes nothing further
        Some(Height::InProgress) => return (0, true),
        None => {}
    }
    memo.insert(obj, Height::InProgress);

    let (h, in_cycle) = match edges.get(&obj) {
        None | Some(BackEdges::Saturated) => (0, false),
        Some(BackEdges::One(source)) => {
            let (below, tainted) = height_walk(edges, *source, memo);
            (1 + below, tainted)
        }
        Some(BackEdges::Many(sources)) => {
            let mut best = 0;
            let mut tainted = false;
            for &source in sources {
                let (below, touched) = height_walk(edges, source, memo);
                best = best.max(below);
                tainted |= touched;
            }
            (1 + best, tainted)
        }
    };
    if in_cycle {
        memo.remove(&obj);
    } else {
        memo.insert(obj, Height::Known(h));
    }
    (h, in_cycle)
}

/// Word values of an object's declared pointer slots
fn pointer_words(ctx: &MarkContext<'_>, base: usize, descr: GcDescr) -> Vec<usize> {
    let resolved = match resolve_descr(ctx, base, descr) {
        Some(descr) => descr,
        None => return Vec::new(),
    };
    match resolved {
        GcDescr::Length(bytes) => (0..bytes / WORD_BYTES)
            .map(|i| read_word_raw(base + i * WORD_BYTES))
            .collect(),
        GcDescr::Bitmap(bitmap) => bitmap
            .offsets()
            .map(|off| read_word_raw(base + off * WORD_BYTES))
            .collect(),
        GcDescr::Proc { .. } | GcDescr::PerObject { .. } => Vec::new(),
    }
}
