//! Suspected-Pointer Blacklist
//!
//! Conservative scanning sometimes finds a word that lands inside the
//! plausible heap range but maps to no live block. Such a word is probably
//! an integer masquerading as a pointer. Its value is recorded here so the
//! allocator and diagnostics can avoid or report addresses that stray data
//! already "points" at; placing a real object there would keep it alive by
//! accident for as long as the stray word exists.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::heap::WORD_BYTES;

/// Cap on recorded sources; beyond this the set stops growing.
/// A program that manufactures unbounded near-miss values would otherwise
/// turn the blacklist itself into a leak.
pub const MAX_BLACKLIST_ENTRIES: usize = 4096;

/// Set of word-aligned addresses that looked like heap pointers but were not
#[derive(Default)]
pub struct Blacklist {
    sources: Mutex<HashSet<usize>>,
    hits: AtomicU64,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a near-miss candidate. Saturates at
    /// [`MAX_BLACKLIST_ENTRIES`]; the hit counter keeps counting.
    pub fn record(&self, candidate: usize) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let addr = candidate & !(WORD_BYTES - 1);
        let mut sources = self.sources.lock();
        if sources.len() < MAX_BLACKLIST_ENTRIES {
            sources.insert(addr);
        }
    }

    /// Whether an address was recorded as a near miss
    pub fn contains(&self, addr: usize) -> bool {
        self.sources.lock().contains(&(addr & !(WORD_BYTES - 1)))
    }

    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.lock().is_empty()
    }

    /// Total near-miss candidates observed, including saturated ones
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Forget all recorded sources; hit count is preserved
    pub fn clear(&self) {
        self.sources.lock().clear();
    }
}
