//! Block Header - Per-Block Metadata and Mark Bitmap
//!
//! Every heap block groups objects of one size and one kind. The header
//! owns the object storage itself plus the side metadata the tracer needs:
//!
//! - mark bitmap, one bit per object slot (`AtomicU64` words)
//! - free bitmap, one bit per slot (set = never allocated or explicitly freed)
//! - live-object counter for the current cycle
//! - per-object descriptor side table
//!
//! Descriptors live in a side table rather than inside scanned memory, so
//! the tracer never observes collector metadata as candidate pointers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::descr::GcDescr;

/// Machine word size in bytes
pub const WORD_BYTES: usize = std::mem::size_of::<usize>();

/// Block kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Conservatively or precisely scanned, collectable
    Normal,
    /// Never scanned for pointers
    PointerFree,
    /// Treated as a root every cycle, never reclaimed
    Uncollectable,
    /// Declared immutable between explicit change windows
    Stubborn,
}

impl BlockKind {
    /// Whether object contents are scanned during tracing
    pub fn is_scanned(self) -> bool {
        !matches!(self, BlockKind::PointerFree)
    }
}

/// Per-block header: storage plus mark/free bitmaps and descriptors
pub struct BlockHeader {
    start: usize,
    object_size: usize,
    capacity: usize,
    kind: BlockKind,
    /// Object storage. Words are atomics so tracing may read them while
    /// mutator threads store concurrently; a stale value is handled by the
    /// plausibility filter, never trusted blindly.
    #[allow(dead_code)]
    storage: Box<[AtomicUsize]>,
    mark_bits: Vec<AtomicU64>,
    free_bits: Vec<AtomicU64>,
    next_slot: AtomicUsize,
    live_objects: AtomicUsize,
    descrs: RwLock<Vec<GcDescr>>,
    dirty: AtomicBool,
}

impl BlockHeader {
    /// Allocate a block of `capacity` slots of `object_size` bytes each.
    ///
    /// `object_size` must be a nonzero multiple of the word size.
    pub fn new(object_size: usize, capacity: usize, kind: BlockKind) -> Arc<Self> {
        debug_assert!(object_size > 0 && object_size % WORD_BYTES == 0);
        debug_assert!(capacity > 0);

        let words = (object_size / WORD_BYTES) * capacity;
        let storage: Box<[AtomicUsize]> = (0..words).map(|_| AtomicUsize::new(0)).collect();
        let start = storage.as_ptr() as usize;

        let bitmap_words = capacity.div_ceil(64);
        let mark_bits = (0..bitmap_words).map(|_| AtomicU64::new(0)).collect();
        // All slots start free
        let free_bits = (0..bitmap_words).map(|_| AtomicU64::new(u64::MAX)).collect();

        Arc::new(Self {
            start,
            object_size,
            capacity,
            kind,
            storage,
            mark_bits,
            free_bits,
            next_slot: AtomicUsize::new(0),
            live_objects: AtomicUsize::new(0),
            descrs: RwLock::new(vec![GcDescr::Length(0); capacity]),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.object_size * self.capacity
    }

    pub fn len_bytes(&self) -> usize {
        self.object_size * self.capacity
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Slot index of an address, accepting interior pointers
    pub fn object_index(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        Some((addr - self.start) / self.object_size)
    }

    /// Base address of a slot
    pub fn base_of_index(&self, index: usize) -> usize {
        debug_assert!(index < self.capacity);
        self.start + index * self.object_size
    }

    // === Mark bit operations ===

    /// Set the mark bit for a slot atomically.
    /// Returns true if the bit was already set.
    pub fn set_mark(&self, index: usize) -> bool {
        let (word, bit) = bit_pos(index);
        let was = self.mark_bits[word].fetch_or(1 << bit, Ordering::AcqRel) & (1 << bit) != 0;
        if !was {
            self.live_objects.fetch_add(1, Ordering::Relaxed);
        }
        was
    }

    pub fn is_marked(&self, index: usize) -> bool {
        let (word, bit) = bit_pos(index);
        self.mark_bits[word].load(Ordering::Acquire) & (1 << bit) != 0
    }

    pub fn clear_mark(&self, index: usize) {
        let (word, bit) = bit_pos(index);
        let was = self.mark_bits[word].fetch_and(!(1u64 << bit), Ordering::AcqRel) & (1 << bit) != 0;
        if was {
            self.live_objects.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Clear the whole mark bitmap and the live counter
    pub fn clear_marks(&self) {
        for word in &self.mark_bits {
            word.store(0, Ordering::Relaxed);
        }
        self.live_objects.store(0, Ordering::Relaxed);
    }

    /// Marked objects in the current cycle
    pub fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Relaxed)
    }

    // === Free bitmap ===

    pub fn is_free(&self, index: usize) -> bool {
        let (word, bit) = bit_pos(index);
        self.free_bits[word].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Mark a slot free and drop its descriptor.
    /// The slot becomes available for reallocation.
    pub fn set_free(&self, index: usize) {
        let mut descrs = self.descrs.write();
        descrs[index] = GcDescr::Length(0);
        let (word, bit) = bit_pos(index);
        self.free_bits[word].fetch_or(1 << bit, Ordering::AcqRel);
    }

    /// Try to carve one object out of this block.
    ///
    /// Prefers the bump cursor, then falls back to slots released by the
    /// sweep. Returns the zeroed object base address.
    pub fn try_alloc(&self, descr: GcDescr) -> Option<usize> {
        let mut descrs = self.descrs.write();

        let index = loop {
            let next = self.next_slot.load(Ordering::Relaxed);
            if next < self.capacity {
                self.next_slot.store(next + 1, Ordering::Relaxed);
                break next;
            }
            // Bump space exhausted; reuse a freed slot if any
            match self.find_free_slot() {
                Some(idx) => break idx,
                None => return None,
            }
        };

        let (word, bit) = bit_pos(index);
        self.free_bits[word].fetch_and(!(1u64 << bit), Ordering::AcqRel);
        descrs[index] = descr;
        drop(descrs);

        let base = self.base_of_index(index);
        self.zero_object(base);
        Some(base)
    }

    fn find_free_slot(&self) -> Option<usize> {
        for (w, word) in self.free_bits.iter().enumerate() {
            let bits = word.load(Ordering::Acquire);
            if bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let index = w * 64 + bit;
                if index < self.capacity {
                    return Some(index);
                }
            }
        }
        None
    }

    fn zero_object(&self, base: usize) {
        for off in (0..self.object_size).step_by(WORD_BYTES) {
            // Within our own storage by construction
            unsafe {
                (*((base + off) as *const AtomicUsize)).store(0, Ordering::Relaxed);
            }
        }
    }

    // === Descriptors ===

    pub fn descr(&self, index: usize) -> GcDescr {
        self.descrs.read()[index].clone()
    }

    pub fn set_descr(&self, index: usize, descr: GcDescr) {
        self.descrs.write()[index] = descr;
    }

    // === Dirty flag (incremental rescan) ===

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    // === Iteration helpers ===

    /// Indices of slots that are allocated (not free)
    pub fn allocated_indices(&self) -> Vec<usize> {
        (0..self.capacity).filter(|&i| !self.is_free(i)).collect()
    }

    /// Indices of allocated slots with their mark bit set
    pub fn marked_indices(&self) -> Vec<usize> {
        (0..self.capacity)
            .filter(|&i| !self.is_free(i) && self.is_marked(i))
            .collect()
    }
}

#[inline]
fn bit_pos(index: usize) -> (usize, usize) {
    (index / 64, index % 64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_index_math() {
        let block = BlockHeader::new(32, 8, BlockKind::Normal);
        let a = block.try_alloc(GcDescr::Length(32)).unwrap();
        let b = block.try_alloc(GcDescr::Length(32)).unwrap();

        assert_eq!(b - a, 32);
        assert_eq!(block.object_index(a), Some(0));
        assert_eq!(block.object_index(b), Some(1));
        // Interior pointer maps to the same slot
        assert_eq!(block.object_index(b + 8), Some(1));
        assert_eq!(block.base_of_index(1), b);
        assert_eq!(block.object_index(block.end()), None);
    }

    #[test]
    fn test_mark_idempotence() {
        let block = BlockHeader::new(16, 4, BlockKind::Normal);
        block.try_alloc(GcDescr::Length(16)).unwrap();

        assert!(!block.is_marked(0));
        assert!(!block.set_mark(0), "first set reports not previously set");
        assert!(block.set_mark(0), "second set reports already set");
        assert_eq!(block.live_objects(), 1, "live counter increments once");

        block.clear_marks();
        assert!(!block.is_marked(0));
        assert_eq!(block.live_objects(), 0);
    }

    #[test]
    fn test_free_and_reuse() {
        let block = BlockHeader::new(16, 2, BlockKind::Normal);
        let a = block.try_alloc(GcDescr::Length(16)).unwrap();
        let _b = block.try_alloc(GcDescr::Length(16)).unwrap();
        assert!(block.try_alloc(GcDescr::Length(16)).is_none(), "full");

        block.set_free(block.object_index(a).unwrap());
        let c = block.try_alloc(GcDescr::Length(16)).unwrap();
        assert_eq!(c, a, "freed slot is reused");
        assert!(!block.is_free(0));
    }

    #[test]
    fn test_freed_slot_is_zeroed_on_reuse() {
        let block = BlockHeader::new(16, 1, BlockKind::Normal);
        let a = block.try_alloc(GcDescr::Length(16)).unwrap();
        unsafe {
            (*(a as *const AtomicUsize)).store(0xdead, Ordering::Relaxed);
        }
        block.set_free(0);
        let b = block.try_alloc(GcDescr::Length(16)).unwrap();
        assert_eq!(b, a);
        let word = unsafe { (*(a as *const AtomicUsize)).load(Ordering::Relaxed) };
        assert_eq!(word, 0);
    }

    #[test]
    fn test_descr_side_table() {
        let block = BlockHeader::new(16, 2, BlockKind::Normal);
        let a = block.try_alloc(GcDescr::Length(8)).unwrap();
        let idx = block.object_index(a).unwrap();
        assert_eq!(block.descr(idx), GcDescr::Length(8));

        block.set_descr(idx, GcDescr::Length(16));
        assert_eq!(block.descr(idx), GcDescr::Length(16));
    }

    #[test]
    fn test_kind_scanning() {
        assert!(BlockKind::Normal.is_scanned());
        assert!(BlockKind::Uncollectable.is_scanned());
        assert!(BlockKind::Stubborn.is_scanned());
        assert!(!BlockKind::PointerFree.is_scanned());
    }
}
