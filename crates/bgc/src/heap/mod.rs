//! Heap Module - Block Registry and Header Lookup
//!
//! The tracing core consumes the heap through a narrow contract:
//!
//! - `header_for(address)` maps any interior pointer to its owning block
//!   header, or None for addresses outside the heap
//! - `plausible_range()` bounds the cheap pointer pre-filter
//! - mark bits, object sizes and kinds live on the block header
//!
//! Blocks are grouped by (kind, object size); objects larger than half a
//! block get a dedicated single-object block. The registry is an ordered
//! map keyed by block start so interior-pointer lookup is a range query.

pub mod block;

pub use block::{BlockHeader, BlockKind, WORD_BYTES};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::descr::GcDescr;
use crate::error::{GcError, Result};

/// Heap - owns all blocks and answers header lookups
pub struct Heap {
    /// Block registry keyed by start address
    blocks: RwLock<BTreeMap<usize, Arc<BlockHeader>>>,

    /// Open blocks per (kind, object size) class with room left
    open_blocks: Mutex<HashMap<(BlockKind, usize), Vec<usize>>>,

    /// Total bytes of block storage allocated
    total_bytes: AtomicUsize,

    /// Hard heap limit in bytes
    max_bytes: usize,

    /// Preferred block size in bytes
    block_size: usize,

    /// Cheap-filter bounds: lowest block start / highest block end
    least_plausible: AtomicUsize,
    greatest_plausible: AtomicUsize,

    /// When set, word writes dirty their block (incremental rescan)
    dirty_tracking: AtomicBool,
}

impl Heap {
    pub fn new(max_bytes: usize, block_size: usize) -> Self {
        Self {
            blocks: RwLock::new(BTreeMap::new()),
            open_blocks: Mutex::new(HashMap::new()),
            total_bytes: AtomicUsize::new(0),
            max_bytes,
            block_size,
            least_plausible: AtomicUsize::new(usize::MAX),
            greatest_plausible: AtomicUsize::new(0),
            dirty_tracking: AtomicBool::new(false),
        }
    }

    /// Map an address to its owning block header.
    ///
    /// Accepts interior pointers. Returns None for anything outside block
    /// storage - the caller treats that as "not a heap pointer".
    pub fn header_for(&self, addr: usize) -> Option<Arc<BlockHeader>> {
        let blocks = self.blocks.read();
        let (_, block) = blocks.range(..=addr).next_back()?;
        if block.contains(addr) {
            Some(Arc::clone(block))
        } else {
            None
        }
    }

    /// Bounds for the cheap pointer pre-filter.
    ///
    /// Anything outside `[least, greatest)` cannot be a heap pointer.
    /// An empty heap yields an empty range.
    pub fn plausible_range(&self) -> (usize, usize) {
        (
            self.least_plausible.load(Ordering::Relaxed),
            self.greatest_plausible.load(Ordering::Relaxed),
        )
    }

    /// Allocate one object of `size` bytes with the given kind and
    /// descriptor. Returns the zeroed object base address.
    pub fn allocate(&self, size: usize, kind: BlockKind, descr: GcDescr) -> Result<usize> {
        if size == 0 {
            return Err(GcError::InvalidUsage(
                "zero-sized allocation".to_string(),
            ));
        }
        let object_size = round_up_words(size);

        // Large objects get a dedicated block
        if object_size > self.block_size / 2 {
            let block = self.new_block(object_size, 1, kind)?;
            return block.try_alloc(descr).ok_or_else(|| {
                GcError::Internal("fresh single-object block refused allocation".to_string())
            });
        }

        let class = (kind, object_size);
        {
            let open = self.open_blocks.lock();
            if let Some(starts) = open.get(&class) {
                let blocks = self.blocks.read();
                for start in starts {
                    if let Some(block) = blocks.get(start) {
                        if let Some(addr) = block.try_alloc(descr.clone()) {
                            return Ok(addr);
                        }
                    }
                }
            }
        }

        let capacity = (self.block_size / object_size).max(1);
        let block = self.new_block(object_size, capacity, kind)?;
        let addr = block.try_alloc(descr).ok_or_else(|| {
            GcError::Internal("fresh block refused allocation".to_string())
        })?;
        self.open_blocks
            .lock()
            .entry(class)
            .or_default()
            .push(block.start());
        Ok(addr)
    }

    fn new_block(
        &self,
        object_size: usize,
        capacity: usize,
        kind: BlockKind,
    ) -> Result<Arc<BlockHeader>> {
        let bytes = object_size * capacity;
        let used = self.total_bytes.load(Ordering::Relaxed);
        if used + bytes > self.max_bytes {
            return Err(GcError::OutOfMemory {
                requested: bytes,
                available: self.max_bytes.saturating_sub(used),
            });
        }
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);

        let block = BlockHeader::new(object_size, capacity, kind);
        self.least_plausible
            .fetch_min(block.start(), Ordering::Relaxed);
        self.greatest_plausible
            .fetch_max(block.end(), Ordering::Relaxed);
        self.blocks.write().insert(block.start(), Arc::clone(&block));
        Ok(block)
    }

    /// Snapshot of all blocks
    pub fn blocks_snapshot(&self) -> Vec<Arc<BlockHeader>> {
        self.blocks.read().values().cloned().collect()
    }

    /// Clear every block's mark bitmap
    pub fn clear_all_marks(&self) {
        for block in self.blocks.read().values() {
            block.clear_marks();
        }
    }

    /// Bytes of block storage currently allocated
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    // === Word access ===

    /// Read one word from a heap object.
    pub fn read_word(&self, addr: usize) -> Result<usize> {
        if self.header_for(addr).is_none() {
            return Err(GcError::InvalidUsage(format!(
                "read of non-heap address {addr:#x}"
            )));
        }
        Ok(read_word_raw(addr))
    }

    /// Write one word into a heap object.
    ///
    /// During an incremental cycle the containing block is dirtied so the
    /// rescue phase rescans it.
    pub fn write_word(&self, addr: usize, value: usize) -> Result<()> {
        let block = self.header_for(addr).ok_or_else(|| {
            GcError::InvalidUsage(format!("write to non-heap address {addr:#x}"))
        })?;
        if self.dirty_tracking.load(Ordering::Relaxed) {
            block.set_dirty();
        }
        write_word_raw(addr, value);
        Ok(())
    }

    // === Dirty tracking ===

    pub fn set_dirty_tracking(&self, on: bool) {
        self.dirty_tracking.store(on, Ordering::Release);
    }

    /// Blocks dirtied since the last call, with flags cleared
    pub fn take_dirty_blocks(&self) -> Vec<Arc<BlockHeader>> {
        self.blocks
            .read()
            .values()
            .filter(|b| b.take_dirty())
            .cloned()
            .collect()
    }
}

/// Read a word from block storage or a registered root range.
///
/// Heap words are atomics; a relaxed load may observe a value mid-update
/// by a mutator. The mark path treats whatever it reads as an untrusted
/// candidate, so a torn-looking value is harmless.
#[inline]
pub(crate) fn read_word_raw(addr: usize) -> usize {
    debug_assert!(addr % WORD_BYTES == 0);
    unsafe { (*(addr as *const AtomicUsize)).load(Ordering::Relaxed) }
}

#[inline]
pub(crate) fn write_word_raw(addr: usize, value: usize) {
    debug_assert!(addr % WORD_BYTES == 0);
    unsafe { (*(addr as *const AtomicUsize)).store(value, Ordering::Relaxed) }
}

/// Round a byte size up to a whole number of words
#[inline]
pub(crate) fn round_up_words(size: usize) -> usize {
    size.div_ceil(WORD_BYTES) * WORD_BYTES
}
