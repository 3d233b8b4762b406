//! Descriptor Module - Object Layout Descriptors
//!
//! A descriptor tells the tracer which words of an object are pointers.
//! Four encodings:
//!
//! - `Length` - scan the whole range conservatively; `Length(0)` means
//!   "no pointers, skip"
//! - `Bitmap` - one bit per word over the object prefix; inline up to
//!   [`BITMAP_BITS`] words, out-of-line beyond that
//! - `Proc` - delegate scanning to a registered mark procedure
//! - `PerObject` - the real descriptor is found through the object itself
//!   (a type key in its first word, possibly behind one indirection)
//!
//! The original word-packed encoding (tag in the low two bits) is replaced
//! by a genuine sum type; descriptors and type records live in side tables
//! keyed by address, so scanned memory never contains collector metadata.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::heap::WORD_BYTES;
use crate::marker::ScanSink;

/// Width of an inline bitmap in words.
///
/// Matches the packed encoding's capacity (word size minus the two tag
/// bits) so layouts that fit the historical inline form still do.
pub const BITMAP_BITS: usize = usize::BITS as usize - 2;

/// Cap on extended bitmap size, in 64-bit words. Wider layouts fall back
/// to a fully conservative length descriptor.
pub const MAX_BITMAP_WORDS: usize = 512;

/// Object layout descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcDescr {
    /// Contiguous pointer range of this many bytes; 0 = pointer-free
    Length(usize),
    /// Bitmap over the object's first words; set bit = pointer word
    Bitmap(BitmapDescr),
    /// Index into the mark-procedure table plus an environment value
    Proc { index: usize, env: usize },
    /// Resolve through the object's first word; see [`TypeDescrTable`]
    PerObject { indirect: bool },
}

impl GcDescr {
    /// Whether scanning this descriptor can push anything
    pub fn is_pointer_free(&self) -> bool {
        matches!(self, GcDescr::Length(0))
    }
}

/// Bitmap payload: inline single word or out-of-line extended slice
#[derive(Debug, Clone)]
pub enum BitmapDescr {
    /// Bit i set means word i is a pointer; covers at most [`BITMAP_BITS`] words
    Inline(u64),
    /// Wider layouts; bit (w * 64 + i) of words\[w\] covers word offset w * 64 + i
    Extended(Arc<[u64]>),
}

impl PartialEq for BitmapDescr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BitmapDescr::Inline(a), BitmapDescr::Inline(b)) => a == b,
            (BitmapDescr::Extended(a), BitmapDescr::Extended(b)) => a[..] == b[..],
            _ => false,
        }
    }
}

impl Eq for BitmapDescr {}

impl BitmapDescr {
    /// Word offsets whose bit is set, ascending
    pub fn offsets(&self) -> BitmapOffsets<'_> {
        let words: &[u64] = match self {
            BitmapDescr::Inline(w) => std::slice::from_ref(w),
            BitmapDescr::Extended(a) => &a[..],
        };
        BitmapOffsets {
            rest: words.iter(),
            current: 0,
            base: 0,
            started: false,
        }
    }

    /// Number of words the bitmap spans (highest set bit + 1)
    pub fn width_words(&self) -> usize {
        self.offsets().last().map_or(0, |off| off + 1)
    }
}

/// Iterator over set word offsets of a [`BitmapDescr`], ascending
pub struct BitmapOffsets<'a> {
    rest: std::slice::Iter<'a, u64>,
    current: u64,
    base: usize,
    started: bool,
}

impl Iterator for BitmapOffsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.base + bit);
            }
            let word = self.rest.next()?;
            if self.started {
                self.base += 64;
            } else {
                self.started = true;
            }
            self.current = *word;
        }
    }
}

/// Build the most compact descriptor for a layout.
///
/// `pointer_words[i]` states whether word i of the object holds a pointer.
/// Chooses, in order: pure length (all-pointer prefix), inline bitmap,
/// extended bitmap, and finally a fully conservative length descriptor
/// when the layout is too wide to represent precisely.
pub fn make_descriptor(pointer_words: &[bool]) -> GcDescr {
    // Trailing non-pointer words never need scanning
    let trimmed = match pointer_words.iter().rposition(|&b| b) {
        Some(last) => &pointer_words[..=last],
        None => return GcDescr::Length(0),
    };
    let nwords = trimmed.len();

    if trimmed.iter().all(|&b| b) {
        return GcDescr::Length(nwords * WORD_BYTES);
    }

    if nwords <= BITMAP_BITS {
        let mut bits = 0u64;
        for (i, &b) in trimmed.iter().enumerate() {
            if b {
                bits |= 1 << i;
            }
        }
        return GcDescr::Bitmap(BitmapDescr::Inline(bits));
    }

    if nwords <= MAX_BITMAP_WORDS * 64 {
        let mut words = vec![0u64; nwords.div_ceil(64)];
        for (i, &b) in trimmed.iter().enumerate() {
            if b {
                words[i / 64] |= 1 << (i % 64);
            }
        }
        return GcDescr::Bitmap(BitmapDescr::Extended(words.into()));
    }

    // Too wide to represent precisely; scan the whole prefix
    GcDescr::Length(nwords * WORD_BYTES)
}

/// Mark procedure: pushes whatever the object references onto the mark
/// stack through the sink. Receives the object base and the environment
/// value encoded in the descriptor.
pub type MarkProc = Arc<dyn Fn(&mut ScanSink<'_>, usize, usize) + Send + Sync>;

/// Registry of mark procedures referenced by `GcDescr::Proc`
#[derive(Default)]
pub struct MarkProcTable {
    procs: RwLock<Vec<MarkProc>>,
}

impl MarkProcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a procedure, returning its descriptor index
    pub fn register(&self, proc_fn: MarkProc) -> usize {
        let mut procs = self.procs.write();
        procs.push(proc_fn);
        procs.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<MarkProc> {
        self.procs.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.procs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.read().is_empty()
    }
}

/// Registry resolving `GcDescr::PerObject`.
///
/// Resolution reads the object's first word:
/// - `0` is the free-list-node sentinel: the object yields no pointers
/// - direct: the word is the key into this table
/// - indirect: the word points at a type record whose first word is the key
///
/// An unknown key also yields no pointers - a stale word misread as a type
/// key must degrade silently, never fault.
#[derive(Default)]
pub struct TypeDescrTable {
    descrs: RwLock<HashMap<usize, GcDescr>>,
}

impl TypeDescrTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: usize, descr: GcDescr) {
        self.descrs.write().insert(key, descr);
    }

    pub fn lookup(&self, key: usize) -> Option<GcDescr> {
        self.descrs.read().get(&key).cloned()
    }
}
