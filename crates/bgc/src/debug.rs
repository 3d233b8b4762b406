//! Debug Allocation Headers
//!
//! Debug allocations wrap the client payload in guard words:
//!
//! ```text
//! [ start canary | site id | requested size | chain slots... | payload | end canary ]
//! ```
//!
//! Call-chain slots are optional, reserved when the state is built with
//! `with_call_chains`; the embedder stamps return addresses into them.
//!
//! Canaries are a fixed flag XORed with the object base, so a header
//! copied to another address no longer verifies. The site id points into
//! an interned table of (label, line) pairs recorded at allocation, which
//! turns a corruption or leak report into "the object allocated at
//! foo.rs:42" instead of a bare address.
//!
//! Verification failures are queued rather than reported inline; the
//! queue is drained through the logger at a safe point, since corruption
//! is usually detected deep inside a sweep or free.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::descr::make_descriptor;
use crate::error::{GcError, Result};
use crate::heap::{read_word_raw, round_up_words, write_word_raw, BlockKind, Heap, WORD_BYTES};
use crate::logging::{log_event, GcEvent};

/// Canary value for the word before the payload
pub const START_FLAG: usize = 0xfedc_edcb;

/// Canary value for the word after the payload
pub const END_FLAG: usize = 0xE1DE_BDC1;

/// Guard words before the payload: start canary, site id, requested size
pub const HEADER_WORDS: usize = 3;

/// Guard words after the payload
pub const TRAILER_WORDS: usize = 1;

/// Where an allocation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSite {
    pub label: &'static str,
    pub line: u32,
}

/// A failed header verification, queued for deferred reporting
#[derive(Debug, Clone)]
pub struct CorruptionReport {
    pub address: usize,
    pub detail: String,
}

/// Side state for debug allocations
#[derive(Default)]
pub struct DebugState {
    /// site id -> (label, line)
    sites: Mutex<Vec<(String, u32)>>,
    /// payload address -> site id
    objects: Mutex<HashMap<usize, usize>>,
    reports: Mutex<VecDeque<CorruptionReport>>,
    /// Extra header words reserved for caller-stamped call chains
    chain_words: usize,
}

impl DebugState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `depth` call-chain slots in every debug header
    pub fn with_call_chains(depth: usize) -> Self {
        Self {
            chain_words: depth,
            ..Self::default()
        }
    }

    /// Guard words before the payload, including call-chain slots
    pub fn header_words(&self) -> usize {
        HEADER_WORDS + self.chain_words
    }

    /// Stamp a call chain into a tracked object's reserved slots.
    /// Frames beyond the reserved depth are dropped.
    pub fn record_call_chain(&self, payload: usize, frames: &[usize]) -> bool {
        if !self.objects.lock().contains_key(&payload) {
            return false;
        }
        let chain_base = payload - self.chain_words * WORD_BYTES;
        for (i, &frame) in frames.iter().take(self.chain_words).enumerate() {
            write_word_raw(chain_base + i * WORD_BYTES, frame);
        }
        true
    }

    /// Read back the stamped call chain (zero slots are trailing padding)
    pub fn call_chain_of(&self, payload: usize) -> Option<Vec<usize>> {
        if !self.objects.lock().contains_key(&payload) {
            return None;
        }
        let chain_base = payload - self.chain_words * WORD_BYTES;
        let mut frames = Vec::new();
        for i in 0..self.chain_words {
            let word = read_word_raw(chain_base + i * WORD_BYTES);
            if word == 0 {
                break;
            }
            frames.push(word);
        }
        Some(frames)
    }

    fn intern_site(&self, site: AllocSite) -> usize {
        let mut sites = self.sites.lock();
        if let Some(id) = sites
            .iter()
            .position(|(label, line)| label == site.label && *line == site.line)
        {
            return id;
        }
        sites.push((site.label.to_string(), site.line));
        sites.len() - 1
    }

    /// (label, line) for a tracked payload address
    pub fn site_of(&self, payload: usize) -> Option<(String, u32)> {
        let id = *self.objects.lock().get(&payload)?;
        self.sites.lock().get(id).cloned()
    }

    pub fn tracked_objects(&self) -> usize {
        self.objects.lock().len()
    }

    /// Stop tracking an object reclaimed by the sweep.
    /// Returns true if it was tracked.
    pub fn forget(&self, payload: usize) -> bool {
        self.objects.lock().remove(&payload).is_some()
    }

    fn queue_report(&self, address: usize, detail: String) {
        self.reports.lock().push_back(CorruptionReport { address, detail });
    }

    /// Drain queued reports, emitting each through the logger
    pub fn flush_reports(&self) -> Vec<CorruptionReport> {
        let reports: Vec<CorruptionReport> = self.reports.lock().drain(..).collect();
        for report in &reports {
            log_event(GcEvent::Corruption {
                address: report.address,
                detail: report.detail.clone(),
            });
        }
        reports
    }

    pub fn pending_reports(&self) -> usize {
        self.reports.lock().len()
    }
}

/// Allocate with guard words. `pointer_words` describes the payload
/// layout; the guards themselves are never treated as pointers.
/// Returns the payload address.
pub fn debug_allocate(
    heap: &Heap,
    state: &DebugState,
    size: usize,
    kind: BlockKind,
    pointer_words: &[bool],
    site: AllocSite,
) -> Result<usize> {
    let header_words = state.header_words();
    let payload_words = round_up_words(size) / WORD_BYTES;

    // Shift the layout past the header and blank the guard words
    let mut layout = vec![false; header_words];
    layout.extend_from_slice(pointer_words);
    layout.resize(header_words + payload_words + TRAILER_WORDS, false);

    let total = (header_words + payload_words + TRAILER_WORDS) * WORD_BYTES;
    let base = heap.allocate(total, kind, make_descriptor(&layout))?;

    let site_id = state.intern_site(site);
    write_word_raw(base, START_FLAG ^ base);
    write_word_raw(base + WORD_BYTES, site_id);
    write_word_raw(base + 2 * WORD_BYTES, size);
    write_word_raw(
        base + (header_words + payload_words) * WORD_BYTES,
        END_FLAG ^ base,
    );

    let payload = base + header_words * WORD_BYTES;
    state.objects.lock().insert(payload, site_id);
    Ok(payload)
}

/// Verify both canaries of a debug object.
/// A mismatch queues a report and returns `CorruptionDetected`.
pub fn check_object(heap: &Heap, state: &DebugState, payload: usize) -> Result<()> {
    let header_words = state.header_words();
    let base = payload
        .checked_sub(header_words * WORD_BYTES)
        .ok_or_else(|| GcError::InvalidUsage(format!("implausible debug address {payload:#x}")))?;
    let block = heap.header_for(base).ok_or_else(|| {
        GcError::InvalidUsage(format!("debug check of non-heap address {payload:#x}"))
    })?;

    if read_word_raw(base) != START_FLAG ^ base {
        let detail = "start canary clobbered (underwrite before object)".to_string();
        state.queue_report(payload, detail.clone());
        return Err(GcError::CorruptionDetected {
            address: payload,
            detail,
        });
    }

    // Bound the size word before any arithmetic on it; a trashed value
    // near usize::MAX would overflow the rounding below
    let requested = read_word_raw(base + 2 * WORD_BYTES);
    let object_end =
        block.base_of_index(block.object_index(base).unwrap_or(0)) + block.object_size();
    let max_payload =
        object_end.saturating_sub(base + (header_words + TRAILER_WORDS) * WORD_BYTES);
    if requested > max_payload {
        let detail = "size word implausible (header overwritten)".to_string();
        state.queue_report(payload, detail.clone());
        return Err(GcError::CorruptionDetected {
            address: payload,
            detail,
        });
    }
    let payload_words = round_up_words(requested) / WORD_BYTES;
    let trailer = base + (header_words + payload_words) * WORD_BYTES;

    if read_word_raw(trailer) != END_FLAG ^ base {
        let detail = format!("end canary clobbered (overwrite past {requested} bytes)");
        state.queue_report(payload, detail.clone());
        return Err(GcError::CorruptionDetected {
            address: payload,
            detail,
        });
    }
    Ok(())
}

/// Verify and free a debug object.
pub fn debug_free(heap: &Heap, state: &DebugState, payload: usize) -> Result<()> {
    check_object(heap, state, payload)?;
    let base = payload - state.header_words() * WORD_BYTES;
    let block = heap
        .header_for(base)
        .ok_or_else(|| GcError::InvalidUsage(format!("free of non-heap address {payload:#x}")))?;
    let index = block
        .object_index(base)
        .ok_or_else(|| GcError::Internal("header lookup lost the object".to_string()))?;
    block.set_free(index);
    state.objects.lock().remove(&payload);
    Ok(())
}

/// Verify, reallocate, copy the payload, free the old object.
/// The new payload keeps a fully conservative layout.
pub fn debug_realloc(
    heap: &Heap,
    state: &DebugState,
    payload: usize,
    new_size: usize,
    kind: BlockKind,
    site: AllocSite,
) -> Result<usize> {
    check_object(heap, state, payload)?;
    let base = payload - state.header_words() * WORD_BYTES;
    let old_size = read_word_raw(base + 2 * WORD_BYTES);

    let layout = vec![true; round_up_words(new_size) / WORD_BYTES];
    let new_payload = debug_allocate(heap, state, new_size, kind, &layout, site)?;

    let copy_words = round_up_words(old_size.min(new_size)) / WORD_BYTES;
    for i in 0..copy_words {
        let word = read_word_raw(payload + i * WORD_BYTES);
        write_word_raw(new_payload + i * WORD_BYTES, word);
    }

    debug_free(heap, state, payload)?;
    Ok(new_payload)
}
