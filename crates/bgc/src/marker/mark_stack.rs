//! Mark Stack - Explicit Worklist for the Tracing Loop
//!
//! Entries are (start address, descriptor) pairs. The stack has a soft
//! capacity; hitting it is not fatal. A full stack discards a few of its
//! newest entries, latches an overflow flag, and keeps going. The owner
//! reacts by growing the stack and rebuilding the worklist from mark bits,
//! so a dropped entry only costs a rescan, never a missed object.

use crate::descr::GcDescr;

/// Entries discarded from the top when a push hits capacity
pub const MARK_STACK_DISCARDS: usize = 8;

/// Smallest usable stack capacity
pub const MIN_MARK_STACK: usize = 16;

/// One unit of pending tracing work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkEntry {
    /// First address of the range or object to scan
    pub start: usize,
    /// How to interpret the memory at `start`
    pub descr: GcDescr,
}

impl MarkEntry {
    /// Bytes this entry will scan, where the descriptor states it
    pub fn scan_bytes(&self) -> usize {
        match &self.descr {
            GcDescr::Length(bytes) => *bytes,
            GcDescr::Bitmap(bitmap) => bitmap.width_words() * crate::heap::WORD_BYTES,
            _ => crate::heap::WORD_BYTES,
        }
    }
}

/// Growable LIFO worklist with discard-on-overflow
pub struct MarkStack {
    entries: Vec<MarkEntry>,
    capacity: usize,
    overflowed: bool,
}

impl MarkStack {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_MARK_STACK);
        Self {
            entries: Vec::with_capacity(capacity.min(4096)),
            capacity,
            overflowed: false,
        }
    }

    /// Push an entry. At capacity, [`MARK_STACK_DISCARDS`] of the newest
    /// entries are dropped and the overflow flag latches; the incoming
    /// entry is then pushed so scanning keeps making progress.
    pub fn push(&mut self, entry: MarkEntry) {
        if self.entries.len() >= self.capacity {
            let keep = self.entries.len().saturating_sub(MARK_STACK_DISCARDS);
            self.entries.truncate(keep);
            self.overflowed = true;
        }
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Option<MarkEntry> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a push has overflowed since the flag was last taken
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Read and clear the overflow flag
    pub fn take_overflowed(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    /// Double the capacity and clear the overflow flag. Called between the
    /// overflow and the rebuild of the worklist.
    pub fn grow(&mut self) {
        self.capacity = self.capacity.saturating_mul(2);
        self.overflowed = false;
    }

    /// Drop all pending entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Move all pending entries out, leaving the stack empty
    pub fn drain_all(&mut self) -> Vec<MarkEntry> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: usize) -> MarkEntry {
        MarkEntry {
            start,
            descr: GcDescr::Length(8),
        }
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut stack = MarkStack::new(64);
        stack.push(entry(0x100));
        stack.push(entry(0x200));

        assert_eq!(stack.pop().unwrap().start, 0x200);
        assert_eq!(stack.pop().unwrap().start, 0x100);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_overflow_discards_and_latches() {
        let mut stack = MarkStack::new(MIN_MARK_STACK);
        for i in 0..MIN_MARK_STACK {
            stack.push(entry(i * 8));
        }
        assert!(!stack.overflowed());
        assert_eq!(stack.len(), MIN_MARK_STACK);

        // One past capacity: eight newest dropped, incoming kept
        stack.push(entry(0xffff));
        assert!(stack.overflowed());
        assert_eq!(stack.len(), MIN_MARK_STACK - MARK_STACK_DISCARDS + 1);
        assert_eq!(stack.pop().unwrap().start, 0xffff);

        // Flag reads once
        assert!(stack.take_overflowed());
        assert!(!stack.take_overflowed());
    }

    #[test]
    fn test_grow_doubles_capacity() {
        let mut stack = MarkStack::new(32);
        stack.push(entry(0));
        stack.grow();
        assert_eq!(stack.capacity(), 64);
        assert!(!stack.overflowed());
        // Entries survive a grow; the rebuild decides whether to clear
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_minimum_capacity() {
        let stack = MarkStack::new(2);
        assert_eq!(stack.capacity(), MIN_MARK_STACK);
    }
}
