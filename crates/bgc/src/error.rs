//! Error Module - BGC Error Types
//!
//! Defines all error types used in BGC.
//!
//! # Error Categories
//!
//! ## Resource exhaustion (recoverable)
//! - `OutOfMemory` - Heap exhaustion
//! - `MarkStackOverflow` - Mark stack capacity exceeded
//!
//! ## Diagnostics
//! - `CorruptionDetected` - Debug-header canary or size mismatch
//!
//! ## Invalid API usage (caller bug, fatal)
//! - `InvalidUsage` - Freeing a non-heap pointer, registering a finalizer
//!   on a non-heap object, and similar
//!
//! ## Configuration / internal
//! - `Configuration` - Invalid configuration
//! - `Internal` - Invariant violation inside the collector

use thiserror::Error;

/// Main error type for all BGC operations
#[derive(Debug, Error)]
pub enum GcError {
    /// Out of memory - heap exhaustion
    ///
    /// **When returned:** Allocation request exceeds the configured heap limit
    ///
    /// **Recovery strategy:** Run a collection and retry, or fail gracefully
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Mark stack overflow
    ///
    /// **When returned:** A trusted root push would exceed a pre-sized mark
    /// stack. Ordinary marking never returns this: overflow during tracing
    /// degrades the cycle to a full rescan instead.
    ///
    /// **Recovery strategy:** Grow the stack and rerun the cycle
    #[error("Mark stack overflow: capacity {capacity} entries")]
    MarkStackOverflow { capacity: usize },

    /// Heap corruption detected via debug object headers
    ///
    /// **When returned:** A canary word or recorded size field does not match
    /// at `debug_free`/`debug_realloc`/explicit check time
    ///
    /// **Recovery strategy:** Diagnostic only; execution may continue
    #[error("Corruption detected at {address:#x}: {detail}")]
    CorruptionDetected { address: usize, detail: String },

    /// Invalid API usage - indicates a bug in the calling program
    ///
    /// **When returned:** Freeing a non-heap pointer, registering a finalizer
    /// on a non-heap object, writing outside an allocated object
    ///
    /// **Recovery strategy:** Cannot recover - fix the caller
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Configuration error
    ///
    /// **When returned:** Invalid collector configuration detected
    ///
    /// **Recovery strategy:** Use default configuration or fail fast
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error - indicates a bug in BGC
    ///
    /// **When returned:** Invariant violation or unexpected state
    ///
    /// **Recovery strategy:** Cannot recover - this is a bug
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GcError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GcError::OutOfMemory { .. }
                | GcError::MarkStackOverflow { .. }
                | GcError::CorruptionDetected { .. }
        )
    }

    /// Check if this error indicates a bug in the caller or the collector
    pub fn is_bug(&self) -> bool {
        matches!(self, GcError::InvalidUsage(_) | GcError::Internal(_))
    }
}

/// Result type alias for BGC operations
pub type Result<T> = std::result::Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let err = GcError::OutOfMemory {
            requested: 64,
            available: 0,
        };
        assert!(err.is_recoverable());
        assert!(!err.is_bug());

        let err = GcError::MarkStackOverflow { capacity: 128 };
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_bug_classification() {
        let err = GcError::InvalidUsage("free of non-heap pointer".to_string());
        assert!(err.is_bug());
        assert!(!err.is_recoverable());

        let err = GcError::Internal("mark state desync".to_string());
        assert!(err.is_bug());
    }

    #[test]
    fn test_display() {
        let err = GcError::CorruptionDetected {
            address: 0x1000,
            detail: "start canary mismatch".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x1000"));
        assert!(msg.contains("start canary"));
    }
}
