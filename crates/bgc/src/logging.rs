//! GC Logging and Tracing
//!
//! Event logging for collector operations, useful for:
//! - Performance analysis
//! - Debugging
//! - Leak and corruption diagnostics
//!
//! Log Levels:
//! - ERROR: corruption reports
//! - WARN: degradation events (stack overflow, failed registrations)
//! - INFO: cycles
//! - DEBUG: phases, statistics
//! - TRACE: per-object diagnostics (leaks, back-graph chains)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Log level for collector events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Collector event types
#[derive(Debug, Clone)]
pub enum GcEvent {
    /// Collection cycle started
    CycleStart { cycle: u64, reason: String },

    /// Collection cycle completed
    CycleEnd {
        cycle: u64,
        duration_ms: f64,
        reclaimed_bytes: usize,
    },

    /// Cycle phase started
    PhaseStart { phase: String, cycle: u64 },

    /// Cycle phase completed
    PhaseEnd {
        phase: String,
        duration_ms: f64,
        cycle: u64,
    },

    /// Marking statistics for one cycle
    MarkStats {
        marked_count: u64,
        scanned_bytes: u64,
        range_splits: u64,
    },

    /// Mark stack overflowed; cycle degraded to a rescan
    StackOverflow {
        discarded: usize,
        new_capacity: usize,
    },

    /// Suspected-pointer blacklist summary
    BlacklistStats { entries: usize, hits: u64 },

    /// Finalization pass summary
    FinalizeStats {
        links_cleared: usize,
        enqueued: usize,
        revived: usize,
    },

    /// Debug-header corruption report
    Corruption { address: usize, detail: String },

    /// Unreachable object left in place by leak-finding mode
    LeakReport { address: usize, size: usize },

    /// Longest chain of unreachable-but-uncollected objects
    BackGraphHeight { height: usize, deepest: usize },
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct GcLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,
}

impl Default for GcLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            json: false,
            timestamps: true,
        }
    }
}

/// GcLogger - centralized logging for collector operations
///
/// Events are buffered so tests can assert on them; console output is
/// optional and off by default for library use.
pub struct GcLogger {
    config: GcLoggerConfig,
    events: Mutex<Vec<(Instant, GcEvent)>>,
    enabled: AtomicBool,
}

impl GcLogger {
    pub fn new(config: GcLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a collector event
    pub fn log(&self, event: GcEvent) {
        if !self.is_enabled() {
            return;
        }

        let event_level = self.event_level(&event);
        if event_level > self.config.level {
            return;
        }

        if let Ok(mut events) = self.events.lock() {
            events.push((Instant::now(), event.clone()));
        }

        if self.config.console {
            self.output_console(&event);
        }
    }

    fn event_level(&self, event: &GcEvent) -> LogLevel {
        match event {
            GcEvent::Corruption { .. } => LogLevel::Error,
            GcEvent::StackOverflow { .. } => LogLevel::Warn,
            GcEvent::CycleStart { .. } | GcEvent::CycleEnd { .. } => LogLevel::Info,
            GcEvent::PhaseStart { .. }
            | GcEvent::PhaseEnd { .. }
            | GcEvent::MarkStats { .. }
            | GcEvent::FinalizeStats { .. }
            | GcEvent::BlacklistStats { .. } => LogLevel::Debug,
            GcEvent::LeakReport { .. } | GcEvent::BackGraphHeight { .. } => LogLevel::Trace,
        }
    }

    fn output_console(&self, event: &GcEvent) {
        if self.config.timestamps {
            let now = chrono::Local::now();
            print!("[{}] ", now.format("%Y-%m-%d %H:%M:%S%.3f"));
        }

        if self.config.json {
            self.output_json(event);
        } else {
            self.output_human(event);
        }
    }

    fn output_human(&self, event: &GcEvent) {
        match event {
            GcEvent::CycleStart { cycle, reason } => {
                println!("[GC] Cycle {} started (reason: {})", cycle, reason);
            }
            GcEvent::CycleEnd {
                cycle,
                duration_ms,
                reclaimed_bytes,
            } => {
                println!(
                    "[GC] Cycle {} completed ({:.2}ms, reclaimed {} bytes)",
                    cycle, duration_ms, reclaimed_bytes
                );
            }
            GcEvent::PhaseStart { phase, cycle } => {
                println!("[GC] Cycle {}: {} phase started", cycle, phase);
            }
            GcEvent::PhaseEnd {
                phase,
                duration_ms,
                cycle,
            } => {
                println!(
                    "[GC] Cycle {}: {} phase completed ({:.2}ms)",
                    cycle, phase, duration_ms
                );
            }
            GcEvent::MarkStats {
                marked_count,
                scanned_bytes,
                range_splits,
            } => {
                println!(
                    "[GC] Marked: {} objects, scanned {} bytes, {} splits",
                    marked_count, scanned_bytes, range_splits
                );
            }
            GcEvent::StackOverflow {
                discarded,
                new_capacity,
            } => {
                println!(
                    "[GC] Mark stack overflow: discarded {} entries, next capacity {}",
                    discarded, new_capacity
                );
            }
            GcEvent::BlacklistStats { entries, hits } => {
                println!("[GC] Blacklist: {} sources, {} hits", entries, hits);
            }
            GcEvent::FinalizeStats {
                links_cleared,
                enqueued,
                revived,
            } => {
                println!(
                    "[GC] Finalization: {} links cleared, {} enqueued, {} revived",
                    links_cleared, enqueued, revived
                );
            }
            GcEvent::Corruption { address, detail } => {
                eprintln!("[GC] Corruption at {:#x}: {}", address, detail);
            }
            GcEvent::LeakReport { address, size } => {
                println!("[GC] Leaked object at {:#x} ({} bytes)", address, size);
            }
            GcEvent::BackGraphHeight { height, deepest } => {
                println!(
                    "[GC] Backwards height {} (deepest object {:#x})",
                    height, deepest
                );
            }
        }
    }

    fn output_json(&self, event: &GcEvent) {
        let json = match event {
            GcEvent::CycleStart { cycle, reason } => serde_json::json!({
                "type": "cycle_start",
                "cycle": cycle,
                "reason": reason
            }),
            GcEvent::CycleEnd {
                cycle,
                duration_ms,
                reclaimed_bytes,
            } => serde_json::json!({
                "type": "cycle_end",
                "cycle": cycle,
                "duration_ms": duration_ms,
                "reclaimed_bytes": reclaimed_bytes
            }),
            GcEvent::PhaseStart { phase, cycle } => serde_json::json!({
                "type": "phase_start",
                "cycle": cycle,
                "phase": phase
            }),
            GcEvent::PhaseEnd {
                phase,
                duration_ms,
                cycle,
            } => serde_json::json!({
                "type": "phase_end",
                "cycle": cycle,
                "phase": phase,
                "duration_ms": duration_ms
            }),
            GcEvent::MarkStats {
                marked_count,
                scanned_bytes,
                range_splits,
            } => serde_json::json!({
                "type": "mark_stats",
                "marked_count": marked_count,
                "scanned_bytes": scanned_bytes,
                "range_splits": range_splits
            }),
            GcEvent::StackOverflow {
                discarded,
                new_capacity,
            } => serde_json::json!({
                "type": "stack_overflow",
                "discarded": discarded,
                "new_capacity": new_capacity
            }),
            GcEvent::BlacklistStats { entries, hits } => serde_json::json!({
                "type": "blacklist_stats",
                "entries": entries,
                "hits": hits
            }),
            GcEvent::FinalizeStats {
                links_cleared,
                enqueued,
                revived,
            } => serde_json::json!({
                "type": "finalize_stats",
                "links_cleared": links_cleared,
                "enqueued": enqueued,
                "revived": revived
            }),
            GcEvent::Corruption { address, detail } => serde_json::json!({
                "type": "corruption",
                "address": address,
                "detail": detail
            }),
            GcEvent::LeakReport { address, size } => serde_json::json!({
                "type": "leak",
                "address": address,
                "size": size
            }),
            GcEvent::BackGraphHeight { height, deepest } => serde_json::json!({
                "type": "backgraph_height",
                "height": height,
                "deepest": deepest
            }),
        };

        if let Ok(json_str) = serde_json::to_string(&json) {
            println!("{}", json_str);
        }
    }

    /// Get all buffered events
    pub fn get_events(&self) -> Vec<GcEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().map(|(_, e)| e.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Clear buffered events
    pub fn clear_events(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Get buffered event count
    pub fn event_count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(GcLoggerConfig::default())
    }
}

/// Global collector logger
lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<GcLogger> = Mutex::new(GcLogger::default());
}

/// Log an event to the global logger
pub fn log_event(event: GcEvent) {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.log(event);
    }
}

/// Configure the global logger
pub fn configure_logger(config: GcLoggerConfig) {
    if let Ok(mut logger) = GLOBAL_LOGGER.lock() {
        *logger = GcLogger::new(config);
    }
}

/// Get the global logger's buffered event count
pub fn get_event_count() -> usize {
    GLOBAL_LOGGER.lock().map(|l| l.event_count()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_buffers_events() {
        let logger = GcLogger::default();

        logger.log(GcEvent::CycleStart {
            cycle: 1,
            reason: "explicit".to_string(),
        });

        assert_eq!(logger.event_count(), 1);
    }

    #[test]
    fn test_logger_disable() {
        let logger = GcLogger::default();

        logger.disable();
        logger.log(GcEvent::CycleStart {
            cycle: 1,
            reason: "explicit".to_string(),
        });

        assert_eq!(logger.event_count(), 0);
    }

    #[test]
    fn test_level_filtering() {
        let logger = GcLogger::new(GcLoggerConfig {
            level: LogLevel::Warn,
            ..Default::default()
        });

        // Info event filtered out
        logger.log(GcEvent::CycleStart {
            cycle: 1,
            reason: "explicit".to_string(),
        });
        assert_eq!(logger.event_count(), 0);

        // Warn event kept
        logger.log(GcEvent::StackOverflow {
            discarded: 8,
            new_capacity: 256,
        });
        assert_eq!(logger.event_count(), 1);
    }
}
