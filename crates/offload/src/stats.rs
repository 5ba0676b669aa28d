//! Dispatch accounting
//!
//! Cumulative counters incremented from any thread with atomic semantics,
//! plus a point-in-time snapshot for monitoring surfaces.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cumulative dispatch counters
#[derive(Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Build a snapshot, combining the counters with the caller-supplied
    /// gauges (pending entries from the table, idle workers from the
    /// transport).
    pub fn snapshot(&self, pending: usize, idle_workers: usize) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            pending,
            idle_workers,
        }
    }
}

/// Point-in-time view of the dispatch counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Tasks handed to the transport
    pub dispatched: u64,

    /// Completions delivered to a waiter or callback
    pub completed: u64,

    /// Completions dropped because their entry was already gone
    pub expired: u64,

    /// Task ids currently awaiting completion
    pub pending: usize,

    /// Idle task workers reported by the transport
    pub idle_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = DispatchStats::new();
        stats.record_dispatched();
        stats.record_dispatched();
        stats.record_completed();
        stats.record_expired();

        let snapshot = stats.snapshot(3, 1);
        assert_eq!(snapshot.dispatched, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.expired, 1);
        assert_eq!(snapshot.pending, 3);
        assert_eq!(snapshot.idle_workers, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = DispatchStats::new();
        let json = serde_json::to_value(stats.snapshot(0, 2)).expect("serialize");
        assert_eq!(json["idle_workers"], 2);
    }
}
