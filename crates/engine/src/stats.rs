//! Operation counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub(crate) struct SpaceCounters {
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub takes: AtomicU64,
    pub updates: AtomicU64,
    pub changes: AtomicU64,
    pub conflicts: AtomicU64,
    pub fifo_rejects: AtomicU64,
    pub timeouts: AtomicU64,
    pub commits: AtomicU64,
    pub aborts: AtomicU64,
    pub lock_free_reads: AtomicU64,
}

impl SpaceCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the space counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceStats {
    /// Successful writes
    pub writes: u64,
    /// Successful reads (including read-exclusive)
    pub reads: u64,
    /// Successful takes
    pub takes: u64,
    /// Successful updates
    pub updates: u64,
    /// Successful changes
    pub changes: u64,
    /// Candidates skipped because another transaction held them
    pub conflicts: u64,
    /// FIFO rescans
    pub fifo_rejects: u64,
    /// Operations that gave up waiting
    pub timeouts: u64,
    /// Committed transactions
    pub commits: u64,
    /// Rolled back transactions
    pub aborts: u64,
    /// Reads answered from a published snapshot without the entry lock
    pub lock_free_reads: u64,
    /// Resident entries
    pub entries: usize,
    /// Scans currently open
    pub open_scans: usize,
    /// Templates waiting for an answer
    pub pending_templates: usize,
    /// Live transactions
    pub active_transactions: usize,
}

impl SpaceCounters {
    pub fn snapshot(&self) -> SpaceStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SpaceStats {
            writes: load(&self.writes),
            reads: load(&self.reads),
            takes: load(&self.takes),
            updates: load(&self.updates),
            changes: load(&self.changes),
            conflicts: load(&self.conflicts),
            fifo_rejects: load(&self.fifo_rejects),
            timeouts: load(&self.timeouts),
            commits: load(&self.commits),
            aborts: load(&self.aborts),
            lock_free_reads: load(&self.lock_free_reads),
            ..SpaceStats::default()
        }
    }
}
