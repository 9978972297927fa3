//! In-process default collaborators
//!
//! These back a standalone node and the test suites: a wall clock lease
//! oracle, a manually driven clock, a local generation counter, and no-op or
//! recording persistence/replication adapters.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use crate::entry::EntryData;
use crate::error::{Result, SpaceError};
use crate::mutation::Mutation;
use crate::traits::{
    EntryPersistence, GenerationCoordinator, GenerationState, LeaseOracle, ReplicationSink,
};
use crate::types::{Generation, Timestamp, Uid, LEASE_FOREVER};

fn absolute(lease: Option<Duration>, now: Timestamp) -> Timestamp {
    match lease {
        None => LEASE_FOREVER,
        Some(d) => {
            let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
            now.saturating_add(millis)
        }
    }
}

/// Wall clock lease oracle
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLeases;

impl LeaseOracle for SystemLeases {
    fn now(&self) -> Timestamp {
        Utc::now().timestamp_millis()
    }

    fn to_absolute(&self, lease: Option<Duration>, now: Timestamp) -> Timestamp {
        absolute(lease, now)
    }
}

/// Lease oracle driven by hand, for deterministic expiration
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock starting at `start` milliseconds
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl LeaseOracle for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    fn to_absolute(&self, lease: Option<Duration>, now: Timestamp) -> Timestamp {
        absolute(lease, now)
    }
}

#[derive(Debug, Default)]
struct CounterState {
    next: Generation,
    completed: Generation,
    in_flight: BTreeSet<Generation>,
}

/// Single-node generation counter
///
/// Keeps the same contract as the distributed coordinator: generations are
/// handed out monotonically and completion may happen out of order.
#[derive(Debug)]
pub struct LocalGenerationCoordinator {
    state: Mutex<CounterState>,
}

impl LocalGenerationCoordinator {
    /// Counter whose first generation is 1
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState {
                next: 1,
                ..CounterState::default()
            }),
        }
    }
}

impl Default for LocalGenerationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationCoordinator for LocalGenerationCoordinator {
    fn next_generation(&self) -> Result<Generation> {
        let mut state = self.state.lock();
        let generation = state.next;
        state.next += 1;
        state.in_flight.insert(generation);
        Ok(generation)
    }

    fn mark_completed(&self, generation: Generation) -> Result<()> {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&generation) {
            return Err(SpaceError::Internal(format!(
                "generation {} completed twice or never allocated",
                generation
            )));
        }
        state.completed = state.completed.max(generation);
        Ok(())
    }

    fn state(&self) -> Result<GenerationState> {
        let state = self.state.lock();
        Ok(GenerationState {
            next: state.next,
            completed: state.completed,
            uncompleted: state.in_flight.range(..=state.completed).copied().collect(),
        })
    }
}

/// Persistence adapter that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl EntryPersistence for NoPersistence {
    fn get(&self, _uid: &Uid) -> Result<Option<EntryData>> {
        Ok(None)
    }

    fn put(&self, _entry: &EntryData) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _uid: &Uid) -> Result<()> {
        Ok(())
    }
}

/// Map-backed persistence adapter with optional failure injection
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: Mutex<BTreeMap<Uid, EntryData>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent put/remove fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Stored copy of an entry
    pub fn stored(&self, uid: &Uid) -> Option<EntryData> {
        self.entries.lock().get(uid).cloned()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SpaceError::storage("injected write failure"));
        }
        Ok(())
    }
}

impl EntryPersistence for MemoryPersistence {
    fn get(&self, uid: &Uid) -> Result<Option<EntryData>> {
        Ok(self.entries.lock().get(uid).cloned())
    }

    fn put(&self, entry: &EntryData) -> Result<()> {
        self.check_writable()?;
        self.entries.lock().insert(entry.uid.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, uid: &Uid) -> Result<()> {
        self.check_writable()?;
        self.entries.lock().remove(uid);
        Ok(())
    }
}

/// Replication sink for a node without backups
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplication;

impl ReplicationSink for NoReplication {
    fn submit(&self, _mutation: &Mutation) -> Result<u32> {
        Ok(0)
    }
}

/// Replication sink that records every submission
#[derive(Debug, Default)]
pub struct RecordingReplication {
    submitted: Mutex<Vec<Mutation>>,
    level: AtomicU32,
    reject: std::sync::atomic::AtomicBool,
}

impl RecordingReplication {
    /// Sink reporting the given consistency level
    pub fn with_level(level: u32) -> Self {
        Self {
            level: AtomicU32::new(level),
            ..Self::default()
        }
    }

    /// Make every subsequent submission fail
    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Everything submitted so far
    pub fn submitted(&self) -> Vec<Mutation> {
        self.submitted.lock().clone()
    }
}

impl ReplicationSink for RecordingReplication {
    fn submit(&self, mutation: &Mutation) -> Result<u32> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SpaceError::Replication {
                message: "backup rejected mutation".to_string(),
            });
        }
        self.submitted.lock().push(mutation.clone());
        Ok(self.level.load(Ordering::SeqCst))
    }
}
