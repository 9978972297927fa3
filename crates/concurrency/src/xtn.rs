//! Per-transaction state
//!
//! An [`XtnEntry`] lives in the transaction table from the first operation
//! that attaches to it until it is terminal and no operation is still
//! running under it. Entries it locks point back at it through `Arc`
//! clones held in their lock state; that is a back-reference, the table is
//! the owner.
//!
//! ## Status transitions
//!
//! ```text
//! Begun ──▶ Preparing ──▶ Prepared ──▶ Committing ──▶ Committed
//!   │           │            │              ▲
//!   │           ▼            │              │ (single participant, one phase)
//!   │         Error          │              │
//!   │           │            ▼              │
//!   └───────────┴──────▶ Rolling ──▶ Rolled │
//!   └───────────────────────────────────────┘
//! ```

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::Instant;

use gridspace_core::{Generation, Mutation, SpaceError, Uid, XtnId};

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum XtnStatus {
    /// Accepting operations
    Begun = 0,
    /// First phase of two-phase commit running
    Preparing = 1,
    /// Prepared, waiting for the decision
    Prepared = 2,
    /// Commit being applied
    Committing = 3,
    /// Committed
    Committed = 4,
    /// Rollback being applied
    Rolling = 5,
    /// Rolled back
    Rolled = 6,
    /// Prepare failed
    Error = 7,
}

impl XtnStatus {
    fn from_u8(raw: u8) -> XtnStatus {
        match raw {
            0 => XtnStatus::Begun,
            1 => XtnStatus::Preparing,
            2 => XtnStatus::Prepared,
            3 => XtnStatus::Committing,
            4 => XtnStatus::Committed,
            5 => XtnStatus::Rolling,
            6 => XtnStatus::Rolled,
            _ => XtnStatus::Error,
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: XtnStatus) -> bool {
        use XtnStatus::*;
        matches!(
            (self, next),
            (Begun, Preparing)
                | (Begun, Committing)
                | (Begun, Rolling)
                | (Preparing, Prepared)
                | (Preparing, Error)
                | (Prepared, Committing)
                | (Prepared, Rolling)
                | (Committing, Committed)
                | (Rolling, Rolled)
                | (Error, Rolling)
        )
    }

    /// Committed or rolled back
    pub fn is_terminal(self) -> bool {
        matches!(self, XtnStatus::Committed | XtnStatus::Rolled)
    }
}

impl fmt::Display for XtnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XtnStatus::Begun => "BEGUN",
            XtnStatus::Preparing => "PREPARING",
            XtnStatus::Prepared => "PREPARED",
            XtnStatus::Committing => "COMMITTING",
            XtnStatus::Committed => "COMMITTED",
            XtnStatus::Rolling => "ROLLING",
            XtnStatus::Rolled => "ROLLED",
            XtnStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// How a lock holder's outcome looks to other transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XtnOutcome {
    /// Its effects are final (committed, committing, or prepared single participant)
    Committed,
    /// Its effects will be undone (rolled, or rolling before any prepare)
    RolledBack,
    /// Still undecided
    Uncertain,
}

/// Values fixed once when a transaction starts to terminate
///
/// Any thread applying the transaction's outcome to an entry (the
/// terminator or a thread settling a stale owner) uses the same marks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationMarks {
    /// MVCC generation the commit publishes under
    pub generation: Option<Generation>,
    /// FIFO termination number per touched type
    pub fifo: FxHashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Footprint {
    order: Vec<Uid>,
    locked: FxHashSet<Uid>,
    fifo_types: FxHashSet<String>,
    mutations: Vec<Mutation>,
}

/// Transient per-transaction state
pub struct XtnEntry {
    id: XtnId,
    status: AtomicU8,
    single_participant: bool,
    was_prepared: AtomicBool,
    replicated: AtomicBool,
    replication_level: AtomicU32,
    busy: Mutex<u32>,
    idle: Condvar,
    footprint: Mutex<Footprint>,
    marks: Mutex<Option<TerminationMarks>>,
    pub(crate) termination: Mutex<()>,
    started_at: Instant,
}

impl XtnEntry {
    /// New transaction in `Begun`
    pub fn new(id: XtnId, single_participant: bool) -> Self {
        Self {
            id,
            status: AtomicU8::new(XtnStatus::Begun as u8),
            single_participant,
            was_prepared: AtomicBool::new(false),
            replicated: AtomicBool::new(false),
            replication_level: AtomicU32::new(0),
            busy: Mutex::new(0),
            idle: Condvar::new(),
            footprint: Mutex::new(Footprint::default()),
            marks: Mutex::new(None),
            termination: Mutex::new(()),
            started_at: Instant::now(),
        }
    }

    /// Transaction id
    pub fn id(&self) -> XtnId {
        self.id
    }

    /// Current status
    pub fn status(&self) -> XtnStatus {
        XtnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether this transaction commits in one phase
    pub fn is_single_participant(&self) -> bool {
        self.single_participant
    }

    /// Whether prepare ever succeeded
    pub fn was_prepared(&self) -> bool {
        self.was_prepared.load(Ordering::Acquire)
    }

    /// Milliseconds since the transaction began
    pub fn age_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    /// Compare-and-swap the status
    ///
    /// Fails if the current status is not `from` or the transition is not
    /// legal. Callers that need to distinguish the two re-read `status()`.
    pub fn try_transition(&self, from: XtnStatus, to: XtnStatus) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        let swapped = self
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped && to == XtnStatus::Prepared {
            self.was_prepared.store(true, Ordering::Release);
        }
        swapped
    }

    /// Outcome as seen by a conflicting operation
    pub fn outcome(&self) -> XtnOutcome {
        match self.status() {
            XtnStatus::Committed | XtnStatus::Committing => XtnOutcome::Committed,
            XtnStatus::Prepared if self.single_participant => XtnOutcome::Committed,
            XtnStatus::Rolled => XtnOutcome::RolledBack,
            XtnStatus::Rolling if !self.was_prepared() => XtnOutcome::RolledBack,
            _ => XtnOutcome::Uncertain,
        }
    }

    /// Outcome that can no longer change, if any
    ///
    /// Unlike [`XtnEntry::outcome`], a prepared transaction has no final
    /// outcome yet: it may still roll back. Only a final outcome may be
    /// applied to an entry on the transaction's behalf.
    pub fn final_outcome(&self) -> Option<XtnOutcome> {
        match self.status() {
            XtnStatus::Committed | XtnStatus::Committing => Some(XtnOutcome::Committed),
            XtnStatus::Rolled | XtnStatus::Rolling => Some(XtnOutcome::RolledBack),
            _ => None,
        }
    }

    /// Register an in-flight operation; fails unless `Begun`
    pub(crate) fn enter(&self) -> Result<(), SpaceError> {
        let mut busy = self.busy.lock();
        let status = self.status();
        if status != XtnStatus::Begun {
            return Err(SpaceError::TransactionNotActive {
                xtn: self.id,
                status: status.to_string(),
            });
        }
        *busy += 1;
        Ok(())
    }

    /// Unregister an in-flight operation
    pub(crate) fn leave(&self) {
        let mut busy = self.busy.lock();
        *busy = busy.saturating_sub(1);
        if *busy == 0 {
            self.idle.notify_all();
        }
    }

    /// Number of operations currently running under this transaction
    pub fn in_flight(&self) -> u32 {
        *self.busy.lock()
    }

    /// Wait for in-flight operations to drain, then transition
    ///
    /// The busy lock is held across the status change so no operation can
    /// attach between the drain and the transition.
    pub(crate) fn drain_and_transition(&self, from: XtnStatus, to: XtnStatus) -> bool {
        self.drain_and_transition_with(from, to, || ())
    }

    /// Like [`XtnEntry::drain_and_transition`], holding `exclusive()`'s guard
    /// around the status change
    pub(crate) fn drain_and_transition_with<G>(
        &self,
        from: XtnStatus,
        to: XtnStatus,
        exclusive: impl FnOnce() -> G,
    ) -> bool {
        let mut busy = self.busy.lock();
        while *busy > 0 {
            self.idle.wait(&mut busy);
        }
        let _guard = exclusive();
        self.try_transition(from, to)
    }

    /// Record that an entry is locked (or created) under this transaction
    pub fn record_lock(&self, uid: &Uid, type_name: &str, fifo: bool) {
        let mut footprint = self.footprint.lock();
        if footprint.locked.insert(uid.clone()) {
            footprint.order.push(uid.clone());
        }
        if fifo && !footprint.fifo_types.contains(type_name) {
            footprint.fifo_types.insert(type_name.to_string());
        }
    }

    /// Record a mutation for replication at prepare/commit
    pub fn record_mutation(&self, mutation: Mutation) {
        self.footprint.lock().mutations.push(mutation);
    }

    /// Locked uids in first-lock order
    pub fn locked_uids(&self) -> Vec<Uid> {
        self.footprint.lock().order.clone()
    }

    /// FIFO types touched by this transaction
    pub fn fifo_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.footprint.lock().fifo_types.iter().cloned().collect();
        types.sort();
        types
    }

    /// Whether any FIFO-typed entry was locked
    pub fn touches_fifo(&self) -> bool {
        !self.footprint.lock().fifo_types.is_empty()
    }

    /// Claim the right to replicate this transaction
    ///
    /// Returns the recorded mutations exactly once; later calls get `None`.
    pub fn claim_replication(&self) -> Option<Vec<Mutation>> {
        if self.replicated.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.footprint.lock().mutations.clone())
    }

    /// Recorded mutations in application order
    pub fn mutations(&self) -> Vec<Mutation> {
        self.footprint.lock().mutations.clone()
    }

    /// Whether replication already happened
    pub fn is_replicated(&self) -> bool {
        self.replicated.load(Ordering::Acquire)
    }

    /// Remember the consistency level replication reported
    pub fn set_replication_level(&self, level: u32) {
        self.replication_level.fetch_max(level, Ordering::AcqRel);
    }

    /// Highest consistency level replication reported so far
    pub fn replication_level(&self) -> u32 {
        self.replication_level.load(Ordering::Acquire)
    }

    /// Termination marks, computed by `init` on first use
    pub fn marks_or_init(
        &self,
        init: impl FnOnce() -> Result<TerminationMarks, SpaceError>,
    ) -> Result<TerminationMarks, SpaceError> {
        let mut marks = self.marks.lock();
        if let Some(existing) = marks.as_ref() {
            return Ok(existing.clone());
        }
        let fresh = init()?;
        *marks = Some(fresh.clone());
        Ok(fresh)
    }

    /// Termination marks, if already fixed
    pub fn marks(&self) -> Option<TerminationMarks> {
        self.marks.lock().clone()
    }
}

impl fmt::Debug for XtnEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XtnEntry")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("single_participant", &self.single_participant)
            .field("was_prepared", &self.was_prepared())
            .finish()
    }
}
