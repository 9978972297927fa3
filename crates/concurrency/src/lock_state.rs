//! Per-entry lock ownership
//!
//! Stored next to the entry data and mutated only under the entry lock.
//! Holds:
//! - the write-lock owner and the operation it locked with
//! - shared read-lock owners
//! - the transaction that created the entry, until it terminates
//! - FIFO termination stamps

use smallvec::SmallVec;
use std::sync::Arc;

use gridspace_core::{OperationKind, XtnId};

use crate::xtn::XtnEntry;

/// Termination sequence numbers recorded on a FIFO entry
///
/// Each stamp only moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoStamps {
    /// Last termination that released a write lock on the entry
    pub write_lock_released: u64,
    /// Last termination that released a read lock on the entry
    pub read_lock_released: u64,
    /// Last termination whose written value is now the visible one
    pub entry_write: u64,
}

impl FifoStamps {
    /// Record a write-lock release
    pub fn stamp_write_release(&mut self, seq: u64) {
        self.write_lock_released = self.write_lock_released.max(seq);
    }

    /// Record a read-lock release
    pub fn stamp_read_release(&mut self, seq: u64) {
        self.read_lock_released = self.read_lock_released.max(seq);
    }

    /// Record the terminating writer
    pub fn stamp_entry_write(&mut self, seq: u64) {
        self.entry_write = self.entry_write.max(seq);
    }
}

/// What a transaction held on one entry before it let go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Released {
    /// Operation kind of the released write lock, if one was held
    pub write: Option<OperationKind>,
    /// Whether a read lock was held
    pub read: bool,
    /// Whether the transaction created the entry
    pub created: bool,
}

impl Released {
    /// Nothing was held
    pub fn is_empty(&self) -> bool {
        self.write.is_none() && !self.read && !self.created
    }
}

/// Lock fields of one entry
#[derive(Debug, Default, Clone)]
pub struct EntryLockState {
    write_owner: Option<(Arc<XtnEntry>, OperationKind)>,
    read_owners: SmallVec<[Arc<XtnEntry>; 2]>,
    entry_writer: Option<Arc<XtnEntry>>,
    /// FIFO termination stamps
    pub fifo: FifoStamps,
}

impl EntryLockState {
    /// Unlocked state
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock state of an entry created inside a transaction
    pub fn created_by(xtn: Arc<XtnEntry>) -> Self {
        Self {
            write_owner: Some((Arc::clone(&xtn), OperationKind::Write)),
            entry_writer: Some(xtn),
            ..Self::default()
        }
    }

    /// Write-lock owner
    pub fn write_owner(&self) -> Option<&Arc<XtnEntry>> {
        self.write_owner.as_ref().map(|(x, _)| x)
    }

    /// Operation the write lock was taken with
    pub fn write_lock_kind(&self) -> Option<OperationKind> {
        self.write_owner.as_ref().map(|(_, k)| *k)
    }

    /// Shared read owners
    pub fn read_owners(&self) -> &[Arc<XtnEntry>] {
        &self.read_owners
    }

    /// Transaction that created the entry, while it is still attached
    pub fn entry_writer(&self) -> Option<&Arc<XtnEntry>> {
        self.entry_writer.as_ref()
    }

    /// Whether `xtn` holds the write lock
    pub fn is_write_owner(&self, xtn: XtnId) -> bool {
        self.write_owner().is_some_and(|x| x.id() == xtn)
    }

    /// Whether `xtn` holds a read lock
    pub fn is_read_owner(&self, xtn: XtnId) -> bool {
        self.read_owners.iter().any(|x| x.id() == xtn)
    }

    /// Whether any transaction holds any lock
    pub fn is_locked(&self) -> bool {
        self.write_owner.is_some() || !self.read_owners.is_empty()
    }

    /// Every distinct owner, write owner first
    pub fn owners(&self) -> Vec<Arc<XtnEntry>> {
        let mut owners: Vec<Arc<XtnEntry>> = Vec::with_capacity(1 + self.read_owners.len());
        let candidates = self
            .write_owner()
            .into_iter()
            .chain(self.read_owners.iter())
            .chain(self.entry_writer.iter());
        for xtn in candidates {
            if !owners.iter().any(|o| o.id() == xtn.id()) {
                owners.push(Arc::clone(xtn));
            }
        }
        owners
    }

    /// Owners whose outcome is final
    pub fn settled_owners(&self) -> Vec<Arc<XtnEntry>> {
        self.owners()
            .into_iter()
            .filter(|x| x.final_outcome().is_some())
            .collect()
    }

    /// Add a shared read lock; no-op if `xtn` already holds any lock
    pub fn add_read_owner(&mut self, xtn: &Arc<XtnEntry>) {
        if self.is_write_owner(xtn.id()) || self.is_read_owner(xtn.id()) {
            return;
        }
        self.read_owners.push(Arc::clone(xtn));
    }

    /// Take (or upgrade to) the write lock
    ///
    /// A read lock of the same transaction is absorbed. A creating
    /// transaction keeps `Write` semantics for updates; a take overrides.
    pub fn set_write_owner(&mut self, xtn: &Arc<XtnEntry>, kind: OperationKind) {
        self.read_owners.retain(|x| x.id() != xtn.id());
        let kind = match self.write_owner.as_ref() {
            Some((owner, OperationKind::Write)) if owner.id() == xtn.id() && !kind.is_take() => {
                OperationKind::Write
            }
            Some((owner, current))
                if owner.id() == xtn.id() && kind == OperationKind::ReadExclusive =>
            {
                *current
            }
            _ => kind,
        };
        self.write_owner = Some((Arc::clone(xtn), kind));
    }

    /// Drop every lock `xtn` holds and report what it held
    pub fn release(&mut self, xtn: XtnId) -> Released {
        let mut released = Released::default();
        if self.is_write_owner(xtn) {
            released.write = self.write_lock_kind();
            self.write_owner = None;
        }
        let before = self.read_owners.len();
        self.read_owners.retain(|x| x.id() != xtn);
        released.read = self.read_owners.len() != before;
        if self.entry_writer.as_ref().is_some_and(|x| x.id() == xtn) {
            self.entry_writer = None;
            released.created = true;
        }
        released
    }
}
