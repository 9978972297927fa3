//! Entry holders and cells
//!
//! An [`EntryCell`] is the store's unit of ownership for one uid. It wraps:
//! - the mutable [`EntryHolder`] behind the per-entry lock
//! - an immutable [`EntrySnapshot`] republished after every mutation, so a
//!   non-blocking reader can evaluate the entry without the entry lock
//! - a modification stamp the lock-free reader re-checks afterwards
//!
//! Holders are mutated only through an [`EntryGuard`]; dropping a guard that
//! was written through reposts the entry's index values and republishes the
//! snapshot.

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use gridspace_concurrency::{EntryLockState, XtnOutcome};
use gridspace_core::{EntryData, TemplateHandle, Uid, Value};

use crate::mvcc::MvccShell;
use crate::sharded::TypeShard;

/// Mutable state of one stored entry
#[derive(Debug)]
pub struct EntryHolder {
    /// Current (possibly uncommitted) content
    pub data: EntryData,
    /// Committed content while a transaction has an update pending
    pub shadow: Option<EntryData>,
    /// Lock ownership and FIFO stamps
    pub locks: EntryLockState,
    /// Terminal deletion flag
    pub deleted: bool,
    /// Never handed to persistence
    pub transient: bool,
    /// Templates blocked on this entry
    pub waiting: FxHashSet<TemplateHandle>,
    /// Committed generation chain when MVCC is enabled
    pub mvcc: Option<MvccShell>,
    pub(crate) postings: Vec<(String, Value)>,
}

impl EntryHolder {
    /// Holder for freshly written content
    pub fn new(data: EntryData, locks: EntryLockState, transient: bool) -> Self {
        Self {
            data,
            shadow: None,
            locks,
            deleted: false,
            transient,
            waiting: FxHashSet::default(),
            mvcc: None,
            postings: Vec::new(),
        }
    }

    /// With an MVCC shell attached
    pub fn with_mvcc(mut self, shell: MvccShell) -> Self {
        self.mvcc = Some(shell);
        self
    }

    /// Whether an undecided transaction changed or created the content
    pub fn is_dirty(&self) -> bool {
        let uncertain_creator = self
            .locks
            .entry_writer()
            .is_some_and(|x| x.outcome() == XtnOutcome::Uncertain);
        self.shadow.is_some() || uncertain_creator
    }

    /// Latest committed content, if any
    pub fn committed_data(&self) -> Option<&EntryData> {
        if let Some(shadow) = &self.shadow {
            return Some(shadow);
        }
        if self.locks.entry_writer().is_some() {
            return None;
        }
        Some(&self.data)
    }

    /// Whether any transaction holds a write lock
    pub fn is_write_locked(&self) -> bool {
        self.locks.write_owner().is_some()
    }
}

/// Immutable published view of an entry
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    /// Current content
    pub data: EntryData,
    /// Terminal deletion flag
    pub deleted: bool,
    /// A transaction holds the write lock
    pub write_locked: bool,
    /// Content is uncommitted
    pub dirty: bool,
}

impl EntrySnapshot {
    fn of(holder: &EntryHolder) -> Self {
        Self {
            data: holder.data.clone(),
            deleted: holder.deleted,
            write_locked: holder.is_write_locked(),
            dirty: holder.is_dirty(),
        }
    }
}

/// One stored uid
#[derive(Debug)]
pub struct EntryCell {
    uid: Uid,
    type_name: String,
    seq: u64,
    holder: Mutex<EntryHolder>,
    snapshot: RwLock<Arc<EntrySnapshot>>,
    stamp: AtomicU64,
    shard: Weak<TypeShard>,
}

impl EntryCell {
    pub(crate) fn new(holder: EntryHolder, seq: u64, shard: Weak<TypeShard>) -> Self {
        let snapshot = Arc::new(EntrySnapshot::of(&holder));
        Self {
            uid: holder.data.uid.clone(),
            type_name: holder.data.type_name.clone(),
            seq,
            holder: Mutex::new(holder),
            snapshot: RwLock::new(snapshot),
            stamp: AtomicU64::new(0),
            shard,
        }
    }

    /// Uid
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Concrete type
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Insertion sequence number (FIFO order)
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Acquire the entry lock
    pub fn lock(&self) -> EntryGuard<'_> {
        EntryGuard {
            cell: self,
            holder: self.holder.lock(),
            touched: false,
        }
    }

    /// Modification stamp; changes on every published mutation
    pub fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// Last published snapshot
    pub fn snapshot(&self) -> Arc<EntrySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    fn publish(&self, holder: &mut EntryHolder) {
        if let Some(shard) = self.shard.upgrade() {
            shard.repost(self, holder);
        }
        *self.snapshot.write() = Arc::new(EntrySnapshot::of(holder));
        self.stamp.fetch_add(1, Ordering::AcqRel);
    }
}

/// Entry lock guard
///
/// Mutable access marks the holder as touched; the drop republishes it.
pub struct EntryGuard<'a> {
    cell: &'a EntryCell,
    holder: MutexGuard<'a, EntryHolder>,
    touched: bool,
}

impl<'a> EntryGuard<'a> {
    /// The cell this guard locks
    pub fn cell(&self) -> &'a EntryCell {
        self.cell
    }

    /// Republish on drop even if nothing was written through the guard
    pub fn republish(&mut self) {
        self.touched = true;
    }

    /// Waiting set of the entry
    ///
    /// Not part of the published snapshot, so changing it does not
    /// republish.
    pub fn waiting_mut(&mut self) -> &mut FxHashSet<TemplateHandle> {
        &mut self.holder.waiting
    }
}

impl Deref for EntryGuard<'_> {
    type Target = EntryHolder;

    fn deref(&self) -> &EntryHolder {
        &self.holder
    }
}

impl DerefMut for EntryGuard<'_> {
    fn deref_mut(&mut self) -> &mut EntryHolder {
        self.touched = true;
        &mut self.holder
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        if self.touched {
            self.cell.publish(&mut self.holder);
        }
    }
}
