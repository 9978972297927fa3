//! Active transaction table
//!
//! Maps transaction ids to their [`XtnEntry`]. Coordinates:
//! 1. Attach: look up, verify `Begun`, mark busy
//! 2. Conflict checks under the table read lock
//! 3. Terminal transitions under the table write lock plus the
//!    per-transaction termination lock
//!
//! ## Lock ordering
//!
//! ```text
//! termination lock -> xtn busy lock -> table write lock
//! template lock -> table read lock -> entry lock
//! ```
//!
//! Attach never holds the table lock, so a terminator that owns a busy lock
//! and waits for the table write lock cannot be blocked by an attacher.

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use gridspace_core::{Result, SpaceError, XtnId};

use crate::xtn::{XtnEntry, XtnStatus};

/// Operation attached to a transaction
///
/// Dropping the guard releases the busy mark; a terminator waiting for the
/// transaction to go idle wakes when the last guard drops.
#[derive(Debug)]
pub struct XtnUsage {
    xtn: Arc<XtnEntry>,
}

impl XtnUsage {
    /// The attached transaction
    pub fn xtn(&self) -> &Arc<XtnEntry> {
        &self.xtn
    }
}

impl Drop for XtnUsage {
    fn drop(&mut self) {
        self.xtn.leave();
    }
}

/// Table of live transactions
pub struct XtnManager {
    xtns: DashMap<XtnId, Arc<XtnEntry>>,
    next_xtn_id: AtomicU64,
    table_lock: RwLock<()>,
}

impl XtnManager {
    /// Empty table; the first id handed out is 1
    pub fn new() -> Self {
        Self::with_first_id(1)
    }

    /// Empty table starting ids at `first`
    pub fn with_first_id(first: u64) -> Self {
        XtnManager {
            xtns: DashMap::new(),
            next_xtn_id: AtomicU64::new(first),
            table_lock: RwLock::new(()),
        }
    }

    /// Start a new transaction
    pub fn begin(&self, single_participant: bool) -> Arc<XtnEntry> {
        let id = XtnId(self.next_xtn_id.fetch_add(1, Ordering::SeqCst));
        let xtn = Arc::new(XtnEntry::new(id, single_participant));
        self.xtns.insert(id, Arc::clone(&xtn));
        debug!(xtn = %id, single_participant, "transaction begun");
        xtn
    }

    /// Join a transaction created by an external coordinator
    ///
    /// Creates the entry on first use. A terminated id that was already
    /// removed is created afresh, which is what the relock loop in
    /// [`XtnManager::with_termination_lock`] guards against.
    pub fn join(&self, id: XtnId, single_participant: bool) -> Arc<XtnEntry> {
        self.next_xtn_id.fetch_max(id.0 + 1, Ordering::SeqCst);
        let xtn = self
            .xtns
            .entry(id)
            .or_insert_with(|| Arc::new(XtnEntry::new(id, single_participant)));
        Arc::clone(xtn.value())
    }

    /// Look up a live transaction
    pub fn get(&self, id: XtnId) -> Result<Arc<XtnEntry>> {
        self.xtns
            .get(&id)
            .map(|x| Arc::clone(x.value()))
            .ok_or(SpaceError::UnknownTransaction { xtn: id })
    }

    /// Attach an operation: look up, verify `Begun`, mark busy
    pub fn attach(&self, id: XtnId) -> Result<XtnUsage> {
        let xtn = self.get(id)?;
        xtn.enter()?;
        Ok(XtnUsage { xtn })
    }

    /// Read lock held while a conflict verdict depends on owner statuses
    pub fn conflict_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.table_lock.read()
    }

    /// Drain in-flight operations and move `from -> to`
    ///
    /// The status change happens under the table write lock so conflict
    /// checks never see a half-applied transition.
    pub fn transition(&self, xtn: &XtnEntry, from: XtnStatus, to: XtnStatus) -> bool {
        let swapped = xtn.drain_and_transition_with(from, to, || self.table_lock.write());
        if swapped {
            debug!(xtn = %xtn.id(), from = %from, to = %to, "transaction status changed");
        }
        swapped
    }

    /// Run `f` under the transaction's termination lock
    ///
    /// Retries when the entry was replaced between lookup and lock (the id
    /// was removed and re-joined meanwhile). Fails with `UnknownTransaction`
    /// if the id disappeared.
    pub fn with_termination_lock<T>(
        &self,
        id: XtnId,
        f: impl FnOnce(&Arc<XtnEntry>) -> Result<T>,
    ) -> Result<T> {
        loop {
            let xtn = self.get(id)?;
            let _termination = xtn.termination.lock();
            let still_current = match self.xtns.get(&id) {
                Some(current) => Arc::ptr_eq(current.value(), &xtn),
                None => return Err(SpaceError::UnknownTransaction { xtn: id }),
            };
            if still_current {
                return f(&xtn);
            }
            debug!(xtn = %id, "transaction entry replaced during termination, relocking");
        }
    }

    /// Drop a terminal transaction from the table
    ///
    /// Only removes the exact entry given; a re-joined id stays.
    pub fn remove(&self, xtn: &Arc<XtnEntry>) -> bool {
        self.xtns
            .remove_if(&xtn.id(), |_, current| Arc::ptr_eq(current, xtn))
            .is_some()
    }

    /// Number of live transactions
    pub fn active_count(&self) -> usize {
        self.xtns.len()
    }

    /// Ids of live transactions, ascending
    pub fn active_ids(&self) -> Vec<XtnId> {
        let mut ids: Vec<XtnId> = self.xtns.iter().map(|x| *x.key()).collect();
        ids.sort();
        ids
    }
}

impl Default for XtnManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let manager = XtnManager::new();
        let a = manager.begin(true);
        let b = manager.begin(false);
        assert!(b.id() > a.id());
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn test_attach_unknown_transaction() {
        let manager = XtnManager::new();
        assert!(matches!(
            manager.attach(XtnId(42)),
            Err(SpaceError::UnknownTransaction { .. })
        ));
    }

    #[test]
    fn test_usage_guard_releases_busy() {
        let manager = XtnManager::new();
        let xtn = manager.begin(true);
        {
            let _usage = manager.attach(xtn.id()).unwrap();
            assert_eq!(xtn.in_flight(), 1);
        }
        assert_eq!(xtn.in_flight(), 0);
    }

    #[test]
    fn test_transition_waits_for_in_flight_operation() {
        let manager = Arc::new(XtnManager::new());
        let xtn = manager.begin(true);
        let usage = manager.attach(xtn.id()).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handle = {
            let manager = Arc::clone(&manager);
            let xtn = Arc::clone(&xtn);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.transition(&xtn, XtnStatus::Begun, XtnStatus::Committing)
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(xtn.status(), XtnStatus::Begun);
        drop(usage);
        assert!(handle.join().unwrap());
        assert_eq!(xtn.status(), XtnStatus::Committing);
    }

    #[test]
    fn test_attach_after_termination_fails() {
        let manager = XtnManager::new();
        let xtn = manager.begin(true);
        assert!(manager.transition(&xtn, XtnStatus::Begun, XtnStatus::Rolling));
        assert!(matches!(
            manager.attach(xtn.id()),
            Err(SpaceError::TransactionNotActive { .. })
        ));
    }

    #[test]
    fn test_remove_only_exact_entry() {
        let manager = XtnManager::new();
        let old = manager.join(XtnId(7), true);
        assert!(manager.remove(&old));
        let fresh = manager.join(XtnId(7), true);
        assert!(!manager.remove(&old));
        assert!(manager.get(XtnId(7)).is_ok());
        assert!(manager.remove(&fresh));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_termination_lock_after_removal() {
        let manager = XtnManager::new();
        let xtn = manager.begin(true);
        let id = xtn.id();
        manager.remove(&xtn);
        let result = manager.with_termination_lock(id, |_| Ok(()));
        assert!(matches!(result, Err(SpaceError::UnknownTransaction { .. })));
    }

    #[test]
    fn test_concurrent_terminators_only_one_wins() {
        let manager = Arc::new(XtnManager::new());
        let id = manager.begin(true).id();
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager
                        .with_termination_lock(id, |xtn| {
                            Ok(manager.transition(xtn, XtnStatus::Begun, XtnStatus::Rolling))
                        })
                        .unwrap_or(false)
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|w| *w)
            .count();
        assert_eq!(wins, 1);
    }
}
