//! Transaction termination
//!
//! # Commit
//!
//! Under the transaction's termination lock:
//!
//! 1. fix the termination marks (MVCC generation, FIFO numbers)
//! 2. drain in-flight operations and move to `Committing`
//! 3. cancel the transaction's pending templates
//! 4. replicate the mutation bundle unless prepare already did
//! 5. apply the commit to every entry in the footprint
//! 6. persist the net effect as one batch
//! 7. complete the generation, move to `Committed`, drop the entry
//!
//! Waiters on the touched entries are served after the lock is released.
//! Once `Committing` is reached the commit stands; a replication or
//! persistence failure after that point is logged and reported to the
//! caller, never undone.
//!
//! # Rollback
//!
//! Same pass with rollback semantics, no replication and no persistence.

mod settle;

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use gridspace_concurrency::{TerminationMarks, XtnEntry, XtnStatus};
use gridspace_core::{Result, SpaceError, Uid, XtnId};

use crate::durability::PersistPlan;
use crate::engine::EngineInner;
use crate::executor::Notices;
use crate::stats::SpaceCounters;

fn not_active(xtn: &XtnEntry) -> SpaceError {
    SpaceError::TransactionNotActive {
        xtn: xtn.id(),
        status: xtn.status().to_string(),
    }
}

impl EngineInner {
    /// First phase of two-phase commit: replicate and vote
    pub(crate) fn prepare(&self, id: XtnId) -> Result<u32> {
        self.xtns.with_termination_lock(id, |xtn| {
            if !self.xtns.transition(xtn, XtnStatus::Begun, XtnStatus::Preparing) {
                return Err(not_active(xtn));
            }
            self.cancel_templates_of(xtn);
            match self.replicate_transaction(xtn) {
                Ok(level) => {
                    xtn.set_replication_level(level);
                    self.xtns
                        .transition(xtn, XtnStatus::Preparing, XtnStatus::Prepared);
                    debug!(xtn = %id, level, "transaction prepared");
                    Ok(level)
                }
                Err(err) => {
                    self.xtns
                        .transition(xtn, XtnStatus::Preparing, XtnStatus::Error);
                    warn!(xtn = %id, error = %err, "prepare failed, transaction must be aborted");
                    Err(err)
                }
            }
        })
    }

    /// Commit; returns the replication consistency level
    pub(crate) fn commit(&self, id: XtnId) -> Result<u32> {
        let mut notices = Notices::new();
        let result = self.xtns.with_termination_lock(id, |xtn| {
            let from = xtn.status();
            if !matches!(from, XtnStatus::Begun | XtnStatus::Prepared) {
                return Err(not_active(xtn));
            }
            let marks = self.termination_marks(xtn)?;
            if !self.xtns.transition(xtn, from, XtnStatus::Committing) {
                return Err(not_active(xtn));
            }
            self.cancel_templates_of(xtn);

            let replicated = self.replicate_transaction(xtn);
            match &replicated {
                Ok(level) => xtn.set_replication_level(*level),
                Err(err) => {
                    error!(xtn = %id, error = %err, "replicating committed transaction failed")
                }
            }
            let (touched, transient) = self.terminate_entries(xtn, true, &marks, &mut notices);
            let plan = PersistPlan::from_mutations(&xtn.mutations()).without(&transient);
            let persisted = self.persist_plan(xtn, &plan);
            self.complete_generation(&marks);

            self.xtns
                .transition(xtn, XtnStatus::Committing, XtnStatus::Committed);
            self.xtns.remove(xtn);
            SpaceCounters::bump(&self.counters.commits);
            info!(
                xtn = %id,
                entries = touched,
                age_ms = xtn.age_ms() as u64,
                "transaction committed"
            );
            replicated?;
            persisted?;
            Ok(xtn.replication_level())
        });
        self.notify(notices);
        result
    }

    /// Roll back
    pub(crate) fn abort(&self, id: XtnId) -> Result<()> {
        let mut notices = Notices::new();
        let result = self.xtns.with_termination_lock(id, |xtn| {
            let from = xtn.status();
            if !matches!(
                from,
                XtnStatus::Begun | XtnStatus::Prepared | XtnStatus::Error
            ) {
                return Err(not_active(xtn));
            }
            let marks = self.termination_marks(xtn)?;
            if !self.xtns.transition(xtn, from, XtnStatus::Rolling) {
                return Err(not_active(xtn));
            }
            self.cancel_templates_of(xtn);
            let (touched, _) = self.terminate_entries(xtn, false, &marks, &mut notices);
            self.complete_generation(&marks);

            self.xtns.transition(xtn, XtnStatus::Rolling, XtnStatus::Rolled);
            self.xtns.remove(xtn);
            SpaceCounters::bump(&self.counters.aborts);
            info!(xtn = %id, entries = touched, "transaction rolled back");
            Ok(())
        });
        self.notify(notices);
        result
    }

    /// Apply the outcome to every entry the transaction locked
    ///
    /// Returns the number of entries touched and the transient uids among
    /// them.
    fn terminate_entries(
        &self,
        xtn: &Arc<XtnEntry>,
        committed: bool,
        marks: &TerminationMarks,
        notices: &mut Notices,
    ) -> (usize, Vec<Uid>) {
        let mut touched = 0;
        let mut transient = Vec::new();
        for uid in xtn.locked_uids() {
            let Some(cell) = self.store.get(&uid) else {
                continue;
            };
            let mut guard = cell.lock();
            if guard.transient {
                transient.push(uid.clone());
            }
            let released = self.apply_outcome(&mut guard, xtn, committed, marks);
            drop(guard);
            if !released.is_empty() {
                touched += 1;
                notices.push(cell);
            }
        }
        (touched, transient)
    }

    fn complete_generation(&self, marks: &TerminationMarks) {
        if let Some(generation) = marks.generation {
            if let Err(err) = self.generations.mark_completed(generation) {
                error!(generation, error = %err, "could not complete transaction generation");
            }
        }
    }
}
