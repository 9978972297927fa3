//! Applying a transaction's outcome to one entry
//!
//! Used by the terminator for every entry in a transaction's footprint and
//! by any operation that finds an entry still locked by a transaction
//! whose outcome is final (stale-owner settlement). A prepared transaction
//! is never settled this way, since it may still roll back. Whoever gets
//! there first applies the outcome; the other sees nothing left to release.

use std::sync::Arc;
use tracing::{debug, warn};

use gridspace_concurrency::{Released, TerminationMarks, XtnEntry, XtnOutcome};
use gridspace_core::Result;
use gridspace_storage::{EntryCell, EntryGuard};

use crate::engine::EngineInner;
use crate::executor::Notices;

impl EngineInner {
    /// MVCC generation and FIFO numbers of a terminating transaction
    ///
    /// Fixed on first use so the terminator and settlers stamp alike.
    pub(crate) fn termination_marks(&self, xtn: &XtnEntry) -> Result<TerminationMarks> {
        xtn.marks_or_init(|| {
            let generation = if self.mvcc() {
                Some(self.generations.next_generation()?)
            } else {
                None
            };
            let fifo = xtn
                .fifo_types()
                .into_iter()
                .map(|type_name| {
                    let seq = self.fifo.advance(&type_name);
                    (type_name, seq)
                })
                .collect();
            Ok(TerminationMarks { generation, fifo })
        })
    }

    /// Release locks of owners whose outcome is decided
    pub(crate) fn settle_owners(
        &self,
        cell: &Arc<EntryCell>,
        guard: &mut EntryGuard<'_>,
        notices: &mut Notices,
    ) {
        for owner in guard.locks.settled_owners() {
            let committed = owner.final_outcome() == Some(XtnOutcome::Committed);
            let marks = match self.termination_marks(&owner) {
                Ok(marks) => marks,
                Err(err) => {
                    warn!(xtn = %owner.id(), error = %err, "cannot settle transaction outcome yet");
                    continue;
                }
            };
            let released = self.apply_outcome(guard, &owner, committed, &marks);
            if !released.is_empty() {
                debug!(xtn = %owner.id(), uid = %cell.uid(), committed, "settled stale lock owner");
                notices.push(Arc::clone(cell));
            }
        }
    }

    /// Release `xtn`'s locks on one entry and apply its commit or rollback
    pub(crate) fn apply_outcome(
        &self,
        guard: &mut EntryGuard<'_>,
        xtn: &XtnEntry,
        committed: bool,
        marks: &TerminationMarks,
    ) -> Released {
        let released = guard.locks.release(xtn.id());
        if released.is_empty() {
            return released;
        }
        let holder = &mut **guard;
        let mut gone = false;
        if committed {
            match released.write {
                Some(kind) if kind.is_take() => {
                    if let (Some(shell), Some(generation)) = (holder.mvcc.as_mut(), marks.generation)
                    {
                        shell.commit_hollow(holder.data.clone(), generation);
                    }
                    holder.deleted = true;
                    holder.shadow = None;
                    gone = true;
                }
                Some(kind) if kind.is_mutating() => {
                    holder.shadow = None;
                    if let (Some(shell), Some(generation)) = (holder.mvcc.as_mut(), marks.generation)
                    {
                        shell.commit(holder.data.clone(), generation);
                    }
                }
                _ => {}
            }
        } else if released.created {
            holder.deleted = true;
            holder.shadow = None;
            gone = true;
        } else if released.write.is_some() {
            if let Some(shadow) = holder.shadow.take() {
                holder.data = shadow;
            }
        }

        if let Some(&seq) = marks.fifo.get(&holder.data.type_name) {
            let stamps = &mut holder.locks.fifo;
            if released.write.is_some() {
                stamps.stamp_write_release(seq);
            }
            if released.read {
                stamps.stamp_read_release(seq);
            }
            if committed && released.write.is_some_and(|kind| kind.is_mutating()) {
                stamps.stamp_entry_write(seq);
            }
        }
        if gone {
            self.unlink(guard);
        } else {
            guard.republish();
        }
        released
    }
}
