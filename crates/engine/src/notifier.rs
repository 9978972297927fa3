//! Waking pending templates
//!
//! Every operation collects the cells it changed. Once it has released all
//! of its locks it serves, for each cell, the templates in the cell's
//! waiting set and the templates listening on the cell's type or one of its
//! super types. Serving is an ordinary attempt under the template lock; an
//! answer is delivered outside of it.
//!
//! Retirement (answer, timeout or cancellation) happens under the template
//! lock: the template is marked deleted and removed from every waiting set
//! before its answer becomes readable.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use gridspace_concurrency::XtnEntry;
use gridspace_core::{SpaceError, TemplateHandle};
use gridspace_storage::{Candidate, EntryCell};

use crate::engine::EngineInner;
use crate::executor::{FifoSnapshots, Notices, Search, Searcher};
use crate::outcome::{OpResult, ScanOutcome};
use crate::stats::SpaceCounters;
use crate::templates::{PendingState, PendingTemplate};

impl EngineInner {
    /// Serve the templates interested in each changed cell
    pub(crate) fn notify(&self, notices: Notices) {
        let mut work: VecDeque<Arc<EntryCell>> = notices.into();
        while let Some(cell) = work.pop_front() {
            let mut more = Notices::new();
            for handle in self.interested(&cell) {
                if let Some(pending) = self.templates.get(handle) {
                    self.serve(&pending, &cell, &mut more);
                }
            }
            work.extend(more);
        }
    }

    fn interested(&self, cell: &EntryCell) -> Vec<TemplateHandle> {
        let (mut handles, deleted) = {
            let guard = cell.lock();
            let mut waiting: Vec<TemplateHandle> = guard.waiting.iter().copied().collect();
            waiting.sort();
            (waiting, guard.deleted)
        };
        if !deleted {
            let lineage = self.types.ancestors(cell.type_name());
            for handle in self.templates.listeners(&lineage) {
                if !handles.contains(&handle) {
                    handles.push(handle);
                }
            }
        }
        handles
    }

    fn serve(&self, pending: &Arc<PendingTemplate>, cell: &Arc<EntryCell>, notices: &mut Notices) {
        let candidate = Candidate {
            cell: Arc::clone(cell),
            fully_matched: false,
        };
        let no_snapshots = FifoSnapshots::default();
        match self.attempt_for(pending, &candidate, &no_snapshots, false, notices) {
            Ok(applied) => self.deliver(pending, Ok(Some(applied))),
            Err(ScanOutcome::Failed(err)) => self.deliver(pending, Err(err)),
            Err(ScanOutcome::NoMatch | ScanOutcome::EntryDeleted | ScanOutcome::DeletedByOwnXtn) => {
                self.release_waiting(pending, cell);
            }
            Err(_) => {}
        }
    }

    /// Drop a template's claim on an entry that can no longer answer it
    fn release_waiting(&self, pending: &Arc<PendingTemplate>, cell: &EntryCell) {
        let mut state = pending.state.lock();
        if state.deleted || !state.waiting_on.remove(cell.uid()) {
            return;
        }
        cell.lock().waiting_mut().remove(&pending.handle);
        if self.out_of_candidates(pending, &state) {
            let result = self.nothing_found(&pending.template);
            self.retire_locked(pending, &mut state);
            drop(state);
            self.deliver(pending, result);
        }
    }

    /// A template that only waits on locks has nothing left to wait on
    fn out_of_candidates(&self, pending: &PendingTemplate, state: &PendingState) -> bool {
        pending.listens_on.is_none()
            && state.waiting_on.is_empty()
            && !state.initial_search_in_progress
    }

    // ========================================================================
    // Initial search
    // ========================================================================

    /// First search of a freshly registered template
    ///
    /// FIFO candidates deferred by notifiers while this runs are drained
    /// here, in the initial-search context, before the flag is cleared.
    pub(crate) fn initial_search(&self, pending: &Arc<PendingTemplate>, notices: &mut Notices) {
        let mut rescans = 0;
        loop {
            let snapshots = self.fifo_snapshots(&pending.template);
            match self.search(&pending.template, &snapshots, Searcher::Pending(pending), notices) {
                Search::Answered(applied) => return self.deliver(pending, Ok(Some(applied))),
                Search::Failed(err) => return self.deliver(pending, Err(err)),
                Search::Abandoned => return,
                Search::Exhausted {
                    fifo_rejected: true,
                    ..
                } if rescans < self.config.fifo_retry_limit => rescans += 1,
                Search::Exhausted {
                    fifo_rejected: true,
                    ..
                } => {
                    debug!(template = %pending.handle, "fifo rescans exhausted, waiting");
                    pending.state.lock().fifo_starved = true;
                    break;
                }
                Search::Exhausted { .. } => break,
            }
        }

        loop {
            let mut state = pending.state.lock();
            if state.deleted {
                return;
            }
            let Some(cell) = state.pending_fifo.pop_front() else {
                state.initial_search_in_progress = false;
                if self.out_of_candidates(pending, &state) {
                    let result = self.nothing_found(&pending.template);
                    self.retire_locked(pending, &mut state);
                    drop(state);
                    self.deliver(pending, result);
                }
                return;
            };
            drop(state);
            let candidate = Candidate {
                cell,
                fully_matched: false,
            };
            let no_snapshots = FifoSnapshots::default();
            match self.attempt_for(pending, &candidate, &no_snapshots, true, notices) {
                Ok(applied) => return self.deliver(pending, Ok(Some(applied))),
                Err(ScanOutcome::Failed(err)) => return self.deliver(pending, Err(err)),
                Err(ScanOutcome::TemplateDeleted) => return,
                Err(_) => {}
            }
        }
    }

    // ========================================================================
    // Retirement
    // ========================================================================

    /// Mark a template deleted and detach it from every entry
    ///
    /// The caller holds the template lock.
    pub(crate) fn retire_locked(&self, pending: &PendingTemplate, state: &mut PendingState) {
        state.deleted = true;
        state.pending_fifo.clear();
        for uid in state.waiting_on.drain() {
            if let Some(cell) = self.store.get(&uid) {
                cell.lock().waiting_mut().remove(&pending.handle);
            }
        }
        self.templates.remove(pending);
    }

    /// Hand a retired template its answer
    pub(crate) fn deliver(&self, pending: &PendingTemplate, result: OpResult) {
        self.after_filters(&pending.template, &result);
        if !pending.completion.complete(result) {
            debug!(template = %pending.handle, "template answered twice, keeping the first answer");
        }
    }

    /// Give up on a template whose deadline passed
    ///
    /// Returns the template's answer, which may have arrived concurrently.
    pub(crate) fn expire(&self, pending: &Arc<PendingTemplate>) -> OpResult {
        let mut state = pending.state.lock();
        if state.deleted {
            drop(state);
            return pending.completion.wait();
        }
        let blocked = !state.waiting_on.is_empty() || state.fifo_starved;
        let result = if blocked {
            let uid = state
                .waiting_on
                .iter()
                .next()
                .cloned()
                .or_else(|| state.last_conflict.clone());
            Err(SpaceError::Timeout {
                uid,
                waited_ms: pending.waited_ms(),
            })
        } else {
            self.nothing_found(&pending.template)
        };
        self.retire_locked(pending, &mut state);
        drop(state);
        if blocked {
            SpaceCounters::bump(&self.counters.timeouts);
        }
        self.deliver(pending, result.clone());
        result
    }

    /// Answer the pending templates of a terminating transaction
    pub(crate) fn cancel_templates_of(&self, xtn: &XtnEntry) {
        for pending in self.templates.for_xtn(xtn.id()) {
            let mut state = pending.state.lock();
            if state.deleted {
                continue;
            }
            self.retire_locked(&pending, &mut state);
            drop(state);
            debug!(template = %pending.handle, xtn = %xtn.id(), "template cancelled by termination");
            self.deliver(
                &pending,
                Err(SpaceError::TransactionNotActive {
                    xtn: xtn.id(),
                    status: xtn.status().to_string(),
                }),
            );
        }
    }
}
