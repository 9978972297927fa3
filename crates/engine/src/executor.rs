//! Operation executor
//!
//! Runs read/take/update/change templates against the store.
//!
//! # Attempt protocol
//!
//! Every candidate goes through [`EngineInner::attempt`]:
//!
//! 1. pre-match the published snapshot without locking (active reads only)
//! 2. take the transaction table read lock, then the entry lock
//! 3. settle locks left by transactions whose outcome is already decided
//! 4. drop expired entries, resolve the visible content (shadow or MVCC)
//! 5. re-match if the visible content differs from what was matched
//! 6. classify conflicts; a blocked template enlists on the entry
//! 7. check FIFO validity against the scan's termination snapshot
//! 8. apply the operation
//!
//! Signals other than success come back as [`ScanOutcome`] values; the
//! search loop decides whether to move on, rescan, wait or fail.
//!
//! # Blocking
//!
//! A template with a timeout that finds no answer is registered in the
//! template arena. It is retried by notifiers when an entry it waits on
//! changes, or when a new entry of its type arrives. Pending templates do
//! not keep their transaction attached between attempts; each attempt
//! attaches anew, so a terminator never waits for a blocked operation.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use gridspace_concurrency::{
    check_conflict, check_fifo_validity, ConflictVerdict, ConflictView, EntryLockState,
    FifoThreadContext, FifoVerdict, XtnEntry, XtnUsage,
};
use gridspace_core::{
    EntryData, FilterContext, OperationKind, Result, Selector, SpaceError, Template,
    TemplateHandle, Uid,
};
use gridspace_storage::{resolve_visible, Candidate, EntryCell, EntryHolder, MvccShell, Visibility};

use crate::completion::Completion;
use crate::engine::EngineInner;
use crate::outcome::{Applied, OpResult, ScanOutcome};
use crate::stats::SpaceCounters;
use crate::templates::{PendingSpec, PendingState, PendingTemplate};

/// Cells whose waiters must be served once every lock is released
pub(crate) type Notices = Vec<Arc<EntryCell>>;

/// FIFO termination numbers per concrete type, taken when a scan starts
pub(crate) type FifoSnapshots = FxHashMap<String, u64>;

/// What one attempt runs with
pub(crate) struct AttemptCtx<'a> {
    pub template: &'a Template,
    pub xtn: Option<&'a Arc<XtnEntry>>,
    pub snapshots: &'a FifoSnapshots,
    /// The attempt belongs to the template's initial search
    pub initial_search: bool,
}

/// Pending template an attempt runs for, with its template lock held
pub(crate) struct Waiter<'a> {
    pub handle: TemplateHandle,
    pub state: &'a mut PendingState,
}

/// Result of one pass over the candidates
#[derive(Debug)]
pub(crate) enum Search {
    Answered(Applied),
    Failed(SpaceError),
    Exhausted {
        conflict: Option<Uid>,
        fifo_rejected: bool,
    },
    /// The pending template was answered or retired by someone else
    Abandoned,
}

/// Who a search runs for
#[derive(Clone, Copy)]
pub(crate) enum Searcher<'a> {
    Direct(Option<&'a Arc<XtnEntry>>),
    Pending(&'a Arc<PendingTemplate>),
}

pub(crate) enum Started {
    Done(OpResult),
    Pending(Arc<PendingTemplate>),
}

enum LockFree {
    Found(EntryData),
    Nothing,
    Fallback,
}

impl EngineInner {
    // ========================================================================
    // Entry points
    // ========================================================================

    /// Run a template, blocking the caller up to its timeout
    pub(crate) fn execute(&self, template: Template) -> OpResult {
        let template = template.normalized();
        self.admit(&template)?;
        match self.start(template, false) {
            Started::Done(result) => result,
            Started::Pending(pending) => self.await_answer(&pending),
        }
    }

    /// Run a template, delivering the answer through a completion
    pub(crate) fn submit(&self, template: Template) -> Arc<Completion<OpResult>> {
        let template = template.normalized();
        if let Err(err) = self.admit(&template) {
            return completed(Err(err));
        }
        match self.start(template, true) {
            Started::Done(result) => completed(result),
            Started::Pending(pending) => Arc::clone(&pending.completion),
        }
    }

    /// Reject malformed templates and run before-filters
    pub(crate) fn admit(&self, template: &Template) -> Result<()> {
        if template.kind == OperationKind::Write {
            return Err(SpaceError::InvalidOperation(
                "writes take a packet, not a template".into(),
            ));
        }
        if template.kind == OperationKind::Update && template.selector.direct_uid().is_none() {
            return Err(SpaceError::InvalidOperation(
                "updates must address one entry by uid".into(),
            ));
        }
        if template.modifiers.backup_only && self.mvcc() {
            return Err(SpaceError::Unsupported(
                "backup-only operations are not defined under mvcc".into(),
            ));
        }
        if template.historical.is_some() && !self.mvcc() {
            return Err(SpaceError::Unsupported(
                "historical reads require mvcc".into(),
            ));
        }
        let ctx = FilterContext {
            xtn: template.xtn,
            template: Some(template),
            ..FilterContext::default()
        };
        self.filters.before(template.kind, &ctx)
    }

    /// Run the after-filters of an answered template
    pub(crate) fn after_filters(&self, template: &Template, result: &OpResult) {
        if let Ok(Some(applied)) = result {
            let ctx = FilterContext {
                xtn: template.xtn,
                template: Some(template),
                entry: Some(&applied.entry),
                ..FilterContext::default()
            };
            self.filters.after(template.kind, &ctx);
        }
    }

    fn await_answer(&self, pending: &Arc<PendingTemplate>) -> OpResult {
        let answer = match pending.deadline {
            Some(deadline) => pending
                .completion
                .wait_timeout(deadline.saturating_duration_since(Instant::now())),
            None => Some(pending.completion.wait()),
        };
        match answer {
            Some(result) => result,
            None => self.expire(pending),
        }
    }

    /// First search; registers the template if it has to wait
    pub(crate) fn start(&self, template: Template, detached: bool) -> Started {
        let mut notices = Notices::new();
        let started = self.start_with(template, detached, &mut notices);
        self.notify(notices);
        started
    }

    fn start_with(&self, template: Template, detached: bool, notices: &mut Notices) -> Started {
        let usage = match template.xtn.map(|id| self.xtns.attach(id)).transpose() {
            Ok(usage) => usage,
            Err(err) => return Started::Done(Err(err)),
        };
        if let Err(err) = self.load_missing(&template) {
            return Started::Done(Err(err));
        }
        match self.lock_free_read(&template) {
            LockFree::Found(entry) => {
                let result = Ok(Some(Applied {
                    entry,
                    previous: None,
                    replication_level: 0,
                }));
                self.after_filters(&template, &result);
                return Started::Done(result);
            }
            LockFree::Nothing => return Started::Done(Ok(None)),
            LockFree::Fallback => {}
        }

        let xtn = usage.as_ref().map(XtnUsage::xtn);
        if !template.may_block() {
            let result = self.run_once(&template, xtn, notices);
            self.after_filters(&template, &result);
            return Started::Done(result);
        }

        let listens_on = if waits_for_arrivals(&template) {
            template.selector.type_name().map(str::to_string)
        } else {
            None
        };
        let pending = self.templates.insert(PendingSpec {
            deadline: Instant::now().checked_add(template.timeout),
            xtn: xtn.cloned(),
            template,
            detached,
            listens_on,
        });
        // registered before detaching so a terminator's cancel pass sees it
        drop(usage);
        debug!(
            template = %pending.handle,
            op = %pending.template.kind,
            timeout_ms = pending.template.timeout.as_millis() as u64,
            "template registered"
        );
        self.initial_search(&pending, notices);
        Started::Pending(pending)
    }

    /// Non-blocking run: search, rescanning on FIFO rejections
    pub(crate) fn run_once(
        &self,
        template: &Template,
        xtn: Option<&Arc<XtnEntry>>,
        notices: &mut Notices,
    ) -> OpResult {
        let mut rescans = 0;
        loop {
            let snapshots = self.fifo_snapshots(template);
            match self.search(template, &snapshots, Searcher::Direct(xtn), notices) {
                Search::Answered(applied) => return Ok(Some(applied)),
                Search::Failed(err) => return Err(err),
                Search::Abandoned => return Err(SpaceError::TemplateDeleted),
                Search::Exhausted {
                    fifo_rejected: true,
                    ..
                } => {
                    if rescans >= self.config.fifo_retry_limit {
                        return Err(SpaceError::FifoRetry);
                    }
                    rescans += 1;
                }
                Search::Exhausted {
                    conflict: Some(uid),
                    ..
                } => {
                    SpaceCounters::bump(&self.counters.timeouts);
                    return Err(SpaceError::Timeout {
                        uid: Some(uid),
                        waited_ms: 0,
                    });
                }
                Search::Exhausted { conflict: None, .. } => return self.nothing_found(template),
            }
        }
    }

    /// Answer of a template that found nothing to act on
    pub(crate) fn nothing_found(&self, template: &Template) -> OpResult {
        match (template.kind, template.selector.direct_uid()) {
            (OperationKind::Update | OperationKind::Change, Some(uid)) => {
                Err(SpaceError::EntryNotInSpace { uid })
            }
            _ => Ok(None),
        }
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Termination numbers of every type a FIFO template can match
    pub(crate) fn fifo_snapshots(&self, template: &Template) -> FifoSnapshots {
        let mut snapshots = FifoSnapshots::default();
        if !template.is_fifo() {
            return snapshots;
        }
        if let Some(type_name) = template.selector.type_name() {
            for name in self.types.assignable(type_name) {
                let seq = self.fifo.current(&name);
                snapshots.insert(name, seq);
            }
        }
        snapshots
    }

    /// One pass over a fresh scan
    pub(crate) fn search(
        &self,
        template: &Template,
        snapshots: &FifoSnapshots,
        searcher: Searcher<'_>,
        notices: &mut Notices,
    ) -> Search {
        let mut conflict = None;
        for candidate in self.scanner().scan(template) {
            let result = match searcher {
                Searcher::Direct(xtn) => {
                    let ctx = AttemptCtx {
                        template,
                        xtn,
                        snapshots,
                        initial_search: true,
                    };
                    self.attempt(&candidate, &ctx, None, notices)
                }
                Searcher::Pending(pending) => {
                    self.attempt_for(pending, &candidate, snapshots, true, notices)
                }
            };
            match result {
                Ok(applied) => return Search::Answered(applied),
                Err(ScanOutcome::Failed(err)) => return Search::Failed(err),
                Err(ScanOutcome::TemplateDeleted) => return Search::Abandoned,
                Err(ScanOutcome::FifoReject) => {
                    return Search::Exhausted {
                        conflict,
                        fifo_rejected: true,
                    }
                }
                Err(ScanOutcome::XtnConflict { uid }) => {
                    conflict.get_or_insert(uid);
                }
                Err(
                    ScanOutcome::NoMatch
                    | ScanOutcome::EntryDeleted
                    | ScanOutcome::DeletedByOwnXtn
                    | ScanOutcome::FifoDeferred,
                ) => {}
            }
        }
        Search::Exhausted {
            conflict,
            fifo_rejected: false,
        }
    }

    /// Attempt a candidate on behalf of a pending template
    ///
    /// Runs under the template lock. A success or failure retires the
    /// template before the lock is released; the caller delivers the answer.
    pub(crate) fn attempt_for(
        &self,
        pending: &Arc<PendingTemplate>,
        candidate: &Candidate,
        snapshots: &FifoSnapshots,
        initial_search: bool,
        notices: &mut Notices,
    ) -> std::result::Result<Applied, ScanOutcome> {
        let mut state = pending.state.lock();
        if state.deleted {
            return Err(ScanOutcome::TemplateDeleted);
        }
        let usage = match pending.template.xtn.map(|id| self.xtns.attach(id)).transpose() {
            Ok(usage) => usage,
            Err(err) => {
                self.retire_locked(pending, &mut state);
                return Err(ScanOutcome::Failed(err));
            }
        };
        let ctx = AttemptCtx {
            template: &pending.template,
            xtn: usage.as_ref().map(XtnUsage::xtn),
            snapshots,
            initial_search,
        };
        let waiter = Waiter {
            handle: pending.handle,
            state: &mut state,
        };
        let result = self.attempt(candidate, &ctx, Some(waiter), notices);
        match &result {
            Ok(_) | Err(ScanOutcome::Failed(_)) => self.retire_locked(pending, &mut state),
            Err(ScanOutcome::XtnConflict { uid }) => state.last_conflict = Some(uid.clone()),
            Err(ScanOutcome::FifoDeferred) => {
                state.pending_fifo.push_back(Arc::clone(&candidate.cell));
            }
            Err(_) => {}
        }
        result
    }

    /// Try to apply `ctx.template` to one candidate
    pub(crate) fn attempt(
        &self,
        candidate: &Candidate,
        ctx: &AttemptCtx<'_>,
        mut waiter: Option<Waiter<'_>>,
        notices: &mut Notices,
    ) -> std::result::Result<Applied, ScanOutcome> {
        let cell = &candidate.cell;
        let template = ctx.template;
        let historical = template.historical.is_some();

        let prematch = !candidate.fully_matched && !historical && !template.modifiers.read_committed;
        let snapshot = if prematch {
            let snapshot = cell.snapshot();
            if !template.selector.matches(&snapshot.data) {
                return Err(ScanOutcome::NoMatch);
            }
            Some(snapshot)
        } else {
            None
        };

        let table = self.xtns.conflict_guard();
        let mut guard = cell.lock();
        if guard.deleted && !historical {
            return Err(ScanOutcome::EntryDeleted);
        }
        self.settle_owners(cell, &mut guard, notices);
        if guard.deleted && !historical {
            return Err(ScanOutcome::EntryDeleted);
        }
        if !historical && guard.locks.entry_writer().is_none() && !guard.locks.is_locked() {
            let now = self.leases.now();
            if self.leases.is_expired(&guard.data, now) {
                self.expire_entry(&mut guard);
                return Err(ScanOutcome::EntryDeleted);
            }
        }

        let examined = match &snapshot {
            Some(snapshot) => &snapshot.data,
            None => &guard.data,
        };
        let resolved = match resolve_visible(&guard, template, examined, self.mvcc())? {
            Visibility::Visible(resolved) => resolved,
            Visibility::Absent => return Err(ScanOutcome::EntryDeleted),
        };
        let rematch = !candidate.fully_matched && (!prematch || resolved.needs_rematch);
        if rematch && !template.selector.matches(&resolved.data) {
            return Err(ScanOutcome::NoMatch);
        }

        if !historical {
            let view = if self.mvcc() {
                ConflictView::mvcc(&guard.locks, guard.deleted, resolved.dirty)
            } else {
                ConflictView::new(&guard.locks, guard.deleted)
            };
            match check_conflict(&view, template) {
                ConflictVerdict::NoConflict => {}
                ConflictVerdict::EntryDeleted => return Err(ScanOutcome::EntryDeleted),
                ConflictVerdict::DeletedByOwnXtn => return Err(ScanOutcome::DeletedByOwnXtn),
                ConflictVerdict::XtnConflict => {
                    SpaceCounters::bump(&self.counters.conflicts);
                    if let Some(waiter) = waiter.as_mut() {
                        guard.waiting_mut().insert(waiter.handle);
                        waiter.state.waiting_on.insert(cell.uid().clone());
                    }
                    return Err(ScanOutcome::XtnConflict {
                        uid: cell.uid().clone(),
                    });
                }
            }
        }

        if template.is_fifo() {
            let type_name = cell.type_name();
            let thread = FifoThreadContext {
                snapshot: ctx
                    .snapshots
                    .get(type_name)
                    .copied()
                    .unwrap_or_else(|| self.fifo.current(type_name)),
                initial_search: ctx.initial_search,
                initial_search_in_progress: waiter
                    .as_ref()
                    .is_some_and(|w| w.state.initial_search_in_progress),
            };
            match check_fifo_validity(&guard.locks.fifo, template, &thread) {
                FifoVerdict::Valid => {}
                FifoVerdict::Reject => {
                    SpaceCounters::bump(&self.counters.fifo_rejects);
                    return Err(ScanOutcome::FifoReject);
                }
                FifoVerdict::Defer => return Err(ScanOutcome::FifoDeferred),
            }
        }

        // verdict is fixed; the entry lock alone covers the mutation and its I/O
        drop(table);
        self.apply(cell, &mut guard, resolved, template, ctx.xtn, notices)
    }

    // ========================================================================
    // Fast paths
    // ========================================================================

    /// Answer a plain non-transactional read from published snapshots
    ///
    /// Falls back to the locked path whenever a matching entry is locked,
    /// dirty, expired or changed while it was being examined.
    fn lock_free_read(&self, template: &Template) -> LockFree {
        let eligible = template.kind == OperationKind::Read
            && template.xtn.is_none()
            && !template.may_block()
            && template.historical.is_none()
            && !template.is_fifo()
            && !template.modifiers.read_committed;
        if !eligible {
            return LockFree::Fallback;
        }
        let now = self.leases.now();
        for candidate in self.scanner().scan(template) {
            let stamp = candidate.cell.stamp();
            let snapshot = candidate.cell.snapshot();
            if snapshot.deleted {
                continue;
            }
            if !candidate.fully_matched && !template.selector.matches(&snapshot.data) {
                continue;
            }
            if snapshot.write_locked || snapshot.dirty || self.leases.is_expired(&snapshot.data, now)
            {
                return LockFree::Fallback;
            }
            if candidate.cell.stamp() != stamp {
                return LockFree::Fallback;
            }
            SpaceCounters::bump(&self.counters.reads);
            SpaceCounters::bump(&self.counters.lock_free_reads);
            return LockFree::Found(snapshot.data.clone());
        }
        LockFree::Nothing
    }

    /// Bring a directly addressed entry in from persistence
    fn load_missing(&self, template: &Template) -> Result<()> {
        if self.config.all_in_cache {
            return Ok(());
        }
        let Some(uid) = template.selector.direct_uid() else {
            return Ok(());
        };
        if self.store.contains(&uid) {
            return Ok(());
        }
        let Some(data) = self.persistence.get(&uid)? else {
            return Ok(());
        };
        if let Selector::ById { type_name, .. } = &template.selector {
            if !self.types.is_assignable(&data.type_name, type_name) {
                return Ok(());
            }
        }
        let descriptor = self.types.get_or_introduce(&data.type_name);
        let shard = self.store.shard(&descriptor.name, &descriptor.indexes);
        let mut holder = EntryHolder::new(data.clone(), EntryLockState::new(), false);
        if self.mvcc() {
            let mut shell = MvccShell::new();
            shell.commit(data, 0);
            holder = holder.with_mvcc(shell);
        }
        if self.store.insert(holder, &shard).is_err() {
            debug!(uid = %uid, "entry loaded concurrently");
        }
        Ok(())
    }
}

/// Templates that wait for new entries, not just for locks to clear
fn waits_for_arrivals(template: &Template) -> bool {
    matches!(
        template.kind,
        OperationKind::Read | OperationKind::Take | OperationKind::ReadExclusive
    )
}

fn completed(result: OpResult) -> Arc<Completion<OpResult>> {
    let completion = Arc::new(Completion::new());
    completion.complete(result);
    completion
}
