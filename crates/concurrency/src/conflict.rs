//! Conflict resolver
//!
//! Classifies an (entry, template) pairing from the entry's lock fields, the
//! lock holders' statuses and the template's isolation modifiers. Pure: it
//! borrows the lock state for the duration of the call and mutates nothing.
//!
//! The caller must hold the entry lock and the transaction table read lock
//! (see [`crate::XtnManager::conflict_guard`]) so holder statuses cannot move
//! underneath the verdict.

use gridspace_core::{OperationKind, Template};
use tracing::debug;

use crate::lock_state::EntryLockState;
use crate::xtn::XtnOutcome;

/// Result of a conflict check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictVerdict {
    /// The operation may proceed on this entry
    NoConflict,
    /// Another transaction's undecided lock is in the way
    XtnConflict,
    /// The entry is gone (or about to be) for everyone
    EntryDeleted,
    /// The requesting transaction already took this entry
    DeletedByOwnXtn,
}

/// Borrowed view of one entry for conflict classification
#[derive(Debug, Clone, Copy)]
pub struct ConflictView<'a> {
    /// Lock fields
    pub locks: &'a EntryLockState,
    /// Terminal deletion flag
    pub deleted: bool,
    /// Visibility is resolved through MVCC generations
    pub mvcc: bool,
    /// The generation a read-committed reader resolved is uncommitted
    pub visible_is_dirty: bool,
}

impl<'a> ConflictView<'a> {
    /// View of a non-MVCC entry
    pub fn new(locks: &'a EntryLockState, deleted: bool) -> Self {
        Self {
            locks,
            deleted,
            mvcc: false,
            visible_is_dirty: false,
        }
    }

    /// View of an MVCC entry
    pub fn mvcc(locks: &'a EntryLockState, deleted: bool, visible_is_dirty: bool) -> Self {
        Self {
            locks,
            deleted,
            mvcc: true,
            visible_is_dirty,
        }
    }
}

/// Verdict for a write-lock holder, keyed by its lock kind and outcome
pub fn status_verdict(holder: OperationKind, outcome: XtnOutcome) -> ConflictVerdict {
    use ConflictVerdict::*;
    match (holder, outcome) {
        (OperationKind::Take | OperationKind::TakeIfExists, XtnOutcome::RolledBack) => NoConflict,
        (OperationKind::Take | OperationKind::TakeIfExists, XtnOutcome::Committed) => EntryDeleted,
        (OperationKind::Write, XtnOutcome::Committed) => NoConflict,
        (
            OperationKind::Update
            | OperationKind::Change
            | OperationKind::Read
            | OperationKind::ReadIfExists
            | OperationKind::ReadExclusive,
            XtnOutcome::Committed | XtnOutcome::RolledBack,
        ) => NoConflict,
        _ => XtnConflict,
    }
}

/// Classify `template` against the entry in `view`
pub fn check_conflict(view: &ConflictView<'_>, template: &Template) -> ConflictVerdict {
    if view.deleted {
        return ConflictVerdict::EntryDeleted;
    }
    let verdict = if template.kind.is_write_intent() {
        check_write_intent(view, template)
    } else {
        check_read(view, template)
    };
    if verdict != ConflictVerdict::NoConflict {
        debug!(op = ?template.kind, verdict = ?verdict, "conflict check");
    }
    verdict
}

fn check_read(view: &ConflictView<'_>, template: &Template) -> ConflictVerdict {
    let (owner, holder) = match (view.locks.write_owner(), view.locks.write_lock_kind()) {
        (Some(owner), Some(kind)) => (owner, kind),
        _ => return ConflictVerdict::NoConflict,
    };

    if template.xtn == Some(owner.id()) {
        return if holder.is_take() {
            ConflictVerdict::DeletedByOwnXtn
        } else {
            ConflictVerdict::NoConflict
        };
    }

    let outcome = owner.outcome();
    let modifiers = template.modifiers;
    if modifiers.dirty_read {
        return if holder.is_take() {
            status_verdict(holder, outcome)
        } else {
            ConflictVerdict::NoConflict
        };
    }
    if modifiers.read_committed {
        if view.mvcc {
            return if view.visible_is_dirty {
                ConflictVerdict::XtnConflict
            } else {
                ConflictVerdict::NoConflict
            };
        }
        return match outcome {
            // an uncommitted new entry has no committed value to show
            XtnOutcome::Uncertain if holder == OperationKind::Write => ConflictVerdict::XtnConflict,
            XtnOutcome::Uncertain => ConflictVerdict::NoConflict,
            _ => status_verdict(holder, outcome),
        };
    }
    status_verdict(holder, outcome)
}

fn check_write_intent(view: &ConflictView<'_>, template: &Template) -> ConflictVerdict {
    if let (Some(owner), Some(holder)) = (view.locks.write_owner(), view.locks.write_lock_kind()) {
        if template.xtn == Some(owner.id()) {
            if holder.is_take() {
                let resurrects = template.update_or_write
                    && matches!(template.kind, OperationKind::Update | OperationKind::Change);
                return if resurrects {
                    ConflictVerdict::NoConflict
                } else {
                    ConflictVerdict::DeletedByOwnXtn
                };
            }
        } else {
            let verdict = status_verdict(holder, owner.outcome());
            if verdict != ConflictVerdict::NoConflict {
                return verdict;
            }
        }
    }

    let blocked_by_reader = view.locks.read_owners().iter().any(|reader| {
        template.xtn != Some(reader.id()) && reader.outcome() == XtnOutcome::Uncertain
    });
    if blocked_by_reader {
        ConflictVerdict::XtnConflict
    } else {
        ConflictVerdict::NoConflict
    }
}
