//! FIFO sequencer
//!
//! Each FIFO type has a termination sequence number that advances whenever a
//! transaction holding locks on entries of that type commits or rolls back.
//! Those entries are stamped with the new number. A FIFO scan snapshots the
//! number when it starts and rejects candidates stamped later: a transaction
//! serialized after the scan began already touched them.

use dashmap::DashMap;

use gridspace_core::Template;

use crate::lock_state::FifoStamps;

/// Per-type termination sequence numbers
#[derive(Debug, Default)]
pub struct FifoSequencer {
    sequences: DashMap<String, u64>,
}

impl FifoSequencer {
    /// All types start at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current termination number of a type
    pub fn current(&self, type_name: &str) -> u64 {
        self.sequences.get(type_name).map(|s| *s).unwrap_or(0)
    }

    /// Advance a type's number and return the new value
    pub fn advance(&self, type_name: &str) -> u64 {
        let mut seq = self.sequences.entry(type_name.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }
}

/// Where the checking thread stands relative to the template's searches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoThreadContext {
    /// Termination number snapshotted when the scan began
    pub snapshot: u64,
    /// This thread runs the template's initial search
    pub initial_search: bool,
    /// The template's initial search has not finished yet
    pub initial_search_in_progress: bool,
}

impl FifoThreadContext {
    /// Context of the thread running a template's initial search
    pub fn initial(snapshot: u64) -> Self {
        Self {
            snapshot,
            initial_search: true,
            initial_search_in_progress: true,
        }
    }
}

/// FIFO validity of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoVerdict {
    /// In order
    Valid,
    /// Touched by a later termination; rescan
    Reject,
    /// Hand the candidate to the initial searcher and back off
    Defer,
}

/// Check a candidate's stamps against the scan snapshot
pub fn check_fifo_validity(
    stamps: &FifoStamps,
    template: &Template,
    ctx: &FifoThreadContext,
) -> FifoVerdict {
    if !ctx.initial_search && ctx.initial_search_in_progress {
        return FifoVerdict::Defer;
    }
    let later = |stamp: u64| stamp > ctx.snapshot;
    if template.has_isolation_override() {
        if later(stamps.entry_write) {
            return FifoVerdict::Reject;
        }
        return FifoVerdict::Valid;
    }
    if later(stamps.write_lock_released) {
        return FifoVerdict::Reject;
    }
    if template.kind.is_write_intent() && later(stamps.read_lock_released) {
        return FifoVerdict::Reject;
    }
    FifoVerdict::Valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridspace_core::{Modifiers, Selector};

    fn fifo_read() -> Template {
        Template::read(Selector::all_of("Queue")).with_modifiers(Modifiers::new().fifo())
    }

    fn fifo_take() -> Template {
        Template::take(Selector::all_of("Queue")).with_modifiers(Modifiers::new().fifo())
    }

    #[test]
    fn test_sequencer_is_per_type() {
        let seq = FifoSequencer::new();
        assert_eq!(seq.current("Queue"), 0);
        assert_eq!(seq.advance("Queue"), 1);
        assert_eq!(seq.advance("Queue"), 2);
        assert_eq!(seq.current("Other"), 0);
    }

    #[test]
    fn test_write_release_after_snapshot_rejects() {
        let stamps = FifoStamps {
            write_lock_released: 4,
            ..FifoStamps::default()
        };
        assert_eq!(
            check_fifo_validity(&stamps, &fifo_read(), &FifoThreadContext::initial(3)),
            FifoVerdict::Reject
        );
        assert_eq!(
            check_fifo_validity(&stamps, &fifo_read(), &FifoThreadContext::initial(4)),
            FifoVerdict::Valid
        );
    }

    #[test]
    fn test_read_release_only_checked_for_write_intent() {
        let stamps = FifoStamps {
            read_lock_released: 7,
            ..FifoStamps::default()
        };
        let ctx = FifoThreadContext::initial(2);
        assert_eq!(check_fifo_validity(&stamps, &fifo_read(), &ctx), FifoVerdict::Valid);
        assert_eq!(check_fifo_validity(&stamps, &fifo_take(), &ctx), FifoVerdict::Reject);
    }

    #[test]
    fn test_isolation_override_checks_entry_write() {
        let stamps = FifoStamps {
            write_lock_released: 9,
            read_lock_released: 9,
            entry_write: 1,
        };
        let t = fifo_read().with_modifiers(Modifiers::new().fifo().read_committed());
        let ctx = FifoThreadContext::initial(2);
        assert_eq!(check_fifo_validity(&stamps, &t, &ctx), FifoVerdict::Valid);
    }

    #[test]
    fn test_notifier_defers_to_initial_search() {
        let ctx = FifoThreadContext {
            snapshot: 10,
            initial_search: false,
            initial_search_in_progress: true,
        };
        assert_eq!(
            check_fifo_validity(&FifoStamps::default(), &fifo_take(), &ctx),
            FifoVerdict::Defer
        );
    }
}
