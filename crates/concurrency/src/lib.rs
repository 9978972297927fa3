//! Concurrency layer for the grid core
//!
//! This crate decides who may touch an entry and when:
//! - XtnEntry: transaction status state machine (CAS transitions)
//! - XtnManager: active transaction table with attach/terminate protocol
//! - EntryLockState: write/read lock owners and FIFO stamps of one entry
//! - Conflict resolver: pure (entry, template) classification
//! - FIFO sequencer: per-type termination ordering

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod fifo;
pub mod lock_state;
pub mod manager;
pub mod xtn;

pub use conflict::{check_conflict, status_verdict, ConflictVerdict, ConflictView};
pub use fifo::{check_fifo_validity, FifoSequencer, FifoThreadContext, FifoVerdict};
pub use lock_state::{EntryLockState, FifoStamps, Released};
pub use manager::{XtnManager, XtnUsage};
pub use xtn::{TerminationMarks, XtnEntry, XtnOutcome, XtnStatus};
