//! Space engine for the grid core
//!
//! This crate runs operations against the entry store:
//! - Executor: read/take/update/change templates and the attempt protocol
//! - Writes, update-or-write and batch operations
//! - Pending templates, the notifier and the template reaper
//! - Transaction termination (one- and two-phase) and stale-owner settlement
//! - Persistence and replication hand-off
//! - Operation filters and counters

#![warn(missing_docs)]
#![warn(clippy::all)]

mod apply;
mod batch;
pub mod completion;
mod durability;
mod engine;
mod executor;
pub mod filters;
mod notifier;
pub mod outcome;
mod reaper;
pub mod stats;
mod templates;
mod transaction;
mod write;

pub use completion::{Completion, CompletionFuture};
pub use engine::{Collaborators, SpaceEngine};
pub use filters::FilterChain;
pub use outcome::{Applied, OpResult, ScanOutcome, UpdateOrWriteResult, UpdateResult, WriteResult};
pub use stats::SpaceStats;
