//! Collaborators the grid core consumes
//!
//! The core never talks to disks, networks or coordination services
//! directly. Storage, replication, leases, MVCC generation numbering and
//! interceptors are injected through these traits; in-process defaults live
//! in [`crate::local`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::entry::{EntryData, EntryPacket};
use crate::error::Result;
use crate::mutation::Mutation;
use crate::operation::OperationKind;
use crate::template::Template;
use crate::types::{Generation, Timestamp, Uid, XtnId};

/// Persistence adapter for entries
pub trait EntryPersistence: Send + Sync {
    /// Load an entry by uid
    fn get(&self, uid: &Uid) -> Result<Option<EntryData>>;

    /// Store (insert or replace) an entry
    fn put(&self, entry: &EntryData) -> Result<()>;

    /// Remove an entry
    fn remove(&self, uid: &Uid) -> Result<()>;

    /// Apply a batch of puts and removes
    fn apply_batch(&self, puts: &[EntryData], removes: &[Uid]) -> Result<()> {
        for entry in puts {
            self.put(entry)?;
        }
        for uid in removes {
            self.remove(uid)?;
        }
        Ok(())
    }
}

/// Replication layer hand-off
pub trait ReplicationSink: Send + Sync {
    /// Submit one mutation; returns the consistency level reached
    fn submit(&self, mutation: &Mutation) -> Result<u32>;
}

/// Lease clock and expiration rules
pub trait LeaseOracle: Send + Sync {
    /// Current time in milliseconds
    fn now(&self) -> Timestamp;

    /// Absolute expiration for a relative lease (`None` = forever)
    fn to_absolute(&self, lease: Option<Duration>, now: Timestamp) -> Timestamp;

    /// Whether an entry has expired at `now`
    fn is_expired(&self, entry: &EntryData, now: Timestamp) -> bool {
        entry.expiration <= now
    }
}

/// Snapshot of the distributed generation counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationState {
    /// Next generation to be handed out
    pub next: Generation,
    /// Highest completed generation
    pub completed: Generation,
    /// Generations at or below `completed` that have not completed
    pub uncompleted: BTreeSet<Generation>,
}

impl GenerationState {
    /// Whether data created in `generation` is visible in this snapshot
    pub fn is_visible(&self, generation: Generation) -> bool {
        generation <= self.completed && !self.uncompleted.contains(&generation)
    }
}

/// MVCC generation numbering, backed by an external coordination service
pub trait GenerationCoordinator: Send + Sync {
    /// Allocate the next generation
    fn next_generation(&self) -> Result<Generation>;

    /// Mark a generation as completed (committed or abandoned)
    fn mark_completed(&self, generation: Generation) -> Result<()>;

    /// Current counter state
    fn state(&self) -> Result<GenerationState>;
}

/// Data handed to filters
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterContext<'a> {
    /// Owning transaction
    pub xtn: Option<XtnId>,
    /// Template of a matching operation
    pub template: Option<&'a Template>,
    /// Packet of a write/update
    pub packet: Option<&'a EntryPacket>,
    /// Entry the operation produced or consumed (after-hooks only)
    pub entry: Option<&'a EntryData>,
}

/// Before/after interceptor keyed by operation kind
///
/// An error from `before` aborts the operation; an error from `after` is
/// logged and ignored.
pub trait OperationFilter: Send + Sync {
    /// Invoked before the operation runs
    fn before(&self, _op: OperationKind, _ctx: &FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Invoked after the operation succeeded
    fn after(&self, _op: OperationKind, _ctx: &FilterContext<'_>) -> Result<()> {
        Ok(())
    }
}
