//! Scan control flow and operation results

use gridspace_core::{EntryData, SpaceError, Timestamp, Uid};

/// Why a candidate did not produce an answer
///
/// These are scan signals, not errors: the executor decides per signal
/// whether to move on, wait, rescan or fail.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Candidate does not match the template
    NoMatch,
    /// Candidate is gone (taken, expired or never committed)
    EntryDeleted,
    /// Another transaction holds a conflicting lock
    XtnConflict {
        /// Locked entry
        uid: Uid,
    },
    /// The template's own transaction took the entry
    DeletedByOwnXtn,
    /// A FIFO termination overtook the scan's snapshot
    FifoReject,
    /// The template's initial FIFO search still runs; queued for it
    FifoDeferred,
    /// The template was answered or retired meanwhile
    TemplateDeleted,
    /// The operation failed
    Failed(SpaceError),
}

impl From<SpaceError> for ScanOutcome {
    fn from(err: SpaceError) -> Self {
        ScanOutcome::Failed(err)
    }
}

/// Entry an operation acted on
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Content returned to the caller (new content for update/change)
    pub entry: EntryData,
    /// Content before an update/change
    pub previous: Option<EntryData>,
    /// Consistency level reported by replication (0 inside a transaction)
    pub replication_level: u32,
}

/// Answer of a template operation
pub type OpResult = Result<Option<Applied>, SpaceError>;

/// Result of a write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    /// Uid of the written entry
    pub uid: Uid,
    /// Version after the write
    pub version: u64,
    /// Absolute expiration
    pub expiration: Timestamp,
    /// Consistency level reported by replication
    pub replication_level: u32,
    /// The write replaced an entry its own transaction had taken
    pub fused_update: bool,
}

/// Result of an update or change
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    /// New content
    pub entry: EntryData,
    /// Content before the operation
    pub previous: EntryData,
    /// Consistency level reported by replication
    pub replication_level: u32,
}

impl UpdateResult {
    pub(crate) fn from_applied(applied: Applied) -> Self {
        let previous = applied.previous.unwrap_or_else(|| applied.entry.clone());
        Self {
            entry: applied.entry,
            previous,
            replication_level: applied.replication_level,
        }
    }
}

/// Result of update-or-write
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOrWriteResult {
    /// A new entry was written
    Written(WriteResult),
    /// An existing entry was updated
    Updated(UpdateResult),
}

impl UpdateOrWriteResult {
    /// Version after the operation
    pub fn version(&self) -> u64 {
        match self {
            UpdateOrWriteResult::Written(w) => w.version,
            UpdateOrWriteResult::Updated(u) => u.entry.version,
        }
    }

    /// Whether an entry was written
    pub fn is_write(&self) -> bool {
        matches!(self, UpdateOrWriteResult::Written(_))
    }
}
