//! Operation kinds and request modifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a space operation
///
/// Also recorded as the "locking operation" of an entry's write-lock owner,
/// which is what the conflict resolver's status table is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Insert a new entry
    Write,
    /// Read a matching entry, waiting for one to appear
    Read,
    /// Read a matching entry, waiting only while a match is locked
    ReadIfExists,
    /// Transactional read holding an exclusive lock
    ReadExclusive,
    /// Remove a matching entry, waiting for one to appear
    Take,
    /// Remove a matching entry, waiting only while a match is locked
    TakeIfExists,
    /// Replace the fields of an entry by uid
    Update,
    /// Apply mutators to an existing entry
    Change,
}

impl OperationKind {
    /// Take or take-if-exists
    pub fn is_take(self) -> bool {
        matches!(self, OperationKind::Take | OperationKind::TakeIfExists)
    }

    /// Any read flavour
    pub fn is_read(self) -> bool {
        matches!(
            self,
            OperationKind::Read | OperationKind::ReadIfExists | OperationKind::ReadExclusive
        )
    }

    /// Operations that need exclusive ownership of the entry
    pub fn is_write_intent(self) -> bool {
        matches!(
            self,
            OperationKind::Take
                | OperationKind::TakeIfExists
                | OperationKind::Update
                | OperationKind::Change
                | OperationKind::ReadExclusive
        )
    }

    /// Operations that change entry data or existence
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            OperationKind::Write
                | OperationKind::Take
                | OperationKind::TakeIfExists
                | OperationKind::Update
                | OperationKind::Change
        )
    }

    /// "If exists" flavours only wait while a matching entry is locked
    pub fn is_if_exists(self) -> bool {
        matches!(self, OperationKind::ReadIfExists | OperationKind::TakeIfExists)
    }

    /// Update-like lock holders (update, change and the read flavours)
    ///
    /// These share one row of the conflict status table.
    pub fn is_update_or_read(self) -> bool {
        matches!(
            self,
            OperationKind::Update
                | OperationKind::Change
                | OperationKind::Read
                | OperationKind::ReadIfExists
                | OperationKind::ReadExclusive
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Write => "write",
            OperationKind::Read => "read",
            OperationKind::ReadIfExists => "readIfExists",
            OperationKind::ReadExclusive => "readExclusive",
            OperationKind::Take => "take",
            OperationKind::TakeIfExists => "takeIfExists",
            OperationKind::Update => "update",
            OperationKind::Change => "change",
        };
        f.write_str(name)
    }
}

/// Request modifiers
///
/// # Example
///
/// ```
/// use gridspace_core::operation::Modifiers;
///
/// let m = Modifiers::new().read_committed().fifo();
/// assert!(m.read_committed && m.fifo);
/// assert!(!m.dirty_read);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    /// Reads may see uncommitted data of other transactions
    pub dirty_read: bool,
    /// Reads see only the latest committed value
    pub read_committed: bool,
    /// Transactional reads hold an exclusive lock
    pub exclusive_read_lock: bool,
    /// Match in FIFO order
    pub fifo: bool,
    /// Update keeps the entry's current expiration
    pub preserve_lease: bool,
    /// Applied to backup only; suppresses notifications
    pub backup_only: bool,
}

impl Modifiers {
    /// No modifiers
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable dirty reads
    pub fn dirty_read(mut self) -> Self {
        self.dirty_read = true;
        self
    }

    /// Enable read-committed isolation
    pub fn read_committed(mut self) -> Self {
        self.read_committed = true;
        self
    }

    /// Enable exclusive read locks
    pub fn exclusive_read_lock(mut self) -> Self {
        self.exclusive_read_lock = true;
        self
    }

    /// Enable FIFO matching
    pub fn fifo(mut self) -> Self {
        self.fifo = true;
        self
    }

    /// Keep the current lease on update
    pub fn preserve_lease(mut self) -> Self {
        self.preserve_lease = true;
        self
    }

    /// Mark as backup-only
    pub fn backup_only(mut self) -> Self {
        self.backup_only = true;
        self
    }
}

/// Where an update originates, selecting its version policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSource {
    /// Local client update
    #[default]
    Local,
    /// Replicated from a primary; stale versions are ignored
    Replicated,
    /// Gateway (cross-site) update; must match the previously known version
    Gateway {
        /// Version the remote site last saw
        previous_version: u64,
    },
    /// Local-cache refresh; version must not go backwards
    LocalCache,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert!(OperationKind::TakeIfExists.is_take());
        assert!(OperationKind::ReadExclusive.is_write_intent());
        assert!(!OperationKind::ReadExclusive.is_mutating());
        assert!(OperationKind::Write.is_mutating());
        assert!(!OperationKind::Write.is_write_intent());
        assert!(OperationKind::Change.is_update_or_read());
        assert!(!OperationKind::Take.is_update_or_read());
        assert!(OperationKind::ReadIfExists.is_if_exists());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(OperationKind::TakeIfExists.to_string(), "takeIfExists");
        assert_eq!(OperationKind::Update.to_string(), "update");
    }
}
