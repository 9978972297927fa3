//! Error taxonomy of the grid core
//!
//! Every operation either succeeds, reports "no match" through its normal
//! return value, or fails with a [`SpaceError`]. Scan-internal signals
//! (entry deleted, transaction conflict, FIFO reject) are not errors; they
//! travel as `ScanOutcome` inside the executor and only surface here once
//! they become the final verdict of an operation.

use thiserror::Error;

use crate::types::{Generation, Uid, XtnId};

/// Classification of a [`SpaceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; retrying or blocking may succeed
    Conflict,
    /// Terminal for this attempt; nothing matched
    NotFound,
    /// Terminal; expected and actual versions differ
    VersionConflict,
    /// Terminal; configuration-gated request validation failed
    Protective,
    /// Terminal; the transaction is unknown or not active
    TransactionState,
    /// Terminal; internal, storage or collaborator failure
    Internal,
}

/// All errors surfaced by the grid core
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SpaceError {
    /// Update/change by uid found nothing
    #[error("entry not in space: {uid}")]
    EntryNotInSpace {
        /// The missing uid
        uid: Uid,
    },

    /// Write found an existing live entry with the same uid
    #[error("entry already in space: {uid}")]
    EntryAlreadyInSpace {
        /// The existing uid
        uid: Uid,
    },

    /// Optimistic-locking version check failed
    #[error("version conflict on {uid}: expected {expected}, actual {actual}")]
    VersionConflict {
        /// Entry uid
        uid: Uid,
        /// Version supplied by the caller
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// A mutation targeted an MVCC generation other than the active one
    #[error("mvcc modify conflict on {uid}: conflicting generation {conflicting:?}, active generation {active:?}")]
    MvccModifyConflict {
        /// Entry uid
        uid: Uid,
        /// Generation the operation tried to modify (`None` = uncommitted)
        conflicting: Option<Generation>,
        /// Currently active generation (`None` = uncommitted)
        active: Option<Generation>,
    },

    /// Request rejected by a protective check
    #[error("protective violation on type {type_name}: {reason}")]
    ProtectiveViolation {
        /// Type of the rejected entry
        type_name: String,
        /// What was missing or invalid
        reason: String,
    },

    /// Transaction exists but is not in a state that accepts the request
    #[error("transaction {xtn} not active ({status})")]
    TransactionNotActive {
        /// Transaction id
        xtn: XtnId,
        /// Observed status
        status: String,
    },

    /// Transaction id is not in the transaction table
    #[error("unknown transaction {xtn}")]
    UnknownTransaction {
        /// Transaction id
        xtn: XtnId,
    },

    /// Operation gave up while matching entries were still locked
    #[error("operation timed out after {waited_ms}ms waiting for locked entry {uid:?}")]
    Timeout {
        /// One of the entries that remained locked
        uid: Option<Uid>,
        /// Milliseconds spent waiting (0 for no-wait operations)
        waited_ms: u64,
    },

    /// FIFO ordering could not be established; retry the operation
    #[error("fifo ordering conflict, operation must be retried")]
    FifoRetry,

    /// The template was already answered or retired
    #[error("template already answered or retired")]
    TemplateDeleted,

    /// A change mutator failed; the change was not applied
    #[error("change failed on field {field}: {reason}")]
    ChangeFailed {
        /// Field of the failing mutator
        field: String,
        /// Why it failed
        reason: String,
    },

    /// A before-filter rejected the operation
    #[error("operation {operation} rejected by filter: {reason}")]
    FilterRejected {
        /// Operation kind name
        operation: String,
        /// Filter message
        reason: String,
    },

    /// The request is malformed for the operation
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The request uses a combination whose semantics are not defined
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Persistence collaborator failed
    #[error("storage error: {message}")]
    Storage {
        /// Error message from the storage adapter
        message: String,
    },

    /// Replication collaborator failed
    #[error("replication error: {message}")]
    Replication {
        /// Error message from the replication sink
        message: String,
    },

    /// Bug or invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for grid core operations
pub type Result<T> = std::result::Result<T, SpaceError>;

impl SpaceError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpaceError::Timeout { .. } | SpaceError::FifoRetry => ErrorKind::Conflict,
            SpaceError::EntryNotInSpace { .. } | SpaceError::TemplateDeleted => ErrorKind::NotFound,
            SpaceError::VersionConflict { .. }
            | SpaceError::EntryAlreadyInSpace { .. }
            | SpaceError::MvccModifyConflict { .. } => ErrorKind::VersionConflict,
            SpaceError::ProtectiveViolation { .. }
            | SpaceError::InvalidOperation(_)
            | SpaceError::Unsupported(_)
            | SpaceError::ChangeFailed { .. }
            | SpaceError::FilterRejected { .. } => ErrorKind::Protective,
            SpaceError::TransactionNotActive { .. } | SpaceError::UnknownTransaction { .. } => {
                ErrorKind::TransactionState
            }
            SpaceError::Storage { .. } | SpaceError::Replication { .. } | SpaceError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retryable errors may succeed on retry once locks are released.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::VersionConflict
        )
    }

    /// Check if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Wrap a storage adapter failure
    pub fn storage(message: impl Into<String>) -> Self {
        SpaceError::Storage {
            message: message.into(),
        }
    }
}
