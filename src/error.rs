//! Unified error type for gridspace.
//!
//! Wraps the core error taxonomy and presents a stable interface to users.

use thiserror::Error;

use gridspace_core::{SpaceError, Uid};

/// All gridspace errors.
///
/// This is the canonical error type of the public API. Internal variants are
/// folded into a small set of categories.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Entry (or template) not found
    #[error("not found: {0}")]
    NotFound(String),

    /// An entry with the same uid is already in the space
    #[error("already exists: {0}")]
    AlreadyExists(Uid),

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

    /// Conflicting concurrent access (MVCC generation clash, FIFO reordering)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Gave up waiting for a locked entry
    #[error("timeout after {waited_ms}ms")]
    Timeout {
        /// One entry that stayed locked
        uid: Option<Uid>,
        /// Milliseconds waited
        waited_ms: u64,
    },

    /// Transaction unknown or not in a usable state
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Request rejected (protective check, filter, bad change, malformed template)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Combination of options without defined semantics
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Persistence failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Replication failure
    #[error("replication error: {0}")]
    Replication(String),

    /// Internal error (bug or invariant violation)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for gridspace operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is retryable.
    ///
    /// Retryable errors may succeed once the conflicting locks are released.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Timeout { .. })
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_)
                | Error::Timeout { .. }
                | Error::VersionConflict { .. }
                | Error::AlreadyExists(_)
        )
    }

    /// Check if this is a serious/unrecoverable error.
    pub fn is_serious(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Replication(_) | Error::Internal(_)
        )
    }
}

impl From<SpaceError> for Error {
    fn from(e: SpaceError) -> Self {
        match e {
            SpaceError::EntryNotInSpace { uid } => Error::NotFound(format!("entry {}", uid)),
            SpaceError::TemplateDeleted => Error::NotFound("template".to_string()),
            SpaceError::EntryAlreadyInSpace { uid } => Error::AlreadyExists(uid),
            SpaceError::VersionConflict {
                uid,
                expected,
                actual,
            } => Error::VersionConflict {
                uid,
                expected,
                actual,
            },
            SpaceError::MvccModifyConflict {
                uid,
                conflicting,
                active,
            } => Error::Conflict(format!(
                "mvcc generation {:?} of {} is not the active generation {:?}",
                conflicting, uid, active
            )),
            SpaceError::FifoRetry => Error::Conflict("fifo ordering, retry".to_string()),
            SpaceError::Timeout { uid, waited_ms } => Error::Timeout { uid, waited_ms },
            SpaceError::TransactionNotActive { xtn, status } => {
                Error::Transaction(format!("{} not active ({})", xtn, status))
            }
            SpaceError::UnknownTransaction { xtn } => {
                Error::Transaction(format!("unknown transaction {}", xtn))
            }
            SpaceError::ProtectiveViolation { type_name, reason } => {
                Error::ConstraintViolation(format!("{}: {}", type_name, reason))
            }
            SpaceError::ChangeFailed { field, reason } => {
                Error::ConstraintViolation(format!("change of {} failed: {}", field, reason))
            }
            SpaceError::FilterRejected { operation, reason } => {
                Error::ConstraintViolation(format!("{} rejected: {}", operation, reason))
            }
            SpaceError::InvalidOperation(msg) => Error::ConstraintViolation(msg),
            SpaceError::Unsupported(msg) => Error::Unsupported(msg),
            SpaceError::Storage { message } => Error::Storage(message),
            SpaceError::Replication { message } => Error::Replication(message),
            SpaceError::Internal(msg) => Error::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridspace_core::XtnId;

    #[test]
    fn test_timeout_is_retryable() {
        let err: Error = SpaceError::Timeout {
            uid: Some(Uid::new("a")),
            waited_ms: 10,
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.is_conflict());
        assert!(!err.is_serious());
    }

    #[test]
    fn test_version_conflict_keeps_versions() {
        let err: Error = SpaceError::VersionConflict {
            uid: Uid::new("a"),
            expected: 1,
            actual: 3,
        }
        .into();
        assert_eq!(
            err,
            Error::VersionConflict {
                uid: Uid::new("a"),
                expected: 1,
                actual: 3
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transaction_errors_fold() {
        let err: Error = SpaceError::UnknownTransaction { xtn: XtnId(7) }.into();
        assert!(matches!(err, Error::Transaction(_)));
    }

    #[test]
    fn test_storage_is_serious() {
        let err: Error = SpaceError::storage("disk").into();
        assert_eq!(err, Error::Storage("disk".into()));
        assert!(err.is_serious());
    }

    #[test]
    fn test_not_found() {
        let err: Error = SpaceError::EntryNotInSpace { uid: Uid::new("x") }.into();
        assert!(err.is_not_found());
    }
}
