//! Error taxonomy for the mailbox store
//!
//! Every I/O-touching operation returns [`Result`]. Pure computations
//! (flag calculation, statement building) never fail.

use std::fmt;

use rusqlite::ErrorCode;

use crate::models::{AccountId, MailboxId, MessageMetadata, MessageUid, ModSeq, State};

/// Result alias used across the storage and query layers
pub type Result<T> = std::result::Result<T, StoreError>;

/// Which per-mailbox counter an allocation targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Uid,
    ModSeq,
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceKind::Uid => f.write_str("UID"),
            SequenceKind::ModSeq => f.write_str("MODSEQ"),
        }
    }
}

/// Errors surfaced by the mailbox store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to allocate {kind} for mailbox {mailbox_id}: {source}")]
    SequenceAllocation {
        mailbox_id: MailboxId,
        kind: SequenceKind,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Modification sequence conflict on {mailbox_id}/{uid}: expected {expected}, found {actual}")]
    ModSeqConflict {
        mailbox_id: MailboxId,
        uid: MessageUid,
        expected: ModSeq,
        actual: ModSeq,
    },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error(transparent)]
    PartialBatch(#[from] PartialBatchFailure),

    #[error("Storage backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Backend call exceeded its deadline: {message}")]
    Timeout { message: String },

    #[error("State {state} of account {account_id} is no longer retained, a full resync is required")]
    StaleState { account_id: AccountId, state: State },

    #[error("Corrupted row: {message}")]
    Corrupted { message: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),
}

impl StoreError {
    pub(crate) fn not_found(resource: impl Into<String>) -> Self {
        StoreError::NotFound {
            resource: resource.into(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        StoreError::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        StoreError::BackendUnavailable {
            message: message.into(),
        }
    }

    pub(crate) fn corrupted(message: impl Into<String>) -> Self {
        StoreError::Corrupted {
            message: message.into(),
        }
    }

    /// Whether retrying the whole operation may succeed
    ///
    /// Partial batch failures are not retryable as a whole: callers retry
    /// the failed partitions listed in [`PartialBatchFailure::failed`].
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::SequenceAllocation { .. }
                | StoreError::BackendUnavailable { .. }
                | StoreError::Timeout { .. }
        )
    }

    /// Whether this is a normal negative result rather than a fault
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Timeout {
                    message: e.to_string(),
                },
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly => StoreError::BackendUnavailable {
                    message: e.to_string(),
                },
                ErrorCode::DatabaseCorrupt => StoreError::Corrupted {
                    message: e.to_string(),
                },
                ErrorCode::ConstraintViolation => StoreError::AlreadyExists {
                    resource: e.to_string(),
                },
                _ => StoreError::Database(e),
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::Corrupted {
                message: e.to_string(),
            },
            _ => StoreError::Database(e),
        }
    }
}

/// A partition of a batch operation that failed
#[derive(Debug)]
pub struct FailedPartition {
    /// UIDs submitted in the failed partition
    pub uids: Vec<MessageUid>,
    /// Why the partition failed
    pub error: StoreError,
}

/// Some partitions of a batch operation succeeded and others failed
///
/// `committed` holds the effects already applied by the successful
/// partitions (the rows read, for fetches); retrying only `failed` completes
/// the operation.
#[derive(Debug, Default, thiserror::Error)]
#[error("{} of {} partitions failed ({} rows committed)", failed.len(), failed.len() + succeeded_partitions, committed.len())]
pub struct PartialBatchFailure {
    pub committed: Vec<MessageMetadata>,
    /// UIDs the successful partitions found already in the target state
    pub already_applied: Vec<MessageUid>,
    /// UIDs the successful partitions found no row for
    pub missing: Vec<MessageUid>,
    pub failed: Vec<FailedPartition>,
    pub succeeded_partitions: usize,
}

impl PartialBatchFailure {
    /// UIDs that should be resubmitted
    pub fn failed_uids(&self) -> Vec<MessageUid> {
        self.failed
            .iter()
            .flat_map(|p| p.uids.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_maps_to_retryable_timeout() {
        let err = StoreError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert!(matches!(err, StoreError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cannot_open_maps_to_unavailable() {
        let err = StoreError::from(sqlite_failure(rusqlite::ffi::SQLITE_CANTOPEN));
        assert!(matches!(err, StoreError::BackendUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_constraint_maps_to_already_exists() {
        let err = StoreError::from(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT));
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = StoreError::not_found("message 1");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_partial_batch_lists_failed_uids() {
        let failure = PartialBatchFailure {
            failed: vec![
                FailedPartition {
                    uids: vec![MessageUid(3), MessageUid(4)],
                    error: StoreError::unavailable("down"),
                },
                FailedPartition {
                    uids: vec![MessageUid(7)],
                    error: StoreError::unavailable("down"),
                },
            ],
            succeeded_partitions: 1,
            ..Default::default()
        };
        assert_eq!(
            failure.failed_uids(),
            vec![MessageUid(3), MessageUid(4), MessageUid(7)]
        );
        assert_eq!(
            failure.to_string(),
            "2 of 3 partitions failed (0 rows committed)"
        );
        assert!(!StoreError::from(failure).is_retryable());
    }
}
