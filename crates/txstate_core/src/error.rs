//! Error types for the transaction state store.

use crate::types::TableOffset;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in transaction state store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] txstate_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment is corrupted or has an unexpected layout.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Segment was deleted or could not be acquired.
    #[error("segment starting at {start_offset} is no longer available")]
    SegmentUnavailable {
        /// Start byte offset of the segment.
        start_offset: u64,
    },

    /// No fully written record exists at the table offset.
    #[error("no transaction state record at {table_offset}")]
    RecordNotFound {
        /// The table offset that was looked up.
        table_offset: TableOffset,
    },

    /// The record at the table offset belongs to a different transaction.
    #[error(
        "record at {table_offset} does not match: expected commit log offset {expected_commit_log_offset} \
         group hash {expected_group_hash}, found {found_commit_log_offset} / {found_group_hash}"
    )]
    RecordMismatch {
        /// The table offset that was updated.
        table_offset: TableOffset,
        /// Commit log offset supplied by the caller.
        expected_commit_log_offset: i64,
        /// Commit log offset stored in the record.
        found_commit_log_offset: i64,
        /// Producer group hash supplied by the caller.
        expected_group_hash: i32,
        /// Producer group hash stored in the record.
        found_group_hash: i32,
    },

    /// The store directory is locked by another process.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The check scheduler is running and the table cannot be rebuilt.
    #[error("operation requires the check scheduler to be stopped")]
    SchedulerRunning,

    /// Invalid on-disk layout or configuration.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the error reports a record that belongs to another
    /// transaction.
    #[must_use]
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::RecordMismatch { .. })
    }
}
