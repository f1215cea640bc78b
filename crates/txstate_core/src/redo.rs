//! Transaction redo log.
//!
//! The redo log is an append-only index of 20-byte entries written by the
//! message pipeline as transactions are prepared and resolved. It is never
//! mutated and is read only to rebuild the state table after a crash.
//!
//! ## Entry Format
//!
//! ```text
//! | message_offset (8) | message_size (4) | tag_code (8) |
//! ```
//!
//! `tag_code == -1` marks a prepared transaction whose message sits at
//! `message_offset`. Any other `tag_code` is the message offset of the
//! prepared transaction that the entry resolves.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::log::{RecoveredTail, SegmentView, SegmentedLog};
use crate::record::le_array;
use std::path::Path;

/// Encoded size of a redo entry in bytes.
pub const RAW_ENTRY_SIZE: usize = 20;

/// Tag code marking a prepared transaction.
pub const PREPARED_TAG: i64 = -1;

/// A decoded redo log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoEntry {
    /// A transaction entered the Prepared state.
    Prepared {
        /// Offset of the prepared message in the primary log.
        message_offset: i64,
        /// Size of the prepared message.
        message_size: i32,
    },
    /// A prepared transaction was committed or rolled back.
    Resolved {
        /// Offset of the prepared message being resolved.
        prepared_offset: i64,
        /// Offset of the commit/rollback message in the primary log.
        message_offset: i64,
        /// Size of the commit/rollback message.
        message_size: i32,
    },
}

impl RedoEntry {
    /// Offset of the message this entry was written for.
    #[must_use]
    pub fn message_offset(&self) -> i64 {
        match self {
            Self::Prepared { message_offset, .. } | Self::Resolved { message_offset, .. } => {
                *message_offset
            }
        }
    }

    /// Size of the message this entry was written for.
    #[must_use]
    pub fn message_size(&self) -> i32 {
        match self {
            Self::Prepared { message_size, .. } | Self::Resolved { message_size, .. } => {
                *message_size
            }
        }
    }

    /// Encodes the entry to its raw layout.
    #[must_use]
    pub fn encode(&self) -> [u8; RAW_ENTRY_SIZE] {
        let tag = match self {
            Self::Prepared { .. } => PREPARED_TAG,
            Self::Resolved {
                prepared_offset, ..
            } => *prepared_offset,
        };

        let mut buf = [0u8; RAW_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.message_offset().to_le_bytes());
        buf[8..12].copy_from_slice(&self.message_size().to_le_bytes());
        buf[12..20].copy_from_slice(&tag.to_le_bytes());
        buf
    }

    /// Decodes an entry from the first 20 bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns `SegmentCorruption` if fewer than 20 bytes are available.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < RAW_ENTRY_SIZE {
            return Err(CoreError::segment_corruption(format!(
                "redo entry needs {RAW_ENTRY_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let message_offset = i64::from_le_bytes(le_array(&data[0..8]));
        let message_size = i32::from_le_bytes(le_array(&data[8..12]));
        let tag = i64::from_le_bytes(le_array(&data[12..20]));

        Ok(if tag == PREPARED_TAG {
            Self::Prepared {
                message_offset,
                message_size,
            }
        } else {
            Self::Resolved {
                prepared_offset: tag,
                message_offset,
                message_size,
            }
        })
    }

    /// Returns true if the raw entry could have been written by the store.
    #[must_use]
    pub fn is_valid_raw(data: &[u8]) -> bool {
        if data.len() < RAW_ENTRY_SIZE {
            return false;
        }
        let message_offset = i64::from_le_bytes(le_array(&data[0..8]));
        let message_size = i32::from_le_bytes(le_array(&data[8..12]));
        message_offset >= 0 && message_size > 0
    }
}

/// A run of consecutive redo entries read from one segment.
///
/// Holds the segment view until dropped.
#[derive(Debug)]
pub struct RedoBatch {
    view: SegmentView,
}

impl RedoBatch {
    /// Log offset of the first entry.
    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.view.start_offset()
    }

    /// Number of bytes covered by whole entries.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        (self.view.len() / RAW_ENTRY_SIZE * RAW_ENTRY_SIZE) as u64
    }

    /// Iterates over the decoded entries.
    pub fn entries(&self) -> impl Iterator<Item = RedoEntry> + '_ {
        self.view
            .bytes()
            .chunks_exact(RAW_ENTRY_SIZE)
            .filter_map(|raw| RedoEntry::decode(raw).ok())
    }
}

/// The redo log of transaction state changes.
#[derive(Debug)]
pub struct RedoLog {
    log: SegmentedLog,
    tail_segments: usize,
}

impl RedoLog {
    /// Opens the redo log stored in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path, config: &Config) -> CoreResult<Self> {
        Ok(Self {
            log: SegmentedLog::open("redolog", dir, config.redo_log_segment_size)?,
            tail_segments: config.recovery_tail_segments,
        })
    }

    /// Creates an empty memory-backed redo log.
    #[must_use]
    pub fn in_memory(config: &Config) -> Self {
        Self {
            log: SegmentedLog::in_memory("redolog", config.redo_log_segment_size),
            tail_segments: config.recovery_tail_segments,
        }
    }

    /// Loads existing segments.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment files are inconsistent.
    pub fn load(&self) -> CoreResult<()> {
        self.log.load()
    }

    /// Appends an entry and returns its log offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the tail segment cannot be created or written.
    pub fn append(&self, entry: &RedoEntry) -> CoreResult<u64> {
        let (offset, _) = self.log.append(&entry.encode())?;
        Ok(offset)
    }

    /// Offset of the oldest retained entry.
    #[must_use]
    pub fn min_offset(&self) -> u64 {
        self.log.min_offset()
    }

    /// Offset just past the newest entry.
    #[must_use]
    pub fn max_offset(&self) -> u64 {
        self.log.max_offset()
    }

    /// Reads the entries from `offset` to the end of its segment.
    ///
    /// Returns `None` once `offset` reaches the end of the log.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the segment cannot be read.
    pub fn read_from(&self, offset: u64) -> CoreResult<Option<RedoBatch>> {
        let Some(segment) = self.log.find_segment(offset) else {
            return Ok(None);
        };
        let view = segment.map_at(offset - segment.start_offset())?;
        Ok(view
            .map(|view| RedoBatch { view })
            .filter(|batch| batch.byte_len() > 0))
    }

    /// Drops torn entries at the end of the log.
    ///
    /// # Errors
    ///
    /// Returns a storage error if reading or truncating fails.
    pub fn recover(&self) -> CoreResult<RecoveredTail> {
        let tail =
            self.log
                .recover_valid_prefix(RAW_ENTRY_SIZE, self.tail_segments, RedoEntry::is_valid_raw)?;
        if tail.truncated_bytes > 0 {
            tracing::info!(
                truncated_bytes = tail.truncated_bytes,
                max_offset = tail.max_offset,
                "redo log tail truncated"
            );
        }
        Ok(tail)
    }

    /// Deletes segments whose entries all refer to primary log offsets
    /// below `primary_log_offset`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a segment cannot be read.
    pub fn delete_expired_before(&self, primary_log_offset: i64) -> CoreResult<usize> {
        self.log.delete_expired(primary_log_offset, RAW_ENTRY_SIZE)
    }

    /// Flushes every segment.
    ///
    /// # Errors
    ///
    /// Returns the first storage error encountered.
    pub fn flush(&self, sync: bool) -> CoreResult<()> {
        self.log.flush(sync)
    }

    /// The underlying segmented log.
    #[must_use]
    pub fn log(&self) -> &SegmentedLog {
        &self.log
    }
}
