//! Rebuilding the state table after a restart.
//!
//! After a clean exit the table on disk is trusted up to its last valid
//! record. After a crash it is discarded and rebuilt from the redo log:
//! every prepared transaction without a matching resolution gets a fresh
//! Prepared record, provided its message can still be found in the primary
//! log.

use crate::error::{CoreError, CoreResult};
use crate::record::StateRecord;
use crate::redo::{RedoEntry, RedoLog};
use crate::table::TransactionStateTable;
use crate::types::{producer_group_hash, TableOffset};
use std::collections::BTreeSet;

/// Metadata of a message stored in the primary log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    /// Offset of the message in the primary log.
    pub commit_log_offset: i64,
    /// Stored size of the message.
    pub store_size: i32,
    /// Store time in milliseconds since the Unix epoch.
    pub store_timestamp_ms: i64,
    /// Producer group that sent the message.
    pub producer_group: String,
}

/// Read access to the primary message log.
pub trait MessageLookup: Send + Sync {
    /// Returns the message stored at `commit_log_offset`, if it still
    /// exists.
    fn lookup_message(&self, commit_log_offset: i64) -> Option<MessageMeta>;
}

/// Which recovery branch ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// The table was validated and its torn tail truncated.
    Clean,
    /// The table was rebuilt from the redo log.
    Crash,
}

/// Summary of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Branch that ran.
    pub mode: RecoveryMode,
    /// Table offset of the next append after recovery.
    pub next_table_offset: TableOffset,
    /// Table bytes dropped by clean recovery.
    pub truncated_bytes: u64,
    /// Redo log bytes dropped by tail repair.
    pub redo_truncated_bytes: u64,
    /// Redo log offset where replay ended (crash recovery only).
    pub redo_end_offset: u64,
    /// Transactions re-registered by crash recovery.
    pub replayed: usize,
    /// Unresolved transactions whose message was missing.
    pub dropped: usize,
}

/// Recovers the table, choosing the branch from `clean_exit`.
///
/// The redo log tail is repaired first in both branches.
///
/// # Errors
///
/// Returns `SchedulerRunning` if the table's check scheduler is running,
/// or a storage error.
pub fn recover(
    table: &TransactionStateTable,
    redo: &RedoLog,
    lookup: &dyn MessageLookup,
    clean_exit: bool,
) -> CoreResult<RecoveryReport> {
    if table.is_running() {
        return Err(CoreError::SchedulerRunning);
    }

    let redo_tail = redo.recover()?;
    let mut report = if clean_exit {
        recover_clean(table)?
    } else {
        recover_from_redo(table, redo, lookup)?
    };
    report.redo_truncated_bytes = redo_tail.truncated_bytes;
    Ok(report)
}

/// Keeps the longest valid prefix of the table and truncates the rest.
///
/// # Errors
///
/// Returns a storage error if reading or truncating fails.
pub fn recover_clean(table: &TransactionStateTable) -> CoreResult<RecoveryReport> {
    let tail = table.log().recover_valid_prefix(
        StateRecord::SIZE,
        table.tail_segments(),
        |raw| StateRecord::decode(raw).is_ok_and(|record| record.is_valid()),
    )?;
    table.sync_next_offset();

    tracing::info!(
        next_table_offset = %table.next_table_offset(),
        truncated_bytes = tail.truncated_bytes,
        "transaction state table recovered after clean exit"
    );

    Ok(RecoveryReport {
        mode: RecoveryMode::Clean,
        next_table_offset: table.next_table_offset(),
        truncated_bytes: tail.truncated_bytes,
        redo_truncated_bytes: 0,
        redo_end_offset: 0,
        replayed: 0,
        dropped: 0,
    })
}

/// Discards the table and rebuilds it from the redo log.
///
/// # Errors
///
/// Returns a storage error if the redo log cannot be read or a record
/// cannot be appended.
pub fn recover_from_redo(
    table: &TransactionStateTable,
    redo: &RedoLog,
    lookup: &dyn MessageLookup,
) -> CoreResult<RecoveryReport> {
    table.log().destroy_all();
    table.sync_next_offset();

    let (pending, redo_end_offset) = unresolved_prepared(redo)?;
    tracing::info!(
        redo_end_offset,
        unresolved = pending.len(),
        "transaction redo log scan over"
    );

    let mut replayed = 0usize;
    let mut dropped = 0usize;
    for offset in pending {
        let Some(message) = lookup.lookup_message(offset) else {
            tracing::warn!(
                commit_log_offset = offset,
                "prepared message not found, transaction dropped"
            );
            dropped += 1;
            continue;
        };

        table.append_prepared(
            message.commit_log_offset,
            message.store_size,
            seconds(message.store_timestamp_ms),
            producer_group_hash(&message.producer_group),
        )?;
        replayed += 1;
    }

    tracing::info!(
        replayed,
        dropped,
        next_table_offset = %table.next_table_offset(),
        "transaction state table rebuilt from redo log"
    );

    Ok(RecoveryReport {
        mode: RecoveryMode::Crash,
        next_table_offset: table.next_table_offset(),
        truncated_bytes: 0,
        redo_truncated_bytes: 0,
        redo_end_offset,
        replayed,
        dropped,
    })
}

/// Replays the redo log into the ordered set of unresolved prepared
/// message offsets. Also returns the offset where the scan ended.
fn unresolved_prepared(redo: &RedoLog) -> CoreResult<(BTreeSet<i64>, u64)> {
    let mut pending = BTreeSet::new();
    let mut offset = redo.min_offset();

    while let Some(batch) = redo.read_from(offset)? {
        for entry in batch.entries() {
            match entry {
                RedoEntry::Prepared { message_offset, .. } => {
                    pending.insert(message_offset);
                }
                RedoEntry::Resolved {
                    prepared_offset, ..
                } => {
                    pending.remove(&prepared_offset);
                }
            }
        }
        offset += batch.byte_len();
    }
    Ok((pending, offset))
}

fn seconds(timestamp_ms: i64) -> i32 {
    i32::try_from(timestamp_ms / 1000).unwrap_or(i32::MAX)
}
