//! The transaction state table.
//!
//! One 24-byte [`StateRecord`] per prepared transaction, appended in order
//! to a [`SegmentedLog`]. A record's table offset is its byte offset divided
//! by the record size. Resolution rewrites the record's 4-byte state field
//! in place; nothing else is ever modified.
//!
//! ## Concurrency
//!
//! `append_prepared` and `update_state` assume a single writer. Check tasks
//! read concurrently; they see a state field either before or after an
//! update, never a mix.

use crate::check::{CheckScheduler, CheckSettings, TransactionChecker};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::log::{SegmentView, SegmentedLog};
use crate::record::StateRecord;
use crate::types::{TableOffset, TransactionState};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const RECORD_SIZE: u64 = StateRecord::SIZE as u64;

/// Result of a successful [`TransactionStateTable::update_state`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The state field was overwritten.
    Updated,
    /// The record was already resolved; nothing changed.
    AlreadyResolved,
}

impl UpdateOutcome {
    /// Returns true if the record was modified.
    #[must_use]
    pub fn is_updated(self) -> bool {
        matches!(self, Self::Updated)
    }
}

/// Scoped view onto one state record.
///
/// Keeps the record's segment alive until dropped.
#[derive(Debug)]
pub struct RecordView {
    table_offset: TableOffset,
    record: StateRecord,
    view: SegmentView,
}

impl RecordView {
    fn new(table_offset: TableOffset, view: SegmentView) -> CoreResult<Self> {
        let record = StateRecord::decode(view.bytes())?;
        Ok(Self {
            table_offset,
            record,
            view,
        })
    }

    /// Table offset of the record.
    #[must_use]
    pub fn table_offset(&self) -> TableOffset {
        self.table_offset
    }

    /// The record as read when the view was taken.
    #[must_use]
    pub fn record(&self) -> StateRecord {
        self.record
    }

    fn write_state(&mut self, state: TransactionState) -> CoreResult<()> {
        self.view
            .write_at(StateRecord::STATE_POS, &state.code().to_le_bytes())?;
        self.record.state_code = state.code();
        Ok(())
    }
}

/// Record counts by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCounts {
    /// Records awaiting resolution.
    pub prepared: u64,
    /// Committed records.
    pub committed: u64,
    /// Rolled-back records.
    pub rolled_back: u64,
    /// Records with an unknown state code.
    pub unknown: u64,
}

impl StateCounts {
    /// Total number of records counted.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prepared + self.committed + self.rolled_back + self.unknown
    }
}

/// The transaction state table and its check scheduler.
pub struct TransactionStateTable {
    log: SegmentedLog,
    next_offset: AtomicU64,
    tail_segments: usize,
    settings: CheckSettings,
    checker: Arc<dyn TransactionChecker>,
    scheduler: Mutex<Option<CheckScheduler>>,
}

impl TransactionStateTable {
    /// Opens the table stored in `dir`. Segments are read by [`Self::load`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(
        dir: &Path,
        config: &Config,
        checker: Arc<dyn TransactionChecker>,
    ) -> CoreResult<Self> {
        let log = SegmentedLog::open("statetable", dir, config.state_table_segment_size)?;
        Ok(Self::with_log(log, config, checker))
    }

    /// Creates an empty memory-backed table.
    #[must_use]
    pub fn in_memory(config: &Config, checker: Arc<dyn TransactionChecker>) -> Self {
        let log = SegmentedLog::in_memory("statetable", config.state_table_segment_size);
        Self::with_log(log, config, checker)
    }

    fn with_log(log: SegmentedLog, config: &Config, checker: Arc<dyn TransactionChecker>) -> Self {
        Self {
            log,
            next_offset: AtomicU64::new(0),
            tail_segments: config.recovery_tail_segments,
            settings: CheckSettings::from(config),
            checker,
            scheduler: Mutex::new(None),
        }
    }

    /// Loads existing segments and positions the counter after the last
    /// written byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment files are inconsistent.
    pub fn load(&self) -> CoreResult<()> {
        self.log.load()?;
        self.sync_next_offset();
        Ok(())
    }

    /// Appends a Prepared record and returns its table offset.
    ///
    /// # Errors
    ///
    /// Returns an error if no writable tail segment can be produced.
    pub fn append_prepared(
        &self,
        commit_log_offset: i64,
        message_size: i32,
        timestamp: i32,
        group_hash: i32,
    ) -> CoreResult<TableOffset> {
        let record = StateRecord::prepared(commit_log_offset, message_size, timestamp, group_hash);
        let (byte_offset, segment) = self.log.append(&record.encode()).map_err(|e| {
            tracing::error!(commit_log_offset, error = %e, "failed to append prepared record");
            e
        })?;

        let table_offset = TableOffset::new(byte_offset / RECORD_SIZE);
        self.next_offset
            .store(table_offset.next().as_u64(), Ordering::Release);

        if byte_offset == segment.start_offset() {
            if let Some(scheduler) = self.scheduler.lock().as_ref() {
                scheduler.register(&segment);
            }
        }
        Ok(table_offset)
    }

    /// Resolves the record at `table_offset`.
    ///
    /// The stored commit log offset and group hash must match the caller's.
    /// A record that is already resolved is left alone.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if `new_state` is Prepared
    /// - `RecordNotFound` if no written record exists at the offset
    /// - `RecordMismatch` if the record belongs to another transaction
    /// - a storage error if the write fails
    pub fn update_state(
        &self,
        table_offset: TableOffset,
        commit_log_offset: i64,
        group_hash: i32,
        new_state: TransactionState,
    ) -> CoreResult<UpdateOutcome> {
        if !new_state.is_terminal() {
            return Err(CoreError::invalid_operation(format!(
                "cannot move {table_offset} back to {new_state}"
            )));
        }

        let Some(mut view) = self.find_record(table_offset)? else {
            tracing::error!(%table_offset, commit_log_offset, "transaction state record not found");
            return Err(CoreError::RecordNotFound { table_offset });
        };

        let stored = view.record();
        if stored.commit_log_offset != commit_log_offset || stored.group_hash != group_hash {
            tracing::error!(
                %table_offset,
                expected_commit_log_offset = commit_log_offset,
                found_commit_log_offset = stored.commit_log_offset,
                expected_group_hash = group_hash,
                found_group_hash = stored.group_hash,
                "transaction state record does not match"
            );
            return Err(CoreError::RecordMismatch {
                table_offset,
                expected_commit_log_offset: commit_log_offset,
                found_commit_log_offset: stored.commit_log_offset,
                expected_group_hash: group_hash,
                found_group_hash: stored.group_hash,
            });
        }

        if !stored.is_prepared() {
            tracing::warn!(
                %table_offset,
                commit_log_offset,
                state_code = stored.state_code,
                "transaction already resolved"
            );
            return Ok(UpdateOutcome::AlreadyResolved);
        }

        view.write_state(new_state)?;
        tracing::debug!(%table_offset, commit_log_offset, state = %new_state, "transaction resolved");
        Ok(UpdateOutcome::Updated)
    }

    /// Returns a view onto the record at `table_offset`.
    ///
    /// `None` if no segment covers the offset or the record is not fully
    /// written.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn find_record(&self, table_offset: TableOffset) -> CoreResult<Option<RecordView>> {
        let Some(byte_offset) = table_offset.as_u64().checked_mul(RECORD_SIZE) else {
            return Ok(None);
        };
        let Some(segment) = self.log.find_segment(byte_offset) else {
            return Ok(None);
        };
        segment
            .map_range(byte_offset - segment.start_offset(), StateRecord::SIZE)?
            .map(|view| RecordView::new(table_offset, view))
            .transpose()
    }

    /// Reads up to `limit` records starting at `from`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a segment cannot be read.
    pub fn scan_records(
        &self,
        from: TableOffset,
        limit: usize,
    ) -> CoreResult<Vec<(TableOffset, StateRecord)>> {
        let mut out = Vec::new();
        let start = from.as_u64().saturating_mul(RECORD_SIZE).max(self.log.min_offset());

        for segment in self.log.segments() {
            if out.len() >= limit {
                break;
            }
            let end = segment.start_offset() + segment.wrote_position();
            if end <= start {
                continue;
            }
            let position = start.saturating_sub(segment.start_offset());
            let Some(view) = segment.map_at(position)? else {
                continue;
            };

            let first = view.start_offset() / RECORD_SIZE;
            for (index, raw) in (first..).zip(view.bytes().chunks_exact(StateRecord::SIZE)) {
                if out.len() >= limit {
                    break;
                }
                out.push((TableOffset::new(index), StateRecord::decode(raw)?));
            }
        }
        Ok(out)
    }

    /// Counts records by state across every segment.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a segment cannot be read.
    pub fn state_counts(&self) -> CoreResult<StateCounts> {
        let mut counts = StateCounts::default();
        for segment in self.log.segments() {
            let Some(view) = segment.map_whole()? else {
                continue;
            };
            for raw in view.bytes().chunks_exact(StateRecord::SIZE) {
                match StateRecord::decode(raw)?.state() {
                    Some(TransactionState::Prepared) => counts.prepared += 1,
                    Some(TransactionState::Committed) => counts.committed += 1,
                    Some(TransactionState::RolledBack) => counts.rolled_back += 1,
                    None => counts.unknown += 1,
                }
            }
        }
        Ok(counts)
    }

    /// Deletes whole segments whose last record refers to a commit log
    /// offset below `primary_log_offset`. The tail segment is kept.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a segment cannot be read.
    pub fn delete_expired_before(&self, primary_log_offset: i64) -> CoreResult<usize> {
        let deleted = self.log.delete_expired(primary_log_offset, StateRecord::SIZE)?;
        if deleted > 0 {
            tracing::info!(deleted, primary_log_offset, "expired state table segments deleted");
        }
        Ok(deleted)
    }

    /// Table offset the next append will receive.
    #[must_use]
    pub fn next_table_offset(&self) -> TableOffset {
        TableOffset::new(self.next_offset.load(Ordering::Acquire))
    }

    /// Starts the check scheduler and registers every existing segment.
    ///
    /// Calling `start` on a running table does nothing.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the timer thread cannot be spawned.
    pub fn start(&self) -> CoreResult<()> {
        let mut slot = self.scheduler.lock();
        if slot.is_some() {
            return Ok(());
        }

        let scheduler = CheckScheduler::start(self.settings, Arc::clone(&self.checker))?;
        for segment in self.log.segments() {
            scheduler.register(&segment);
        }
        tracing::info!(tasks = scheduler.task_count(), "transaction check scheduler started");
        *slot = Some(scheduler);
        Ok(())
    }

    /// Stops the check scheduler. Pending checks are abandoned.
    pub fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
            tracing::info!("transaction check scheduler stopped");
        }
    }

    /// Returns true while the check scheduler runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    /// Number of registered check tasks (0 when stopped).
    #[must_use]
    pub fn check_task_count(&self) -> usize {
        self.scheduler
            .lock()
            .as_ref()
            .map_or(0, CheckScheduler::task_count)
    }

    /// Flushes every segment, fsyncing when `sync` is set.
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

    pub(crate) fn tail_segments(&self) -> usize {
        self.tail_segments
    }

    /// Resets the counter to the end of the written data.
    pub(crate) fn sync_next_offset(&self) {
        self.next_offset
            .store(self.log.max_offset() / RECORD_SIZE, Ordering::Release);
    }
}

impl std::fmt::Debug for TransactionStateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStateTable")
            .field("log", &self.log)
            .field("next_offset", &self.next_table_offset())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Drop for TransactionStateTable {
    fn drop(&mut self) {
        self.shutdown();
    }
}
