//! Transaction store facade.

use crate::check::TransactionChecker;
use crate::config::Config;
use crate::dir::StoreDir;
use crate::error::CoreResult;
use crate::recovery::{self, MessageLookup, RecoveryReport};
use crate::redo::RedoLog;
use crate::table::{RecordView, StateCounts, TransactionStateTable, UpdateOutcome};
use crate::types::{TableOffset, TransactionState};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The transactional state of a message store.
///
/// Owns the state table, the redo log and the check scheduler.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let store = TransactionStore::open(path, Config::default(), lookup, checker)?;
/// store.recover(store.last_exit_ok())?;
/// store.start()?;
/// // append_prepared / update_state ...
/// store.shutdown()?;
/// ```
///
/// Dropping the store without [`TransactionStore::shutdown`] leaves the
/// abort marker in place, so the next open runs crash recovery.
pub struct TransactionStore {
    config: Config,
    /// Store directory (holds the lock). None for in-memory stores.
    dir: Option<StoreDir>,
    table: TransactionStateTable,
    redo: RedoLog,
    lookup: Arc<dyn MessageLookup>,
    last_exit_ok: bool,
    closed: AtomicBool,
}

impl TransactionStore {
    /// Opens the store in `path`, loading existing segments.
    ///
    /// # Errors
    ///
    /// Returns `StoreLocked` if another process uses the directory,
    /// `InvalidFormat` for an invalid configuration or segment layout, or an
    /// I/O error.
    pub fn open(
        path: &Path,
        config: Config,
        lookup: Arc<dyn MessageLookup>,
        checker: Arc<dyn TransactionChecker>,
    ) -> CoreResult<Self> {
        config.validate()?;

        let dir = StoreDir::open(path)?;
        let table = TransactionStateTable::open(&dir.state_table_dir(), &config, checker)?;
        let redo = RedoLog::open(&dir.redo_log_dir(), &config)?;
        table.load()?;
        redo.load()?;

        let last_exit_ok = dir.last_exit_ok();
        dir.mark_running()?;
        tracing::info!(
            path = %path.display(),
            last_exit_ok,
            next_table_offset = %table.next_table_offset(),
            redo_max_offset = redo.max_offset(),
            "transaction store opened"
        );

        Ok(Self {
            config,
            dir: Some(dir),
            table,
            redo,
            lookup,
            last_exit_ok,
            closed: AtomicBool::new(false),
        })
    }

    /// Creates an empty memory-backed store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for an invalid configuration.
    pub fn open_in_memory(
        config: Config,
        lookup: Arc<dyn MessageLookup>,
        checker: Arc<dyn TransactionChecker>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let table = TransactionStateTable::in_memory(&config, checker);
        let redo = RedoLog::in_memory(&config);

        Ok(Self {
            config,
            dir: None,
            table,
            redo,
            lookup,
            last_exit_ok: true,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns true if the previous run shut down cleanly.
    #[must_use]
    pub fn last_exit_ok(&self) -> bool {
        self.last_exit_ok
    }

    /// Recovers the state table. Must run before [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns `SchedulerRunning` after `start`, or a storage error.
    pub fn recover(&self, clean_exit: bool) -> CoreResult<RecoveryReport> {
        recovery::recover(&self.table, &self.redo, self.lookup.as_ref(), clean_exit)
    }

    /// Starts the check scheduler.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the timer thread cannot be spawned.
    pub fn start(&self) -> CoreResult<()> {
        self.table.start()
    }

    /// Stops the scheduler, flushes both logs and removes the abort marker.
    ///
    /// Calling `shutdown` again after it succeeded does nothing. After a
    /// failure the store stays open and `shutdown` can be retried.
    ///
    /// # Errors
    ///
    /// Returns the first flush or marker removal error.
    pub fn shutdown(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        self.table.shutdown();
        self.table.flush(self.config.sync_on_shutdown)?;
        self.redo.flush(self.config.sync_on_shutdown)?;
        if let Some(dir) = &self.dir {
            dir.mark_clean_shutdown()?;
        }
        self.closed.store(true, Ordering::Release);
        tracing::info!("transaction store shut down");
        Ok(())
    }

    /// Returns true while the check scheduler runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.table.is_running()
    }

    /// Appends a Prepared record. See
    /// [`TransactionStateTable::append_prepared`].
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn append_prepared(
        &self,
        commit_log_offset: i64,
        message_size: i32,
        timestamp: i32,
        group_hash: i32,
    ) -> CoreResult<TableOffset> {
        self.table
            .append_prepared(commit_log_offset, message_size, timestamp, group_hash)
    }

    /// Resolves a Prepared record. See
    /// [`TransactionStateTable::update_state`].
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound`, `RecordMismatch`, `InvalidOperation` or a
    /// storage error.
    pub fn update_state(
        &self,
        table_offset: TableOffset,
        commit_log_offset: i64,
        group_hash: i32,
        new_state: TransactionState,
    ) -> CoreResult<UpdateOutcome> {
        self.table
            .update_state(table_offset, commit_log_offset, group_hash, new_state)
    }

    /// Returns a view onto the record at `table_offset`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn find_record(&self, table_offset: TableOffset) -> CoreResult<Option<RecordView>> {
        self.table.find_record(table_offset)
    }

    /// Deletes expired segments of the state table and the redo log.
    ///
    /// Returns the number of state table segments deleted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a segment cannot be read.
    pub fn delete_expired_before(&self, primary_log_offset: i64) -> CoreResult<usize> {
        let deleted = self.table.delete_expired_before(primary_log_offset)?;
        let redo_deleted = self.redo.delete_expired_before(primary_log_offset)?;
        if redo_deleted > 0 {
            tracing::info!(deleted = redo_deleted, primary_log_offset, "expired redo log segments deleted");
        }
        Ok(deleted)
    }

    /// The redo log, for the message pipeline to append to.
    #[must_use]
    pub fn redo_log(&self) -> &RedoLog {
        &self.redo
    }

    /// The state table.
    #[must_use]
    pub fn table(&self) -> &TransactionStateTable {
        &self.table
    }

    /// Table offset the next append will receive.
    #[must_use]
    pub fn next_table_offset(&self) -> TableOffset {
        self.table.next_table_offset()
    }

    /// Record counts by state.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a segment cannot be read.
    pub fn state_counts(&self) -> CoreResult<StateCounts> {
        self.table.state_counts()
    }

    /// Store configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("dir", &self.dir.as_ref().map(StoreDir::path))
            .field("table", &self.table)
            .field("redo", &self.redo)
            .field("last_exit_ok", &self.last_exit_ok)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{BoxError, CheckRequest};
    use crate::error::CoreError;
    use crate::recovery::MessageMeta;
    use crate::redo::RedoEntry;

    struct NoMessages;

    impl MessageLookup for NoMessages {
        fn lookup_message(&self, _: i64) -> Option<MessageMeta> {
            None
        }
    }

    fn store() -> TransactionStore {
        TransactionStore::open_in_memory(
            Config::default().state_table_records_per_segment(4),
            Arc::new(NoMessages),
            Arc::new(|_: &CheckRequest| -> Result<(), BoxError> { Ok(()) }),
        )
        .unwrap()
    }

    #[test]
    fn in_memory_store_lifecycle() {
        let store = store();
        assert!(store.last_exit_ok());
        store.recover(true).unwrap();
        store.start().unwrap();
        assert!(store.is_running());

        let ts = store.append_prepared(10, 1, 0, 3).unwrap();
        assert!(store
            .update_state(ts, 10, 3, TransactionState::Committed)
            .unwrap()
            .is_updated());

        store.shutdown().unwrap();
        assert!(!store.is_running());
        store.shutdown().unwrap();
    }

    #[test]
    fn recover_after_start_is_rejected() {
        let store = store();
        store.start().unwrap();
        assert!(matches!(store.recover(true), Err(CoreError::SchedulerRunning)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = TransactionStore::open_in_memory(
            Config::default().recovery_tail_segments(0),
            Arc::new(NoMessages),
            Arc::new(|_: &CheckRequest| -> Result<(), BoxError> { Ok(()) }),
        );
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn expiry_covers_redo_log() {
        let store = TransactionStore::open_in_memory(
            Config::default()
                .state_table_records_per_segment(1)
                .redo_log_entries_per_segment(1),
            Arc::new(NoMessages),
            Arc::new(|_: &CheckRequest| -> Result<(), BoxError> { Ok(()) }),
        )
        .unwrap();

        for offset in [100, 200, 300] {
            store.append_prepared(offset, 1, 0, 0).unwrap();
            store
                .redo_log()
                .append(&RedoEntry::Prepared {
                    message_offset: offset,
                    message_size: 1,
                })
                .unwrap();
        }

        assert_eq!(store.delete_expired_before(250).unwrap(), 2);
        assert_eq!(store.redo_log().min_offset(), 40);
    }

    #[test]
    fn failed_shutdown_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransactionStore::open(
            dir.path(),
            Config::default().state_table_records_per_segment(4),
            Arc::new(NoMessages),
            Arc::new(|_: &CheckRequest| -> Result<(), BoxError> { Ok(()) }),
        )
        .unwrap();
        store.append_prepared(10, 1, 0, 3).unwrap();

        let marker = dir.path().join("ABORT");
        std::fs::remove_file(&marker).unwrap();
        std::fs::create_dir(&marker).unwrap();
        assert!(store.shutdown().is_err());

        std::fs::remove_dir(&marker).unwrap();
        std::fs::File::create(&marker).unwrap();
        store.shutdown().unwrap();
        assert!(!marker.exists());
    }
}
