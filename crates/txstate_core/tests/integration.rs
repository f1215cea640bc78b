//! Integration tests for the transaction store.

use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use txstate_core::{
    now_millis, producer_group_hash, BoxError, CheckRequest, Config, CoreError, MessageLookup,
    MessageMeta, RecoveryMode, RedoEntry, StateRecord, TableOffset, TransactionChecker,
    TransactionState, TransactionStore, UpdateOutcome,
};

/// A primary log holding a fixed set of messages.
#[derive(Default)]
struct MemoryCommitLog {
    messages: Mutex<HashMap<i64, MessageMeta>>,
}

impl MemoryCommitLog {
    fn put(&self, offset: i64, group: &str, store_timestamp_ms: i64) {
        self.messages.lock().insert(
            offset,
            MessageMeta {
                commit_log_offset: offset,
                store_size: 200,
                store_timestamp_ms,
                producer_group: group.to_string(),
            },
        );
    }
}

impl MessageLookup for MemoryCommitLog {
    fn lookup_message(&self, commit_log_offset: i64) -> Option<MessageMeta> {
        self.messages.lock().get(&commit_log_offset).cloned()
    }
}

/// A checker recording every request.
#[derive(Default)]
struct RecordingChecker {
    requests: Mutex<Vec<CheckRequest>>,
}

impl TransactionChecker for RecordingChecker {
    fn check(&self, request: &CheckRequest) -> Result<(), BoxError> {
        self.requests.lock().push(*request);
        Ok(())
    }
}

fn small_config() -> Config {
    Config::default()
        .state_table_records_per_segment(4)
        .redo_log_entries_per_segment(4)
}

fn memory_store(config: Config) -> (TransactionStore, Arc<RecordingChecker>) {
    let checker = Arc::new(RecordingChecker::default());
    let store = TransactionStore::open_in_memory(
        config,
        Arc::new(MemoryCommitLog::default()),
        Arc::clone(&checker) as Arc<dyn TransactionChecker>,
    )
    .unwrap();
    (store, checker)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn end_to_end_resolution() {
    let (store, _) = memory_store(small_config());
    let group = producer_group_hash("please_rename_unique_group_name");
    let ts = store.append_prepared(1000, 200, 1_700_000_000, group).unwrap();
    assert_eq!(ts, TableOffset::new(0));

    assert_eq!(
        store
            .update_state(ts, 1000, group, TransactionState::Committed)
            .unwrap(),
        UpdateOutcome::Updated
    );
    assert_eq!(
        store
            .update_state(ts, 1000, group, TransactionState::RolledBack)
            .unwrap(),
        UpdateOutcome::AlreadyResolved
    );
    let mismatch = store.update_state(ts, 999, group, TransactionState::RolledBack);
    assert!(matches!(mismatch, Err(CoreError::RecordMismatch { .. })));

    let record = store.find_record(ts).unwrap().unwrap().record();
    assert_eq!(record.state(), Some(TransactionState::Committed));
}

#[test]
fn crash_recovery_rebuilds_from_redo_log() {
    let dir = tempdir().unwrap();
    let commit_log = Arc::new(MemoryCommitLog::default());
    let (a, b, c, gone) = (1_000i64, 2_000i64, 3_000i64, 4_000i64);
    for offset in [a, b, c] {
        commit_log.put(offset, "orders", 1_700_000_123_456);
    }

    {
        let store = TransactionStore::open(
            dir.path(),
            small_config(),
            Arc::clone(&commit_log) as Arc<dyn MessageLookup>,
            Arc::new(RecordingChecker::default()),
        )
        .unwrap();
        assert!(store.last_exit_ok());
        store.recover(true).unwrap();

        let redo = store.redo_log();
        for offset in [a, b, c, gone] {
            store
                .append_prepared(offset, 200, 1_700_000_123, producer_group_hash("orders"))
                .unwrap();
            redo.append(&RedoEntry::Prepared {
                message_offset: offset,
                message_size: 200,
            })
            .unwrap();
        }
        redo.append(&RedoEntry::Resolved {
            prepared_offset: b,
            message_offset: 5_000,
            message_size: 120,
        })
        .unwrap();
        // Dropped without shutdown: the abort marker stays behind.
    }

    let store = TransactionStore::open(
        dir.path(),
        small_config(),
        Arc::clone(&commit_log) as Arc<dyn MessageLookup>,
        Arc::new(RecordingChecker::default()),
    )
    .unwrap();
    assert!(!store.last_exit_ok());

    let report = store.recover(store.last_exit_ok()).unwrap();
    assert_eq!(report.mode, RecoveryMode::Crash);
    assert_eq!(report.replayed, 2);
    assert_eq!(report.dropped, 1);
    assert_eq!(store.next_table_offset(), TableOffset::new(2));

    let offsets: Vec<_> = (0..2)
        .map(|i| {
            let record = store.find_record(TableOffset::new(i)).unwrap().unwrap().record();
            assert!(record.is_prepared());
            assert_eq!(record.timestamp, 1_700_000_123);
            assert_eq!(record.group_hash, producer_group_hash("orders"));
            record.commit_log_offset
        })
        .collect();
    assert_eq!(offsets, vec![a, c]);
    store.shutdown().unwrap();
}

#[test]
fn clean_restart_truncates_partial_write() {
    let dir = tempdir().unwrap();
    let lookup: Arc<dyn MessageLookup> = Arc::new(MemoryCommitLog::default());

    {
        let store = TransactionStore::open(
            dir.path(),
            small_config(),
            Arc::clone(&lookup),
            Arc::new(RecordingChecker::default()),
        )
        .unwrap();
        for i in 0..6 {
            store.append_prepared(i * 100, 10, 0, 1).unwrap();
        }
        store.shutdown().unwrap();
    }

    // A torn append: half a record at the end of the tail segment.
    let tail = dir
        .path()
        .join("statetable")
        .join(format!("{:020}", 4 * StateRecord::SIZE));
    let mut file = OpenOptions::new().append(true).open(&tail).unwrap();
    file.write_all(&[0xAB; 12]).unwrap();
    drop(file);

    let store = TransactionStore::open(
        dir.path(),
        small_config(),
        Arc::clone(&lookup),
        Arc::new(RecordingChecker::default()),
    )
    .unwrap();
    assert!(store.last_exit_ok());

    let report = store.recover(true).unwrap();
    assert_eq!(report.mode, RecoveryMode::Clean);
    assert_eq!(report.truncated_bytes, 12);
    assert_eq!(store.next_table_offset(), TableOffset::new(6));
    assert_eq!(store.table().log().max_offset(), 6 * StateRecord::SIZE as u64);

    let ts = store.append_prepared(600, 10, 0, 1).unwrap();
    assert_eq!(ts, TableOffset::new(6));
    store.shutdown().unwrap();
}

#[test]
fn resolved_records_survive_clean_restart() {
    let dir = tempdir().unwrap();
    let lookup: Arc<dyn MessageLookup> = Arc::new(MemoryCommitLog::default());
    let open = || {
        TransactionStore::open(
            dir.path(),
            small_config(),
            Arc::clone(&lookup),
            Arc::new(RecordingChecker::default()),
        )
        .unwrap()
    };

    {
        let store = open();
        let ts = store.append_prepared(100, 10, 0, 1).unwrap();
        store
            .update_state(ts, 100, 1, TransactionState::RolledBack)
            .unwrap();
        store.shutdown().unwrap();
    }

    let store = open();
    store.recover(store.last_exit_ok()).unwrap();
    let record = store.find_record(TableOffset::new(0)).unwrap().unwrap().record();
    assert_eq!(record.state(), Some(TransactionState::RolledBack));
}

#[test]
fn second_open_is_locked_out() {
    let dir = tempdir().unwrap();
    let lookup: Arc<dyn MessageLookup> = Arc::new(MemoryCommitLog::default());
    let _first = TransactionStore::open(
        dir.path(),
        Config::default(),
        Arc::clone(&lookup),
        Arc::new(RecordingChecker::default()),
    )
    .unwrap();

    let second = TransactionStore::open(
        dir.path(),
        Config::default(),
        lookup,
        Arc::new(RecordingChecker::default()),
    );
    assert!(matches!(second, Err(CoreError::StoreLocked)));
}

#[test]
fn scheduler_checks_overdue_and_cancels_resolved_segments() {
    let config = small_config()
        .check_min_age(Duration::from_secs(30))
        .check_first_delay(Duration::ZERO)
        .check_interval(Duration::from_millis(20));
    let (store, checker) = memory_store(config);
    let now_secs = i32::try_from(now_millis() / 1000).unwrap();

    // Segment 0: fully resolved, sealed.
    for i in 0..4 {
        let ts = store.append_prepared(i, 1, now_secs - 3600, 9).unwrap();
        store
            .update_state(ts, i, 9, TransactionState::Committed)
            .unwrap();
    }
    // Segment 1: one overdue, then one fresh transaction.
    store.append_prepared(100, 1, now_secs - 3600, 9).unwrap();
    store.append_prepared(101, 1, now_secs, 9).unwrap();

    store.start().unwrap();
    assert!(store.is_running());

    assert!(wait_until(Duration::from_secs(5), || {
        store.table().check_task_count() == 1 && !checker.requests.lock().is_empty()
    }));

    let requests = checker.requests.lock().clone();
    assert!(requests.iter().all(|r| r.commit_log_offset == 100));
    assert_eq!(requests[0].table_offset, TableOffset::new(4));
    assert_eq!(requests[0].group_hash, 9);

    store.shutdown().unwrap();
    assert_eq!(store.table().check_task_count(), 0);
}

#[test]
fn new_segment_gets_a_task_while_running() {
    let (store, _) = memory_store(small_config());
    store.start().unwrap();
    assert_eq!(store.table().check_task_count(), 0);

    store.append_prepared(1, 1, 0, 0).unwrap();
    assert_eq!(store.table().check_task_count(), 1);
    for i in 2..=4 {
        store.append_prepared(i, 1, 0, 0).unwrap();
    }
    assert_eq!(store.table().check_task_count(), 1);
    store.append_prepared(5, 1, 0, 0).unwrap();
    assert_eq!(store.table().check_task_count(), 2);
}

#[test]
fn expiry_is_noop_before_retained_data() {
    let (store, _) = memory_store(small_config());
    for i in 0..12 {
        store.append_prepared(1_000 + i * 10, 1, 0, 0).unwrap();
    }

    assert_eq!(store.delete_expired_before(500).unwrap(), 0);
    assert_eq!(store.table().log().segments().len(), 3);

    // First segment's last record is 1_030, second's 1_070.
    assert_eq!(store.delete_expired_before(1_031).unwrap(), 1);
    assert!(store.find_record(TableOffset::new(3)).unwrap().is_none());
    assert!(store.find_record(TableOffset::new(4)).unwrap().is_some());
}

#[test]
fn expired_segment_file_is_removed() {
    let dir = tempdir().unwrap();
    let store = TransactionStore::open(
        dir.path(),
        small_config(),
        Arc::new(MemoryCommitLog::default()),
        Arc::new(RecordingChecker::default()),
    )
    .unwrap();
    for i in 0..8 {
        store.append_prepared(i, 1, 0, 0).unwrap();
    }

    let first = dir.path().join("statetable").join(format!("{:020}", 0));
    assert!(first.exists());
    assert_eq!(store.delete_expired_before(100).unwrap(), 1);
    assert!(!first.exists());
}

proptest! {
    #[test]
    fn append_find_roundtrip(
        records in prop::collection::vec((0i64..i64::MAX, 1i32..i32::MAX, any::<i32>(), any::<i32>()), 1..20)
    ) {
        let (store, _) = memory_store(small_config());
        for (i, (offset, size, ts, group)) in records.iter().enumerate() {
            let table_offset = store.append_prepared(*offset, *size, *ts, *group).unwrap();
            prop_assert_eq!(table_offset, TableOffset::new(i as u64));
        }
        for (i, (offset, size, ts, group)) in records.iter().enumerate() {
            let record = store.find_record(TableOffset::new(i as u64)).unwrap().unwrap().record();
            prop_assert_eq!(record, StateRecord::prepared(*offset, *size, *ts, *group));
        }
    }

    #[test]
    fn mismatch_never_mutates(
        offset in 0i64..1_000_000,
        group in any::<i32>(),
        delta in 1i64..1000,
        resolve_first in any::<bool>(),
    ) {
        let (store, _) = memory_store(small_config());
        let ts = store.append_prepared(offset, 1, 0, group).unwrap();
        if resolve_first {
            store.update_state(ts, offset, group, TransactionState::Committed).unwrap();
        }
        let before = store.find_record(ts).unwrap().unwrap().record();

        let result = store.update_state(ts, offset + delta, group, TransactionState::RolledBack);
        prop_assert!(result.unwrap_err().is_mismatch());
        let result = store.update_state(ts, offset, group.wrapping_add(1), TransactionState::RolledBack);
        prop_assert!(result.unwrap_err().is_mismatch());

        prop_assert_eq!(store.find_record(ts).unwrap().unwrap().record(), before);
    }
}
