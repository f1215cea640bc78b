//! Background checks of long-prepared transactions.
//!
//! Every state table segment gets one repeating task. A run scans the
//! segment from its first record and asks the [`TransactionChecker`] about
//! each Prepared record old enough to be worth a check. Tasks cancel
//! themselves once their segment is sealed with nothing left Prepared, or
//! once the segment has been deleted.
//!
//! All tasks share one timer thread. The registry of tasks is owned by the
//! [`CheckScheduler`], which the state table creates on start and drops on
//! shutdown.

use crate::config::Config;
use crate::error::CoreResult;
use crate::log::Segment;
use crate::record::StateRecord;
use crate::types::TableOffset;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Error type returned by checkers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A request to resolve a transaction that has stayed Prepared too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckRequest {
    /// Hash of the producer group owning the transaction.
    pub group_hash: i32,
    /// Table offset of the record, to be passed back on resolution.
    pub table_offset: TableOffset,
    /// Offset of the prepared message in the primary log.
    pub commit_log_offset: i64,
    /// Size of the prepared message.
    pub message_size: i32,
}

/// Asks a transaction's producer for its outcome.
///
/// The answer arrives out of band as a later state update; the return value
/// is only used for logging.
pub trait TransactionChecker: Send + Sync {
    /// Requests a check of one transaction.
    ///
    /// # Errors
    ///
    /// Any error is logged and otherwise ignored.
    fn check(&self, request: &CheckRequest) -> Result<(), BoxError>;
}

impl<F> TransactionChecker for F
where
    F: Fn(&CheckRequest) -> Result<(), BoxError> + Send + Sync,
{
    fn check(&self, request: &CheckRequest) -> Result<(), BoxError> {
        self(request)
    }
}

/// Timing of check tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckSettings {
    /// Prepared records younger than this end the scan.
    pub min_age: Duration,
    /// Period between two runs of one task.
    pub interval: Duration,
    /// Delay before the first run of a new task.
    pub first_delay: Duration,
}

impl From<&Config> for CheckSettings {
    fn from(config: &Config) -> Self {
        Self {
            min_age: config.check_min_age,
            interval: config.check_interval,
            first_delay: config.check_first_delay,
        }
    }
}

/// Result of scanning one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOutcome {
    /// Prepared records old enough to be checked.
    pub checked: u64,
    /// Records visited before the scan ended.
    pub scanned: u64,
    /// Whether the scan stopped at a record younger than the minimum age.
    pub stopped_early: bool,
    /// Whether the scan was abandoned because the scheduler stopped.
    pub interrupted: bool,
    /// Whether the task should not run again.
    pub cancel: bool,
}

/// Scans `segment` once and calls `checker` for every overdue Prepared
/// record.
///
/// `now_ms` is the current wall-clock time in milliseconds. Records are
/// assumed to be appended in non-decreasing timestamp order: the first
/// Prepared record younger than `min_age` ends the scan.
///
/// `stop` is read before every checker call; once set, the rest of the
/// segment is left for a later run.
///
/// # Errors
///
/// Returns a storage error if the segment cannot be read.
pub fn scan_segment(
    segment: &Arc<Segment>,
    checker: &dyn TransactionChecker,
    min_age: Duration,
    now_ms: i64,
    stop: &AtomicBool,
) -> CoreResult<ScanOutcome> {
    let Some(view) = segment.map_whole()? else {
        let deleted = !segment.is_available();
        if deleted {
            tracing::info!(
                segment = %segment.name(),
                "segment deleted, cancelling transaction check task"
            );
        }
        return Ok(ScanOutcome {
            cancel: deleted,
            ..ScanOutcome::default()
        });
    };

    let min_age_ms = i64::try_from(min_age.as_millis()).unwrap_or(i64::MAX);
    let mut outcome = ScanOutcome::default();

    let first_index = view.start_offset() / StateRecord::SIZE as u64;
    for (index, raw) in (first_index..).zip(view.bytes().chunks_exact(StateRecord::SIZE)) {
        let record = StateRecord::decode(raw)?;
        if !record.is_prepared() {
            outcome.scanned += 1;
            continue;
        }

        let age_ms = now_ms - i64::from(record.timestamp) * 1000;
        if age_ms < min_age_ms {
            outcome.stopped_early = true;
            break;
        }
        if stop.load(Ordering::Acquire) {
            outcome.interrupted = true;
            break;
        }
        outcome.scanned += 1;
        outcome.checked += 1;

        let request = CheckRequest {
            group_hash: record.group_hash,
            table_offset: TableOffset::new(index),
            commit_log_offset: record.commit_log_offset,
            message_size: record.message_size,
        };
        invoke(checker, &request);
    }

    let scanned_bytes = outcome.scanned * StateRecord::SIZE as u64;
    outcome.cancel = outcome.checked == 0
        && !outcome.stopped_early
        && !outcome.interrupted
        && scanned_bytes == segment.capacity();

    if outcome.cancel {
        tracing::info!(
            segment = %segment.name(),
            "no prepared transaction left in sealed segment, cancelling check task"
        );
    }
    tracing::debug!(
        segment = %segment.name(),
        checked = outcome.checked,
        progress = outcome.scanned,
        total = segment.capacity() / StateRecord::SIZE as u64,
        "transaction check pass over"
    );
    Ok(outcome)
}

fn invoke(checker: &dyn TransactionChecker, request: &CheckRequest) {
    match panic::catch_unwind(AssertUnwindSafe(|| checker.check(request))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(
            table_offset = %request.table_offset,
            commit_log_offset = request.commit_log_offset,
            error = %e,
            "transaction check failed"
        ),
        Err(_) => tracing::warn!(
            table_offset = %request.table_offset,
            commit_log_offset = request.commit_log_offset,
            "transaction checker panicked"
        ),
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

struct ScheduledTask {
    segment: Arc<Segment>,
    next_run: Instant,
}

struct Shared {
    tasks: Mutex<HashMap<u64, ScheduledTask>>,
    wakeup: Condvar,
    stopped: AtomicBool,
    checker: Arc<dyn TransactionChecker>,
    settings: CheckSettings,
}

/// Registry of per-segment check tasks driven by one timer thread.
pub struct CheckScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CheckScheduler {
    /// Starts the timer thread with an empty registry.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn start(settings: CheckSettings, checker: Arc<dyn TransactionChecker>) -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
            stopped: AtomicBool::new(false),
            checker,
            settings,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("txstate-check".into())
            .spawn(move || run_timer(&worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Registers a task for `segment`, first run after the configured delay.
    ///
    /// Returns false if a live task already covers the segment.
    pub fn register(&self, segment: &Arc<Segment>) -> bool {
        let mut tasks = self.shared.tasks.lock();
        if let Some(existing) = tasks.get(&segment.start_offset()) {
            if existing.segment.is_available() {
                return false;
            }
        }

        tasks.insert(
            segment.start_offset(),
            ScheduledTask {
                segment: Arc::clone(segment),
                next_run: Instant::now() + self.shared.settings.first_delay,
            },
        );
        drop(tasks);
        self.shared.wakeup.notify_all();
        tracing::debug!(segment = %segment.name(), "transaction check task registered");
        true
    }

    /// Number of live tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Returns true if a task exists for the segment starting at `start_offset`.
    #[must_use]
    pub fn is_registered(&self, start_offset: u64) -> bool {
        self.shared.tasks.lock().contains_key(&start_offset)
    }

    /// Stops the timer thread. Pending runs are abandoned; a scan in
    /// progress ends after the checker call it is waiting on.
    pub fn shutdown(&self) {
        {
            let _tasks = self.shared.tasks.lock();
            self.shared.stopped.store(true, Ordering::Release);
        }
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("transaction check thread panicked");
            }
        }
        self.shared.tasks.lock().clear();
    }
}

impl Drop for CheckScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CheckScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckScheduler")
            .field("settings", &self.shared.settings)
            .field("tasks", &self.task_count())
            .finish_non_exhaustive()
    }
}

fn run_timer(shared: &Shared) {
    let mut tasks = shared.tasks.lock();

    while !shared.stopped.load(Ordering::Acquire) {
        let now = Instant::now();
        let due: Vec<(u64, Arc<Segment>)> = tasks
            .iter_mut()
            .filter(|(_, task)| task.next_run <= now)
            .map(|(start, task)| {
                task.next_run = now + shared.settings.interval;
                (*start, Arc::clone(&task.segment))
            })
            .collect();

        if due.is_empty() {
            match tasks.values().map(|task| task.next_run).min() {
                Some(deadline) => {
                    shared.wakeup.wait_until(&mut tasks, deadline);
                }
                None => shared.wakeup.wait(&mut tasks),
            }
            continue;
        }

        let cancelled = MutexGuard::unlocked(&mut tasks, || run_due(shared, &due));
        remove_cancelled(&mut tasks, &cancelled);
    }
}

/// Drops finished tasks, keeping any task re-registered for a new segment
/// at the same start offset while the lock was released.
fn remove_cancelled(tasks: &mut HashMap<u64, ScheduledTask>, cancelled: &[(u64, Arc<Segment>)]) {
    for (start, segment) in cancelled {
        if tasks
            .get(start)
            .is_some_and(|task| Arc::ptr_eq(&task.segment, segment))
        {
            tasks.remove(start);
        }
    }
}

fn run_due(shared: &Shared, due: &[(u64, Arc<Segment>)]) -> Vec<(u64, Arc<Segment>)> {
    let mut cancelled = Vec::new();
    for (start, segment) in due {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        match scan_segment(
            segment,
            shared.checker.as_ref(),
            shared.settings.min_age,
            now_millis(),
            &shared.stopped,
        ) {
            Ok(outcome) if outcome.cancel => cancelled.push((*start, Arc::clone(segment))),
            Ok(_) => {}
            Err(e) => {
                tracing::error!(segment = %segment.name(), error = %e, "transaction check task failed");
            }
        }
    }
    cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionState;
    use txstate_storage::InMemoryBackend;

    const NOW_MS: i64 = 1_700_000_000_000;
    const MIN_AGE: Duration = Duration::from_secs(60);
    static RUNNING: AtomicBool = AtomicBool::new(false);

    fn segment_with(records: &[StateRecord], capacity_records: u64) -> Arc<Segment> {
        segment_at(0, records, capacity_records)
    }

    fn segment_at(start: u64, records: &[StateRecord], capacity_records: u64) -> Arc<Segment> {
        let segment = Arc::new(
            Segment::new(
                start,
                capacity_records * StateRecord::SIZE as u64,
                None,
                Box::new(InMemoryBackend::new()),
            )
            .unwrap(),
        );
        for record in records {
            segment.append(&record.encode()).unwrap();
        }
        segment
    }

    fn old(offset: i64) -> StateRecord {
        StateRecord::prepared(offset, 100, (NOW_MS / 1000 - 3600) as i32, 7)
    }

    fn young(offset: i64) -> StateRecord {
        StateRecord::prepared(offset, 100, (NOW_MS / 1000 - 10) as i32, 7)
    }

    fn resolved(offset: i64, state: TransactionState) -> StateRecord {
        let mut record = old(offset);
        record.state_code = state.code();
        record
    }

    fn recording() -> (Arc<Mutex<Vec<CheckRequest>>>, impl TransactionChecker) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let checker = move |request: &CheckRequest| -> Result<(), BoxError> {
            sink.lock().push(*request);
            Ok(())
        };
        (seen, checker)
    }

    #[test]
    fn resolved_sealed_segment_cancels() {
        let segment = segment_with(
            &[
                resolved(0, TransactionState::Committed),
                resolved(100, TransactionState::RolledBack),
            ],
            2,
        );
        let (seen, checker) = recording();

        let outcome = scan_segment(&segment, &checker, MIN_AGE, NOW_MS, &RUNNING).unwrap();
        assert!(outcome.cancel);
        assert_eq!(outcome.scanned, 2);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn unsealed_segment_keeps_running() {
        let segment = segment_with(&[resolved(0, TransactionState::Committed)], 4);
        let (_, checker) = recording();

        let outcome = scan_segment(&segment, &checker, MIN_AGE, NOW_MS, &RUNNING).unwrap();
        assert!(!outcome.cancel);
    }

    #[test]
    fn young_record_stops_scan_without_check() {
        let segment = segment_with(&[young(0), old(100)], 2);
        let (seen, checker) = recording();

        let outcome = scan_segment(&segment, &checker, MIN_AGE, NOW_MS, &RUNNING).unwrap();
        assert!(outcome.stopped_early);
        assert!(!outcome.cancel);
        assert_eq!(outcome.checked, 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn old_prepared_records_are_checked_with_table_offsets() {
        let segment = segment_with(
            &[
                old(1000),
                resolved(2000, TransactionState::Committed),
                old(3000),
                young(4000),
            ],
            8,
        );
        let (seen, checker) = recording();

        let outcome = scan_segment(&segment, &checker, MIN_AGE, NOW_MS, &RUNNING).unwrap();
        assert_eq!(outcome.checked, 2);
        assert!(outcome.stopped_early);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].table_offset, TableOffset::new(0));
        assert_eq!(seen[0].commit_log_offset, 1000);
        assert_eq!(seen[1].table_offset, TableOffset::new(2));
        assert_eq!(seen[1].commit_log_offset, 3000);
        assert_eq!(seen[1].group_hash, 7);
        assert_eq!(seen[1].message_size, 100);
    }

    #[test]
    fn failing_checker_does_not_abort_scan() {
        let segment = segment_with(&[old(1), old(2), old(3)], 3);
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let checker = move |request: &CheckRequest| -> Result<(), BoxError> {
            *counter.lock() += 1;
            match request.commit_log_offset {
                1 => Err("producer unreachable".into()),
                2 => panic!("checker bug"),
                _ => Ok(()),
            }
        };

        let outcome = scan_segment(&segment, &checker, MIN_AGE, NOW_MS, &RUNNING).unwrap();
        assert_eq!(outcome.checked, 3);
        assert_eq!(*calls.lock(), 3);
        assert!(!outcome.cancel);
    }

    #[test]
    fn deleted_segment_cancels() {
        let segment = segment_with(&[old(1)], 2);
        segment.destroy();
        let (seen, checker) = recording();

        let outcome = scan_segment(&segment, &checker, MIN_AGE, NOW_MS, &RUNNING).unwrap();
        assert!(outcome.cancel);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn scheduler_runs_and_drops_finished_tasks() {
        let settings = CheckSettings {
            min_age: Duration::ZERO,
            interval: Duration::from_millis(10),
            first_delay: Duration::ZERO,
        };
        let (seen, checker) = recording();
        let scheduler = CheckScheduler::start(settings, Arc::new(checker)).unwrap();

        let finished = segment_with(&[resolved(0, TransactionState::Committed)], 1);
        let pending = segment_at(24, &[old(42)], 1);

        assert!(scheduler.register(&finished));
        assert!(scheduler.register(&pending));
        assert!(!scheduler.register(&pending));

        let deadline = Instant::now() + Duration::from_secs(5);
        while (scheduler.is_registered(0) || seen.lock().is_empty()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!scheduler.is_registered(0));
        assert!(scheduler.is_registered(24));
        assert_eq!(seen.lock()[0].table_offset, TableOffset::new(1));

        scheduler.shutdown();
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn stop_flag_skips_remaining_checks() {
        let segment = segment_with(&[old(1), old(2)], 2);
        let (seen, checker) = recording();
        let stop = AtomicBool::new(true);

        let outcome = scan_segment(&segment, &checker, MIN_AGE, NOW_MS, &stop).unwrap();
        assert!(outcome.interrupted);
        assert!(!outcome.cancel);
        assert_eq!(outcome.checked, 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn cancellation_keeps_replacement_task() {
        let stale = segment_with(&[], 1);
        let replacement = segment_with(&[], 1);
        let mut tasks = HashMap::new();
        tasks.insert(
            0,
            ScheduledTask {
                segment: Arc::clone(&replacement),
                next_run: Instant::now(),
            },
        );

        remove_cancelled(&mut tasks, &[(0, Arc::clone(&stale))]);
        assert!(tasks.contains_key(&0));

        remove_cancelled(&mut tasks, &[(0, replacement)]);
        assert!(tasks.is_empty());
    }

    #[test]
    fn shutdown_does_not_wait_for_rest_of_segment() {
        let settings = CheckSettings {
            min_age: Duration::ZERO,
            interval: Duration::from_secs(60),
            first_delay: Duration::ZERO,
        };
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let slow = move |_: &CheckRequest| -> Result<(), BoxError> {
            *counter.lock() += 1;
            thread::sleep(Duration::from_millis(100));
            Ok(())
        };
        let scheduler = CheckScheduler::start(settings, Arc::new(slow)).unwrap();
        let records: Vec<_> = (0..10).map(old).collect();
        scheduler.register(&segment_with(&records, 10));

        let deadline = Instant::now() + Duration::from_secs(5);
        while *calls.lock() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let before = *calls.lock();
        assert!(before > 0);

        let started = Instant::now();
        scheduler.shutdown();
        assert!(*calls.lock() <= before + 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
