//! Store configuration.

use crate::error::{CoreError, CoreResult};
use crate::record::StateRecord;
use crate::redo::RAW_ENTRY_SIZE;
use std::time::Duration;

/// Configuration for opening a transaction state store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of one state table segment in bytes (multiple of 24).
    pub state_table_segment_size: u64,

    /// Capacity of one redo log segment in bytes (multiple of 20).
    pub redo_log_segment_size: u64,

    /// A prepared transaction younger than this is never checked.
    pub check_min_age: Duration,

    /// Period between two scans of the same segment.
    pub check_interval: Duration,

    /// Delay between registering a segment and its first scan.
    pub check_first_delay: Duration,

    /// Number of trailing segments re-validated on a clean restart.
    pub recovery_tail_segments: usize,

    /// Whether to fsync every segment on clean shutdown.
    pub sync_on_shutdown: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_table_segment_size: 2_000_000 * StateRecord::SIZE as u64,
            redo_log_segment_size: 2_000_000 * RAW_ENTRY_SIZE as u64,
            check_min_age: Duration::from_secs(60),
            check_interval: Duration::from_secs(60),
            check_first_delay: Duration::from_secs(60),
            recovery_tail_segments: 3,
            sync_on_shutdown: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state table segment capacity in records.
    #[must_use]
    pub const fn state_table_records_per_segment(mut self, records: u64) -> Self {
        self.state_table_segment_size = records * StateRecord::SIZE as u64;
        self
    }

    /// Sets the redo log segment capacity in entries.
    #[must_use]
    pub const fn redo_log_entries_per_segment(mut self, entries: u64) -> Self {
        self.redo_log_segment_size = entries * RAW_ENTRY_SIZE as u64;
        self
    }

    /// Sets the minimum age before a prepared transaction is checked.
    #[must_use]
    pub const fn check_min_age(mut self, age: Duration) -> Self {
        self.check_min_age = age;
        self
    }

    /// Sets the period between scans of one segment.
    #[must_use]
    pub const fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the delay before a newly registered segment is first scanned.
    #[must_use]
    pub const fn check_first_delay(mut self, delay: Duration) -> Self {
        self.check_first_delay = delay;
        self
    }

    /// Sets how many trailing segments a clean restart re-validates.
    #[must_use]
    pub const fn recovery_tail_segments(mut self, segments: usize) -> Self {
        self.recovery_tail_segments = segments;
        self
    }

    /// Sets whether shutdown fsyncs every segment.
    #[must_use]
    pub const fn sync_on_shutdown(mut self, value: bool) -> Self {
        self.sync_on_shutdown = value;
        self
    }

    /// Checks that segment sizes hold a whole number of units.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if a segment size is zero or not a multiple of
    /// its unit size, if `recovery_tail_segments` is zero, or if the check
    /// interval is zero.
    pub fn validate(&self) -> CoreResult<()> {
        check_segment_size(
            "state table",
            self.state_table_segment_size,
            StateRecord::SIZE,
        )?;
        check_segment_size("redo log", self.redo_log_segment_size, RAW_ENTRY_SIZE)?;

        if self.recovery_tail_segments == 0 {
            return Err(CoreError::invalid_format(
                "recovery_tail_segments must be at least 1",
            ));
        }
        if self.check_interval.is_zero() {
            return Err(CoreError::invalid_format("check_interval must be non-zero"));
        }
        Ok(())
    }
}

fn check_segment_size(name: &str, size: u64, unit: usize) -> CoreResult<()> {
    if size == 0 || size % unit as u64 != 0 {
        return Err(CoreError::invalid_format(format!(
            "{name} segment size {size} is not a positive multiple of {unit}"
        )));
    }
    Ok(())
}
