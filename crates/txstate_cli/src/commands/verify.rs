//! Verify command implementation.
//!
//! Runs the clean-restart validation over every segment without truncating
//! anything.

use super::{open_redo, open_table};
use std::path::Path;
use txstate_core::log::SegmentedLog;
use txstate_core::{Config, RedoEntry, StateRecord, RAW_ENTRY_SIZE};

/// Result of validating one log.
#[derive(Debug, PartialEq, Eq)]
pub struct LogCheck {
    /// Log name.
    pub name: &'static str,
    /// End of the longest valid prefix.
    pub valid_end: u64,
    /// End of the written data.
    pub max_offset: u64,
    /// Unit size in bytes.
    pub unit_size: usize,
}

impl LogCheck {
    /// Returns true if every written byte belongs to a valid unit.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.valid_end == self.max_offset
    }
}

/// Runs the verify command.
pub fn run(path: &Path, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let checks = verify(path, config)?;
    let mut errors = 0;
    for check in &checks {
        if check.is_ok() {
            println!(
                "  {}: OK ({} units)",
                check.name,
                check.max_offset / check.unit_size as u64
            );
        } else {
            errors += 1;
            tracing::warn!(
                log = check.name,
                valid_end = check.valid_end,
                max_offset = check.max_offset,
                "log has invalid trailing data"
            );
            println!(
                "  {}: invalid unit {} at offset {}, {} trailing bytes would be truncated",
                check.name,
                check.valid_end / check.unit_size as u64,
                check.valid_end,
                check.max_offset - check.valid_end
            );
        }
    }

    println!();
    if errors > 0 {
        return Err(format!("Verification failed for {errors} log(s)").into());
    }
    println!("Store verified");
    Ok(())
}

fn verify(path: &Path, config: &Config) -> Result<Vec<LogCheck>, Box<dyn std::error::Error>> {
    let table = open_table(path, config)?;
    let redo = open_redo(path, config)?;

    Ok(vec![
        check_log("state table", table.log(), StateRecord::SIZE, |raw| {
            StateRecord::decode(raw).is_ok_and(|record| record.is_valid())
        })?,
        check_log("redo log", redo.log(), RAW_ENTRY_SIZE, RedoEntry::is_valid_raw)?,
    ])
}

fn check_log<F>(
    name: &'static str,
    log: &SegmentedLog,
    unit_size: usize,
    is_valid: F,
) -> Result<LogCheck, Box<dyn std::error::Error>>
where
    F: Fn(&[u8]) -> bool,
{
    let segments = log.segments().len();
    let valid_end = log.scan_valid_prefix(unit_size, segments, is_valid)?;
    Ok(LogCheck {
        name,
        valid_end,
        max_offset: log.max_offset(),
        unit_size,
    })
}
