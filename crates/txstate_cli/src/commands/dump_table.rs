//! Dump table command implementation.

use super::open_table;
use serde::Serialize;
use std::path::Path;
use txstate_core::{Config, TableOffset};

/// State record representation for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Table offset of the record.
    pub table_offset: u64,
    /// Offset of the prepared message in the primary log.
    pub commit_log_offset: i64,
    /// Size of the prepared message.
    pub message_size: i32,
    /// Creation time in seconds.
    pub timestamp: i32,
    /// Producer group hash.
    pub group_hash: i32,
    /// State name, or the raw code if unknown.
    pub state: String,
}

/// Runs the dump-table command.
pub fn run(
    path: &Path,
    config: &Config,
    limit: Option<usize>,
    start_offset: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = read_records(path, config, limit, start_offset)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

fn read_records(
    path: &Path,
    config: &Config,
    limit: Option<usize>,
    start_offset: u64,
) -> Result<Vec<RecordInfo>, Box<dyn std::error::Error>> {
    let table = open_table(path, config)?;
    let records = table.scan_records(TableOffset::new(start_offset), limit.unwrap_or(usize::MAX))?;

    Ok(records
        .into_iter()
        .map(|(table_offset, record)| RecordInfo {
            table_offset: table_offset.as_u64(),
            commit_log_offset: record.commit_log_offset,
            message_size: record.message_size,
            timestamp: record.timestamp,
            group_hash: record.group_hash,
            state: record
                .state()
                .map_or_else(|| format!("0x{:x}", record.state_code), |s| s.to_string()),
        })
        .collect())
}

fn print_text_output(records: &[RecordInfo]) {
    println!(
        "{:>12}  {:>20}  {:>10}  {:>11}  {:>11}  STATE",
        "TS_OFFSET", "COMMIT_LOG_OFFSET", "SIZE", "TIMESTAMP", "GROUP_HASH"
    );
    for record in records {
        println!(
            "{:>12}  {:>20}  {:>10}  {:>11}  {:>11}  {}",
            record.table_offset,
            record.commit_log_offset,
            record.message_size,
            record.timestamp,
            record.group_hash,
            record.state
        );
    }
    println!();
    println!("{} records", records.len());
}
