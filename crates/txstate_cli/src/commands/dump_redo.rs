//! Dump redo command implementation.

use super::open_redo;
use serde::Serialize;
use std::path::Path;
use txstate_core::{Config, RedoEntry, RAW_ENTRY_SIZE};

/// Redo entry representation for output.
#[derive(Debug, Serialize)]
pub struct RedoEntryInfo {
    /// Offset of the entry in the redo log.
    pub offset: u64,
    /// Entry kind.
    pub kind: &'static str,
    /// Offset of the message the entry was written for.
    pub message_offset: i64,
    /// Size of that message.
    pub message_size: i32,
    /// Prepared message being resolved (resolutions only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared_offset: Option<i64>,
}

/// Runs the dump-redo command.
pub fn run(
    path: &Path,
    config: &Config,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = read_entries(path, config, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }

    Ok(())
}

fn read_entries(
    path: &Path,
    config: &Config,
    limit: Option<usize>,
) -> Result<Vec<RedoEntryInfo>, Box<dyn std::error::Error>> {
    let redo = open_redo(path, config)?;
    let max_entries = limit.unwrap_or(usize::MAX);
    let mut entries = Vec::new();
    let mut offset = redo.min_offset();

    'segments: while let Some(batch) = redo.read_from(offset)? {
        for (position, entry) in (batch.start_offset()..)
            .step_by(RAW_ENTRY_SIZE)
            .zip(batch.entries())
        {
            if entries.len() >= max_entries {
                break 'segments;
            }
            entries.push(entry_info(position, entry));
        }
        offset += batch.byte_len();
    }

    Ok(entries)
}

fn entry_info(offset: u64, entry: RedoEntry) -> RedoEntryInfo {
    let (kind, prepared_offset) = match entry {
        RedoEntry::Prepared { .. } => ("PREPARED", None),
        RedoEntry::Resolved {
            prepared_offset, ..
        } => ("RESOLVED", Some(prepared_offset)),
    };
    RedoEntryInfo {
        offset,
        kind,
        message_offset: entry.message_offset(),
        message_size: entry.message_size(),
        prepared_offset,
    }
}

fn print_text_output(entries: &[RedoEntryInfo]) {
    for entry in entries {
        match entry.prepared_offset {
            Some(prepared) => println!(
                "[{:>12}] {} message={} size={} prepared={}",
                entry.offset, entry.kind, entry.message_offset, entry.message_size, prepared
            ),
            None => println!(
                "[{:>12}] {} message={} size={}",
                entry.offset, entry.kind, entry.message_offset, entry.message_size
            ),
        }
    }
    println!();
    println!("{} entries", entries.len());
}
