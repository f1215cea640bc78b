//! Inspect command implementation.

use super::{open_redo, open_table};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use txstate_core::log::{Segment, SegmentedLog};
use txstate_core::{Config, StateCounts};

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// State table layout.
    pub state_table: LogStats,
    /// Redo log layout.
    pub redo_log: LogStats,
    /// Table offset the next append will receive.
    pub next_table_offset: u64,
    /// Prepared records.
    pub prepared: u64,
    /// Committed records.
    pub committed: u64,
    /// Rolled-back records.
    pub rolled_back: u64,
    /// Records with an unknown state code.
    pub unknown: u64,
}

/// Layout of one segmented log.
#[derive(Debug, Serialize)]
pub struct LogStats {
    /// Segment capacity in bytes.
    pub segment_size: u64,
    /// Offset of the first retained byte.
    pub min_offset: u64,
    /// Offset just past the last written byte.
    pub max_offset: u64,
    /// Segments, oldest first.
    pub segments: Vec<SegmentStats>,
}

/// One segment.
#[derive(Debug, Serialize)]
pub struct SegmentStats {
    /// File name.
    pub name: String,
    /// Bytes written.
    pub wrote: u64,
    /// Whether the segment is full.
    pub full: bool,
}

/// Runs the inspect command.
pub fn run(path: &Path, config: &Config, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, config)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn inspect(path: &Path, config: &Config) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let table = open_table(path, config)?;
    let redo = open_redo(path, config)?;
    let StateCounts {
        prepared,
        committed,
        rolled_back,
        unknown,
    } = table.state_counts()?;
    tracing::debug!(path = %path.display(), prepared, committed, rolled_back, "store inspected");

    Ok(InspectResult {
        path: path.display().to_string(),
        state_table: log_stats(table.log()),
        redo_log: log_stats(redo.log()),
        next_table_offset: table.next_table_offset().as_u64(),
        prepared,
        committed,
        rolled_back,
        unknown,
    })
}

fn log_stats(log: &SegmentedLog) -> LogStats {
    LogStats {
        segment_size: log.segment_size(),
        min_offset: log.min_offset(),
        max_offset: log.max_offset(),
        segments: log.segments().iter().map(segment_stats).collect(),
    }
}

fn segment_stats(segment: &Arc<Segment>) -> SegmentStats {
    SegmentStats {
        name: segment.name(),
        wrote: segment.wrote_position(),
        full: segment.is_full(),
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Transaction Store Inspection");
    println!("============================");
    println!();
    println!("Path: {}", result.path);
    println!();
    print_log("State table", &result.state_table);
    println!();
    print_log("Redo log", &result.redo_log);
    println!();
    println!("Records:");
    println!("  Next table offset: {}", result.next_table_offset);
    println!("  Prepared:          {}", result.prepared);
    println!("  Committed:         {}", result.committed);
    println!("  Rolled back:       {}", result.rolled_back);
    if result.unknown > 0 {
        println!("  Unknown state:     {}", result.unknown);
    }
}

fn print_log(title: &str, stats: &LogStats) {
    println!("{title}:");
    println!("  Segment size: {} bytes", stats.segment_size);
    println!("  Offsets:      {}..{}", stats.min_offset, stats.max_offset);
    for segment in &stats.segments {
        println!(
            "  {} {:>12} bytes{}",
            segment.name,
            segment.wrote,
            if segment.full { " (full)" } else { "" }
        );
    }
}
