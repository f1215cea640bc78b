//! txstate CLI
//!
//! Command-line tools for transaction state stores.
//!
//! # Commands
//!
//! - `inspect` - Display segment layout and record counts
//! - `dump-table` - Dump state table records
//! - `dump-redo` - Dump decoded redo log entries
//! - `verify` - Check that both logs are valid up to their end
//!
//! Stores are opened without taking the lock or touching the abort marker.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use txstate_core::Config;

/// Transaction state store tools.
#[derive(Parser)]
#[command(name = "txstate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Records per state table segment
    #[arg(global = true, long, default_value_t = 2_000_000)]
    table_segment_records: u64,

    /// Entries per redo log segment
    #[arg(global = true, long, default_value_t = 2_000_000)]
    redo_segment_entries: u64,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display segment layout and record counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump state table records
    DumpTable {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this table offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump redo log entries
    DumpRedo {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify that both logs are valid up to their end
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::default()
        .state_table_records_per_segment(cli.table_segment_records)
        .redo_log_entries_per_segment(cli.redo_segment_entries);
    config.validate()?;

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &config, &format)?;
        }
        Commands::DumpTable {
            limit,
            offset,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-table")?;
            commands::dump_table::run(&path, &config, limit, offset, &format)?;
        }
        Commands::DumpRedo { limit, format } => {
            let path = cli.path.ok_or("Store path required for dump-redo")?;
            commands::dump_redo::run(&path, &config, limit, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, &config)?;
        }
        Commands::Version => {
            println!("txstate CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("txstate core v{}", txstate_core::VERSION);
        }
    }

    Ok(())
}
