//! CLI command implementations.

pub mod dump_redo;
pub mod dump_table;
pub mod inspect;
pub mod verify;

use std::path::Path;
use std::sync::Arc;
use txstate_core::{dir, BoxError, CheckRequest, Config, RedoLog, TransactionStateTable};

/// Opens the state table of the store at `path` for reading.
///
/// A missing `statetable/` directory reads as an empty table and is not
/// created.
pub(crate) fn open_table(
    path: &Path,
    config: &Config,
) -> Result<TransactionStateTable, Box<dyn std::error::Error>> {
    let (table_dir, _) = existing_dirs(path)?;
    let checker = Arc::new(|_: &CheckRequest| -> Result<(), BoxError> { Ok(()) });
    if !table_dir.is_dir() {
        tracing::debug!(dir = %table_dir.display(), "state table missing, reading as empty");
        return Ok(TransactionStateTable::in_memory(config, checker));
    }
    let table = TransactionStateTable::open(&table_dir, config, checker)?;
    table.load()?;
    tracing::debug!(
        dir = %table_dir.display(),
        segments = table.log().segments().len(),
        "state table opened"
    );
    Ok(table)
}

/// Opens the redo log of the store at `path` for reading.
///
/// A missing `redolog/` directory reads as an empty log and is not created.
pub(crate) fn open_redo(path: &Path, config: &Config) -> Result<RedoLog, Box<dyn std::error::Error>> {
    let (_, redo_dir) = existing_dirs(path)?;
    if !redo_dir.is_dir() {
        tracing::debug!(dir = %redo_dir.display(), "redo log missing, reading as empty");
        return Ok(RedoLog::in_memory(config));
    }
    let redo = RedoLog::open(&redo_dir, config)?;
    redo.load()?;
    tracing::debug!(dir = %redo_dir.display(), max_offset = redo.max_offset(), "redo log opened");
    Ok(redo)
}

fn existing_dirs(
    path: &Path,
) -> Result<(std::path::PathBuf, std::path::PathBuf), Box<dyn std::error::Error>> {
    let (table_dir, redo_dir) = dir::segment_dirs(path);
    if !table_dir.is_dir() && !redo_dir.is_dir() {
        return Err(format!("No transaction store found at {}", path.display()).into());
    }
    Ok((table_dir, redo_dir))
}
