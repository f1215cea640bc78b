//! Store directory management.
//!
//! ```text
//! <store>/
//! ├─ LOCK          # Advisory lock for single-writer
//! ├─ ABORT         # Present while the store is running
//! ├─ statetable/   # State table segments
//! └─ redolog/      # Redo log segments
//! ```
//!
//! The ABORT marker is created when the store opens and removed by a clean
//! shutdown. Finding it on open means the previous run crashed.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const ABORT_FILE: &str = "ABORT";
const STATE_TABLE_DIR: &str = "statetable";
const REDO_LOG_DIR: &str = "redolog";

/// Holds the exclusive lock on a store directory.
///
/// # Example
///
/// ```rust,ignore
/// let dir = StoreDir::open(Path::new("store"))?;
/// let clean = dir.last_exit_ok();
/// dir.mark_running()?;
/// ```
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    last_exit_ok: bool,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns `StoreLocked` if another process holds the lock,
    /// `InvalidFormat` if the path is not a directory, or an I/O error.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        let last_exit_ok = !path.join(ABORT_FILE).exists();
        if !last_exit_ok {
            tracing::warn!(path = %path.display(), "abort marker found, previous run did not shut down cleanly");
        }

        Ok(Self {
            path: path.to_path_buf(),
            last_exit_ok,
            _lock_file: lock_file,
        })
    }

    /// Root directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if no abort marker was present when the directory was
    /// opened.
    #[must_use]
    pub fn last_exit_ok(&self) -> bool {
        self.last_exit_ok
    }

    /// Directory of the state table segments.
    #[must_use]
    pub fn state_table_dir(&self) -> PathBuf {
        self.path.join(STATE_TABLE_DIR)
    }

    /// Directory of the redo log segments.
    #[must_use]
    pub fn redo_log_dir(&self) -> PathBuf {
        self.path.join(REDO_LOG_DIR)
    }

    /// Creates the abort marker.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker cannot be written.
    pub fn mark_running(&self) -> CoreResult<()> {
        let marker = File::create(self.path.join(ABORT_FILE))?;
        marker.sync_all()?;
        Ok(())
    }

    /// Removes the abort marker.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker exists and cannot be removed.
    pub fn mark_clean_shutdown(&self) -> CoreResult<()> {
        match fs::remove_file(self.path.join(ABORT_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Paths of an existing store's segment directories, opened without taking
/// the lock.
///
/// Used by tooling that only reads.
#[must_use]
pub fn segment_dirs(path: &Path) -> (PathBuf, PathBuf) {
    (path.join(STATE_TABLE_DIR), path.join(REDO_LOG_DIR))
}
