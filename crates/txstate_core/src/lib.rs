//! # txstate core
//!
//! Transactional state for a message store's two-phase commit.
//!
//! This crate provides:
//! - The transaction state table: one fixed-width record per prepared
//!   transaction, resolved in place
//! - The redo log of prepare and resolve events
//! - Recovery after clean exits and crashes
//! - Periodic checks of transactions left Prepared too long
//!
//! Both logs are [segmented](log) and live under one [store
//! directory](dir::StoreDir) guarded by an advisory lock.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod check;
mod config;
pub mod dir;
mod error;
pub mod log;
mod record;
pub mod recovery;
pub mod redo;
mod store;
mod table;
mod types;

pub use check::{
    now_millis, scan_segment, BoxError, CheckRequest, CheckScheduler, CheckSettings, ScanOutcome,
    TransactionChecker,
};
pub use config::Config;
pub use dir::StoreDir;
pub use error::{CoreError, CoreResult};
pub use record::StateRecord;
pub use recovery::{MessageLookup, MessageMeta, RecoveryMode, RecoveryReport};
pub use redo::{RedoBatch, RedoEntry, RedoLog, PREPARED_TAG, RAW_ENTRY_SIZE};
pub use store::TransactionStore;
pub use table::{RecordView, StateCounts, TransactionStateTable, UpdateOutcome};
pub use types::{producer_group_hash, TableOffset, TransactionState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
