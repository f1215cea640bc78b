//! # txstate storage
//!
//! Byte-store backends for the transaction state store.
//!
//! Backends are **opaque byte stores**: they know nothing about state
//! records, redo entries or segments. A backend holds the bytes of exactly
//! one segment; the segmented log in `txstate_core` owns all format
//! interpretation.
//!
//! ## Design Principles
//!
//! - Backends support read, append, in-place overwrite, truncate and flush
//! - `write_at` only overwrites bytes that were already appended
//! - Must be `Send + Sync` so scan tasks can read while the writer appends
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use txstate_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"prepared").unwrap();
//! backend.write_at(offset, b"P").unwrap();
//! assert_eq!(backend.read_at(offset, 8).unwrap(), b"Prepared");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
