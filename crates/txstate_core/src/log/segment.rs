//! A single log segment and scoped views onto it.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use txstate_storage::StorageBackend;

/// One fixed-capacity unit of a [`super::SegmentedLog`].
pub struct Segment {
    start_offset: u64,
    capacity: u64,
    path: Option<PathBuf>,
    backend: RwLock<Box<dyn StorageBackend>>,
    /// Written length, mirrored from the backend so readers avoid the lock.
    wrote: AtomicU64,
    available: AtomicBool,
    refs: AtomicUsize,
    cleaned: AtomicBool,
}

impl Segment {
    /// Wraps a backend as the segment starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read or already
    /// exceeds `capacity`.
    pub fn new(
        start_offset: u64,
        capacity: u64,
        path: Option<PathBuf>,
        backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let wrote = backend.size()?;
        if wrote > capacity {
            return Err(CoreError::invalid_format(format!(
                "segment {} holds {wrote} bytes, capacity is {capacity}",
                file_name(start_offset)
            )));
        }

        Ok(Self {
            start_offset,
            capacity,
            path,
            backend: RwLock::new(backend),
            wrote: AtomicU64::new(wrote),
            available: AtomicBool::new(true),
            refs: AtomicUsize::new(0),
            cleaned: AtomicBool::new(false),
        })
    }

    /// Byte offset of the segment's first byte within the log.
    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn wrote_position(&self) -> u64 {
        self.wrote.load(Ordering::Acquire)
    }

    /// Returns true once the segment holds `capacity` bytes.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.wrote_position() >= self.capacity
    }

    /// Returns false once the segment has been destroyed.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// The segment's file name (its zero-padded start offset).
    #[must_use]
    pub fn name(&self) -> String {
        file_name(self.start_offset)
    }

    /// Path of the backing file, if the segment is file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends `data`, returning its absolute log offset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the data does not fit in the remaining
    /// capacity, `SegmentUnavailable` after destruction, or a storage error.
    pub(crate) fn append(&self, data: &[u8]) -> CoreResult<u64> {
        self.ensure_available()?;

        let mut backend = self.backend.write();
        let wrote = self.wrote_position();
        if wrote + data.len() as u64 > self.capacity {
            return Err(CoreError::invalid_operation(format!(
                "{} bytes do not fit in segment {} ({wrote}/{})",
                data.len(),
                self.name(),
                self.capacity
            )));
        }

        let position = backend.append(data)?;
        self.wrote
            .store(position + data.len() as u64, Ordering::Release);
        Ok(self.start_offset + position)
    }

    /// Overwrites already written bytes at `position` (segment-relative).
    pub(crate) fn write_at(&self, position: u64, data: &[u8]) -> CoreResult<()> {
        self.ensure_available()?;
        self.backend.write().write_at(position, data)?;
        Ok(())
    }

    /// Drops everything from `position` (segment-relative) on.
    pub(crate) fn truncate(&self, position: u64) -> CoreResult<()> {
        let mut backend = self.backend.write();
        backend.truncate(position)?;
        self.wrote.store(position, Ordering::Release);
        Ok(())
    }

    /// Flushes, and optionally fsyncs, the backend.
    pub(crate) fn flush(&self, sync: bool) -> CoreResult<()> {
        let mut backend = self.backend.write();
        backend.flush()?;
        if sync {
            backend.sync()?;
        }
        Ok(())
    }

    /// Maps every written byte of the segment.
    ///
    /// Returns `None` if the segment is empty or no longer available.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn map_whole(self: &Arc<Self>) -> CoreResult<Option<SegmentView>> {
        self.map_at(0)
    }

    /// Maps the written bytes from `position` (segment-relative) to the end
    /// of the written region.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn map_at(self: &Arc<Self>, position: u64) -> CoreResult<Option<SegmentView>> {
        let wrote = self.wrote_position();
        if position >= wrote {
            return Ok(None);
        }
        self.map_range(position, (wrote - position) as usize)
    }

    /// Maps exactly `len` written bytes at `position` (segment-relative).
    ///
    /// Returns `None` if the range is not fully written or the segment is
    /// no longer available.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn map_range(self: &Arc<Self>, position: u64, len: usize) -> CoreResult<Option<SegmentView>> {
        if len == 0 || position + len as u64 > self.wrote_position() {
            return Ok(None);
        }
        if !self.acquire() {
            return Ok(None);
        }

        // The view releases the reference on every exit path from here on.
        let mut view = SegmentView {
            segment: Arc::clone(self),
            position,
            data: Vec::new(),
        };
        view.data = self.backend.read().read_at(position, len)?;
        Ok(Some(view))
    }

    /// Marks the segment destroyed; the file goes away with the last view.
    pub(crate) fn destroy(&self) {
        self.available.store(false, Ordering::Release);
        if self.refs.load(Ordering::Acquire) == 0 {
            self.cleanup();
        }
    }

    fn acquire(&self) -> bool {
        self.refs.fetch_add(1, Ordering::AcqRel);
        if self.is_available() {
            true
        } else {
            self.release();
            false
        }
    }

    fn release(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && !self.is_available() {
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::info!(segment = %self.name(), "segment file removed"),
                Err(e) => tracing::warn!(segment = %self.name(), error = %e, "failed to remove segment file"),
            }
        }
    }

    fn ensure_available(&self) -> CoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CoreError::SegmentUnavailable {
                start_offset: self.start_offset,
            })
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("start_offset", &self.start_offset)
            .field("capacity", &self.capacity)
            .field("wrote", &self.wrote_position())
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

/// Scoped, reference-counted snapshot of a segment byte range.
///
/// Holding a view keeps the segment's file alive even if the segment is
/// deleted concurrently. The reference is released on drop.
pub struct SegmentView {
    segment: Arc<Segment>,
    position: u64,
    data: Vec<u8>,
}

impl SegmentView {
    /// The segment this view belongs to.
    #[must_use]
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Segment-relative position of the first byte.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Absolute log offset of the first byte.
    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.segment.start_offset + self.position
    }

    /// The mapped bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of mapped bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the view maps no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Overwrites bytes at `offset` within the view, in the segment and in
    /// the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the write leaves the view, or the
    /// segment's write error.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> CoreResult<()> {
        let end = offset + bytes.len();
        if end > self.data.len() {
            return Err(CoreError::invalid_operation(format!(
                "write of {} bytes at {offset} leaves a {} byte view",
                bytes.len(),
                self.data.len()
            )));
        }
        self.segment
            .write_at(self.position + offset as u64, bytes)?;
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

impl Drop for SegmentView {
    fn drop(&mut self) {
        self.segment.release();
    }
}

impl std::fmt::Debug for SegmentView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentView")
            .field("segment", &self.segment.name())
            .field("position", &self.position)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Formats a segment start offset as a file name.
#[must_use]
pub(crate) fn file_name(start_offset: u64) -> String {
    format!("{start_offset:020}")
}
