//! Ordered collection of segments forming one logical log.

use crate::error::{CoreError, CoreResult};
use crate::log::segment::{file_name, Segment};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use txstate_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Outcome of a valid-prefix recovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredTail {
    /// Log offset just past the last valid unit.
    pub max_offset: u64,
    /// Bytes dropped after `max_offset`.
    pub truncated_bytes: u64,
}

/// A log made of fixed-capacity segments.
///
/// Appends always go to the last segment; a new segment is created when the
/// last one cannot hold the data. Segments are file-backed when the log has
/// a directory and memory-backed otherwise.
pub struct SegmentedLog {
    label: &'static str,
    dir: Option<PathBuf>,
    segment_size: u64,
    segments: RwLock<Vec<Arc<Segment>>>,
}

impl SegmentedLog {
    /// Creates a file-backed log in `dir`, creating the directory if needed.
    ///
    /// Existing segment files are not read until [`SegmentedLog::load`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(label: &'static str, dir: &Path, segment_size: u64) -> CoreResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            label,
            dir: Some(dir.to_path_buf()),
            segment_size,
            segments: RwLock::new(Vec::new()),
        })
    }

    /// Creates an empty memory-backed log.
    #[must_use]
    pub fn in_memory(label: &'static str, segment_size: u64) -> Self {
        Self {
            label,
            dir: None,
            segment_size,
            segments: RwLock::new(Vec::new()),
        }
    }

    /// Loads the segment files found in the log directory.
    ///
    /// Files whose names are not 20-digit offsets are ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if a segment is misaligned, oversized or
    /// leaves a gap, or an I/O error.
    pub fn load(&self) -> CoreResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let mut starts = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.len() != 20 {
                continue;
            }
            match name.parse::<u64>() {
                Ok(start) => starts.push(start),
                Err(_) => {
                    tracing::warn!(log = self.label, file = name, "ignoring unexpected file");
                }
            }
        }
        starts.sort_unstable();

        let mut loaded = Vec::with_capacity(starts.len());
        let mut expected: Option<u64> = None;
        for start in starts {
            if start % self.segment_size != 0 {
                return Err(CoreError::invalid_format(format!(
                    "{} segment {} is not aligned to {}",
                    self.label,
                    file_name(start),
                    self.segment_size
                )));
            }
            if let Some(expected) = expected {
                if start != expected {
                    return Err(CoreError::invalid_format(format!(
                        "{} is missing the segment at {}",
                        self.label,
                        file_name(expected)
                    )));
                }
            }
            expected = Some(start + self.segment_size);

            let path = dir.join(file_name(start));
            let backend = FileBackend::open(&path)?;
            let segment = Segment::new(start, self.segment_size, Some(path), Box::new(backend))?;
            tracing::debug!(
                log = self.label,
                segment = %segment.name(),
                wrote = segment.wrote_position(),
                "segment loaded"
            );
            loaded.push(Arc::new(segment));
        }

        tracing::info!(log = self.label, segments = loaded.len(), "log loaded");
        *self.segments.write() = loaded;
        Ok(())
    }

    /// Name used in log messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Directory holding the segment files, if file-backed.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Capacity of every segment in bytes.
    #[must_use]
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Snapshot of the current segments, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    /// The newest segment, if any.
    #[must_use]
    pub fn last_segment(&self) -> Option<Arc<Segment>> {
        self.segments.read().last().cloned()
    }

    /// Offset of the first retained byte (0 for an empty log).
    #[must_use]
    pub fn min_offset(&self) -> u64 {
        self.segments
            .read()
            .first()
            .map_or(0, |segment| segment.start_offset())
    }

    /// Offset just past the last written byte (0 for an empty log).
    #[must_use]
    pub fn max_offset(&self) -> u64 {
        self.segments.read().last().map_or(0, |segment| {
            segment.start_offset() + segment.wrote_position()
        })
    }

    /// Appends `data` to the tail, creating a segment when needed.
    ///
    /// Returns the absolute offset of the data and the segment holding it.
    /// `data` never straddles two segments.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `data` is larger than a segment, or
    /// the error raised while creating or writing the tail segment.
    pub fn append(&self, data: &[u8]) -> CoreResult<(u64, Arc<Segment>)> {
        if data.len() as u64 > self.segment_size {
            return Err(CoreError::invalid_operation(format!(
                "{} byte append exceeds {} segment size {}",
                data.len(),
                self.label,
                self.segment_size
            )));
        }

        let segment = self.writable_tail(data.len() as u64)?;
        let offset = segment.append(data)?;
        Ok((offset, segment))
    }

    fn writable_tail(&self, len: u64) -> CoreResult<Arc<Segment>> {
        if let Some(last) = self.last_segment() {
            if last.capacity() - last.wrote_position() >= len {
                return Ok(last);
            }
        }

        let mut segments = self.segments.write();
        let start = segments
            .last()
            .map_or(0, |last| last.start_offset() + self.segment_size);
        let segment = Arc::new(self.create_segment(start)?);
        tracing::info!(log = self.label, segment = %segment.name(), "segment created");
        segments.push(Arc::clone(&segment));
        Ok(segment)
    }

    fn create_segment(&self, start: u64) -> CoreResult<Segment> {
        match &self.dir {
            Some(dir) => {
                let path = dir.join(file_name(start));
                let backend: Box<dyn StorageBackend> = Box::new(FileBackend::open(&path)?);
                Segment::new(start, self.segment_size, Some(path), backend)
            }
            None => Segment::new(
                start,
                self.segment_size,
                None,
                Box::new(InMemoryBackend::new()),
            ),
        }
    }

    /// Finds the segment whose byte range covers `offset`.
    #[must_use]
    pub fn find_segment(&self, offset: u64) -> Option<Arc<Segment>> {
        let segments = self.segments.read();
        let first = segments.first()?;
        if offset < first.start_offset() {
            return None;
        }
        let index = ((offset - first.start_offset()) / self.segment_size) as usize;
        segments
            .get(index)
            .filter(|segment| {
                offset >= segment.start_offset()
                    && offset < segment.start_offset() + segment.capacity()
            })
            .cloned()
    }

    /// Drops every byte at or after `offset`.
    ///
    /// Segments that start after `offset` are destroyed; the segment
    /// containing it is truncated.
    ///
    /// # Errors
    ///
    /// Returns a storage error if truncation fails.
    pub fn truncate_to(&self, offset: u64) -> CoreResult<()> {
        let mut segments = self.segments.write();
        let mut kept = Vec::with_capacity(segments.len());

        for segment in segments.drain(..) {
            let tail = segment.start_offset() + segment.wrote_position();
            if tail <= offset {
                kept.push(segment);
            } else if offset >= segment.start_offset() {
                segment.truncate(offset - segment.start_offset())?;
                kept.push(segment);
            } else {
                tracing::info!(log = self.label, segment = %segment.name(), "dirty segment destroyed");
                segment.destroy();
            }
        }

        *segments = kept;
        Ok(())
    }

    /// Scans forward from `tail_segments` before the end, keeping the
    /// longest prefix of `unit_size` units accepted by `is_valid`, and
    /// truncates the rest.
    ///
    /// # Errors
    ///
    /// Returns a storage error if reading or truncating fails.
    pub fn recover_valid_prefix<F>(
        &self,
        unit_size: usize,
        tail_segments: usize,
        is_valid: F,
    ) -> CoreResult<RecoveredTail>
    where
        F: Fn(&[u8]) -> bool,
    {
        let before = self.max_offset();
        let process_offset = self.scan_valid_prefix(unit_size, tail_segments, is_valid)?;
        if self.segments.read().is_empty() {
            return Ok(RecoveredTail {
                max_offset: 0,
                truncated_bytes: 0,
            });
        }

        self.truncate_to(process_offset)?;
        Ok(RecoveredTail {
            max_offset: self.max_offset(),
            truncated_bytes: before.saturating_sub(process_offset),
        })
    }

    /// Returns the end offset of the longest valid prefix without modifying
    /// the log.
    ///
    /// The scan starts `tail_segments` before the end and moves to the next
    /// segment only when a segment is valid up to its full capacity.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a segment cannot be read.
    pub fn scan_valid_prefix<F>(
        &self,
        unit_size: usize,
        tail_segments: usize,
        is_valid: F,
    ) -> CoreResult<u64>
    where
        F: Fn(&[u8]) -> bool,
    {
        let segments = self.segments();
        if segments.is_empty() {
            return Ok(0);
        }

        let mut index = segments.len().saturating_sub(tail_segments.max(1));
        let mut process_offset;

        loop {
            let segment = &segments[index];
            process_offset = segment.start_offset();

            let mut valid_bytes = 0u64;
            if let Some(view) = segment.map_whole()? {
                for unit in view.bytes().chunks(unit_size) {
                    if unit.len() < unit_size || !is_valid(unit) {
                        break;
                    }
                    valid_bytes += unit_size as u64;
                }
            }
            process_offset += valid_bytes;

            if valid_bytes == segment.capacity() && index + 1 < segments.len() {
                index += 1;
                tracing::info!(log = self.label, segment = %segments[index].name(), "recover next segment");
                continue;
            }

            tracing::info!(
                log = self.label,
                segment = %segment.name(),
                offset = process_offset,
                "recover scan over"
            );
            break;
        }

        Ok(process_offset)
    }

    /// Deletes leading segments whose last unit refers to a primary log
    /// offset below `boundary`.
    ///
    /// The first 8 bytes of every unit hold a primary log offset. The tail
    /// segment and segments that are not yet full are never deleted.
    /// Returns the number of deleted segments.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a segment cannot be read.
    pub fn delete_expired(&self, boundary: i64, unit_size: usize) -> CoreResult<usize> {
        let candidates = self.segments();
        let mut expired = 0usize;

        for segment in candidates.iter().take(candidates.len().saturating_sub(1)) {
            if !segment.is_full() {
                break;
            }
            let last_unit = segment.capacity() - unit_size as u64;
            let Some(view) = segment.map_range(last_unit, unit_size)? else {
                break;
            };
            let max_primary_offset = i64::from_le_bytes(crate::record::le_array(view.bytes()));
            drop(view);

            if max_primary_offset >= boundary {
                break;
            }
            expired += 1;
        }

        if expired > 0 {
            let mut segments = self.segments.write();
            for segment in segments.drain(..expired) {
                tracing::info!(
                    log = self.label,
                    segment = %segment.name(),
                    boundary,
                    "expired segment deleted"
                );
                segment.destroy();
            }
        }
        Ok(expired)
    }

    /// Destroys every segment.
    pub fn destroy_all(&self) {
        let mut segments = self.segments.write();
        for segment in segments.drain(..) {
            segment.destroy();
        }
        tracing::info!(log = self.label, "all segments destroyed");
    }

    /// Flushes every segment, fsyncing when `sync` is set.
    ///
    /// # Errors
    ///
    /// Returns the first storage error encountered.
    pub fn flush(&self, sync: bool) -> CoreResult<()> {
        for segment in self.segments() {
            segment.flush(sync)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SegmentedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedLog")
            .field("label", &self.label)
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("segments", &self.segments.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn unit(primary_offset: i64) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&primary_offset.to_le_bytes());
        buf[8] = 1;
        buf
    }

    fn nonzero(unit: &[u8]) -> bool {
        unit[8] != 0
    }

    #[test]
    fn append_rolls_to_new_segment() {
        let log = SegmentedLog::in_memory("test", 48);

        let (a, seg_a) = log.append(&unit(1)).unwrap();
        let (b, _) = log.append(&unit(2)).unwrap();
        let (c, seg_c) = log.append(&unit(3)).unwrap();

        assert_eq!((a, b, c), (0, 24, 48));
        assert_eq!(seg_a.start_offset(), 0);
        assert_eq!(seg_c.start_offset(), 48);
        assert_eq!(log.segments().len(), 2);
        assert_eq!(log.max_offset(), 72);
    }

    #[test]
    fn oversized_append_rejected() {
        let log = SegmentedLog::in_memory("test", 16);
        assert!(log.append(&unit(1)).is_err());
        assert!(log.segments().is_empty());
    }

    #[test]
    fn find_segment_by_offset() {
        let log = SegmentedLog::in_memory("test", 48);
        for i in 0..5 {
            log.append(&unit(i)).unwrap();
        }

        assert_eq!(log.find_segment(0).unwrap().start_offset(), 0);
        assert_eq!(log.find_segment(47).unwrap().start_offset(), 0);
        assert_eq!(log.find_segment(96).unwrap().start_offset(), 96);
        assert!(log.find_segment(144).is_none());
    }

    #[test]
    fn truncate_drops_later_segments() {
        let log = SegmentedLog::in_memory("test", 48);
        for i in 0..5 {
            log.append(&unit(i)).unwrap();
        }

        log.truncate_to(60).unwrap();
        assert_eq!(log.segments().len(), 2);
        assert_eq!(log.max_offset(), 60);
    }

    #[test]
    fn delete_expired_keeps_tail_and_live_segments() {
        let log = SegmentedLog::in_memory("test", 48);
        for i in 0..6 {
            log.append(&unit(i * 100)).unwrap();
        }
        // Segment last units: 100, 300, 500.

        assert_eq!(log.delete_expired(50, 24).unwrap(), 0);
        assert_eq!(log.delete_expired(301, 24).unwrap(), 2);
        assert_eq!(log.min_offset(), 96);
        // Tail segment survives even when expired.
        assert_eq!(log.delete_expired(10_000, 24).unwrap(), 0);
        assert_eq!(log.segments().len(), 1);
    }

    #[test]
    fn recover_valid_prefix_truncates_garbage() {
        let log = SegmentedLog::in_memory("test", 48);
        for i in 0..3 {
            log.append(&unit(i)).unwrap();
        }
        log.append(&[0u8; 24]).unwrap();

        let tail = log.recover_valid_prefix(24, 3, nonzero).unwrap();
        assert_eq!(tail.max_offset, 72);
        assert_eq!(tail.truncated_bytes, 24);
        assert_eq!(log.segments().len(), 2);
    }

    #[test]
    fn scan_valid_prefix_leaves_log_untouched() {
        let log = SegmentedLog::in_memory("test", 48);
        log.append(&unit(1)).unwrap();
        log.append(&[0u8; 24]).unwrap();

        assert_eq!(log.scan_valid_prefix(24, 3, nonzero).unwrap(), 24);
        assert_eq!(log.max_offset(), 48);
    }

    #[test]
    fn load_rejects_gaps() {
        let dir = tempdir().unwrap();
        {
            let log = SegmentedLog::open("test", dir.path(), 24).unwrap();
            for i in 0..3 {
                log.append(&unit(i)).unwrap();
            }
        }
        fs::remove_file(dir.path().join(file_name(24))).unwrap();

        let log = SegmentedLog::open("test", dir.path(), 24).unwrap();
        assert!(matches!(log.load(), Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn load_restores_segments() {
        let dir = tempdir().unwrap();
        {
            let log = SegmentedLog::open("test", dir.path(), 48).unwrap();
            for i in 0..3 {
                log.append(&unit(i)).unwrap();
            }
            log.flush(true).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let log = SegmentedLog::open("test", dir.path(), 48).unwrap();
        log.load().unwrap();
        assert_eq!(log.segments().len(), 2);
        assert_eq!(log.max_offset(), 72);
    }
}
