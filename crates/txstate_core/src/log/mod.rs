//! Segmented append-only log.
//!
//! Both the transaction state table and the redo log are sequences of
//! fixed-capacity segments. A segment is addressed by the byte offset of
//! its first byte in the log; on disk each segment is one file named after
//! that offset, zero-padded to 20 digits:
//!
//! ```text
//! statetable/
//! ├─ 00000000000000000000
//! ├─ 00000000000000000096
//! └─ 00000000000000000192
//! ```
//!
//! ## Views
//!
//! Reads go through [`SegmentView`], a scoped, reference-counted snapshot
//! of a byte range. Deleting a segment only marks it unavailable; the
//! backing file is removed once the last view is dropped.
//!
//! ## Invariants
//!
//! - Segment start offsets are multiples of the segment capacity
//! - Only the last segment is ever appended to
//! - A segment never holds more than its capacity
//! - In-place writes never change a segment's written length

mod queue;
mod segment;

pub use queue::{RecoveredTail, SegmentedLog};
pub use segment::{Segment, SegmentView};
