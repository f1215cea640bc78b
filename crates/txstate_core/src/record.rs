//! Transaction state record codec.
//!
//! ```text
//! | commit_log_offset (8) | message_size (4) | timestamp (4) | group_hash (4) | state (4) |
//! ```
//!
//! All fields are little-endian. Only `state` is ever rewritten after the
//! record is appended.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionState;

/// A fixed-width entry of the transaction state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRecord {
    /// Offset of the prepared message in the primary log.
    pub commit_log_offset: i64,
    /// Size of the prepared message.
    pub message_size: i32,
    /// Creation time in seconds.
    pub timestamp: i32,
    /// Hash of the owning producer group.
    pub group_hash: i32,
    /// Raw state code. See [`StateRecord::state`].
    pub state_code: i32,
}

impl StateRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 24;

    /// Byte position of the state field inside a record.
    pub const STATE_POS: usize = 20;

    /// Creates a record in the Prepared state.
    #[must_use]
    pub fn prepared(commit_log_offset: i64, message_size: i32, timestamp: i32, group_hash: i32) -> Self {
        Self {
            commit_log_offset,
            message_size,
            timestamp,
            group_hash,
            state_code: TransactionState::Prepared.code(),
        }
    }

    /// Returns the decoded state, or `None` for an unknown code.
    #[must_use]
    pub fn state(&self) -> Option<TransactionState> {
        TransactionState::from_code(self.state_code)
    }

    /// Returns true if the record still awaits resolution.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.state() == Some(TransactionState::Prepared)
    }

    /// Returns true if the record could have been written by this store.
    ///
    /// Zero-filled or torn tails fail this check.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.commit_log_offset >= 0 && self.message_size > 0 && self.state().is_some()
    }

    /// Encodes the record to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.commit_log_offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.message_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.group_hash.to_le_bytes());
        buf[20..24].copy_from_slice(&self.state_code.to_le_bytes());
        buf
    }

    /// Decodes a record from the first 24 bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns `SegmentCorruption` if fewer than 24 bytes are available.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < Self::SIZE {
            return Err(CoreError::segment_corruption(format!(
                "state record needs {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }

        Ok(Self {
            commit_log_offset: i64::from_le_bytes(le_array(&data[0..8])),
            message_size: i32::from_le_bytes(le_array(&data[8..12])),
            timestamp: i32::from_le_bytes(le_array(&data[12..16])),
            group_hash: i32::from_le_bytes(le_array(&data[16..20])),
            state_code: i32::from_le_bytes(le_array(&data[20..24])),
        })
    }
}

/// Copies a slice of known length into an array.
pub(crate) fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn state_field_position() {
        let mut record = StateRecord::prepared(1000, 200, 1_700_000_000, -17);
        record.state_code = TransactionState::Committed.code();
        let encoded = record.encode();

        assert_eq!(
            &encoded[StateRecord::STATE_POS..],
            &TransactionState::Committed.code().to_le_bytes()
        );
    }

    #[test]
    fn zeroed_record_is_invalid() {
        let record = StateRecord::decode(&[0u8; 24]).unwrap();
        assert!(!record.is_valid());
        assert_eq!(record.state(), None);
    }

    #[test]
    fn short_input_is_rejected() {
        let result = StateRecord::decode(&[0u8; 23]);
        assert!(matches!(result, Err(CoreError::SegmentCorruption { .. })));
    }

    #[test]
    fn negative_offset_is_invalid() {
        assert!(!StateRecord::prepared(-1, 10, 0, 0).is_valid());
        assert!(!StateRecord::prepared(0, 0, 0, 0).is_valid());
        assert!(StateRecord::prepared(0, 1, 0, 0).is_valid());
    }

    proptest! {
        #[test]
        fn prepared_records_decode_to_themselves(
            offset in 0i64..i64::MAX,
            size in 1i32..i32::MAX,
            ts in any::<i32>(),
            group in any::<i32>(),
        ) {
            let record = StateRecord::prepared(offset, size, ts, group);
            let decoded = StateRecord::decode(&record.encode()).unwrap();
            prop_assert_eq!(decoded, record);
            prop_assert!(decoded.is_valid());
            prop_assert!(decoded.is_prepared());
        }
    }
}
