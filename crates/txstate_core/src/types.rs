//! Core type definitions for the transaction state store.

use std::fmt;

/// Logical index of a record in the transaction state table.
///
/// `TableOffset(n)` addresses the record stored at byte offset
/// `n * StateRecord::SIZE`. It is the coordinate handed to external callers
/// and passed back on resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TableOffset(pub u64);

impl TableOffset {
    /// Creates a new table offset.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the raw index value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next table offset.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TableOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

/// State of a prepared transaction.
///
/// The numeric codes are the transaction type flags shared with the rest of
/// the message store and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TransactionState {
    /// Phase one done, outcome unknown.
    Prepared = 0x4,
    /// Transaction committed.
    Committed = 0x8,
    /// Transaction rolled back.
    RolledBack = 0xC,
}

impl TransactionState {
    /// Converts a stored code to a state.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0x4 => Some(Self::Prepared),
            0x8 => Some(Self::Committed),
            0xC => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Returns the stored code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Returns true for Committed and RolledBack.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Prepared)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepared => "prepared",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

/// Hashes a producer group name the way the rest of the store does.
///
/// 31-based polynomial over UTF-16 code units with wrapping `i32`
/// arithmetic. The outer store hashes the group when it appends a prepared
/// record and crash recovery hashes the group read back from the message,
/// so both sides must use this function.
#[must_use]
pub fn producer_group_hash(group: &str) -> i32 {
    group
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_roundtrip() {
        for state in [
            TransactionState::Prepared,
            TransactionState::Committed,
            TransactionState::RolledBack,
        ] {
            assert_eq!(TransactionState::from_code(state.code()), Some(state));
        }
        assert_eq!(TransactionState::from_code(0), None);
        assert_eq!(TransactionState::from_code(0x10), None);
    }

    #[test]
    fn only_prepared_is_open() {
        assert!(!TransactionState::Prepared.is_terminal());
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::RolledBack.is_terminal());
    }

    #[test]
    fn group_hash_matches_known_values() {
        assert_eq!(producer_group_hash(""), 0);
        assert_eq!(producer_group_hash("a"), 97);
        assert_eq!(producer_group_hash("ab"), 97 * 31 + 98);
        // Long names wrap instead of overflowing.
        assert_eq!(producer_group_hash("please_rename_unique_group_name"), {
            "please_rename_unique_group_name"
                .bytes()
                .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(i32::from(b)))
        });
    }

    #[test]
    fn table_offset_display() {
        assert_eq!(TableOffset::new(42).to_string(), "ts:42");
        assert_eq!(TableOffset::new(1).next(), TableOffset::new(2));
    }
}
