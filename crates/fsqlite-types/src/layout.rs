//! Reserved lock-byte layout of a database file.
//!
//! The bytes at the 1 GB boundary are never read or written as data; they
//! exist purely as a rendezvous point for advisory locks and must match C
//! SQLite for file-level compatibility:
//!
//! - `PENDING_BYTE`  = `0x4000_0000` (1 byte)
//! - `RESERVED_BYTE` = `0x4000_0001` (1 byte)
//! - `SHARED_FIRST`  = `0x4000_0002` (510 bytes)

/// Byte offset of the pending lock byte.
pub const PENDING_BYTE: u64 = 0x4000_0000;
/// Byte offset of the reserved lock byte.
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
/// Byte offset of the first shared lock byte.
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;
/// Number of bytes in the shared lock range.
pub const SHARED_SIZE: u64 = 510;

/// A half-open span of file bytes targeted by an advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    /// The pending lock byte.
    pub const PENDING: Self = Self::byte(PENDING_BYTE);
    /// The reserved lock byte.
    pub const RESERVED: Self = Self::byte(RESERVED_BYTE);
    /// The full shared lock range.
    pub const SHARED: Self = Self::new(SHARED_FIRST, SHARED_SIZE);

    #[must_use]
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// A single byte at `offset`.
    #[must_use]
    pub const fn byte(offset: u64) -> Self {
        Self::new(offset, 1)
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end(self) -> u64 {
        self.start.saturating_add(self.len)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    /// Whether `other` lies entirely inside `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}+{}", self.start, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_bytes_are_adjacent() {
        assert_eq!(ByteRange::RESERVED.start, ByteRange::PENDING.end());
        assert_eq!(ByteRange::SHARED.start, ByteRange::RESERVED.end());
        assert_eq!(ByteRange::SHARED.end(), PENDING_BYTE + 512);
    }

    #[test]
    fn test_overlaps() {
        let a = ByteRange::new(10, 5);
        assert!(a.overlaps(ByteRange::byte(10)));
        assert!(a.overlaps(ByteRange::byte(14)));
        assert!(!a.overlaps(ByteRange::byte(15)));
        assert!(!a.overlaps(ByteRange::new(0, 10)));
        assert!(!a.overlaps(ByteRange::new(12, 0)));
        assert!(!ByteRange::PENDING.overlaps(ByteRange::RESERVED));
        assert!(!ByteRange::RESERVED.overlaps(ByteRange::SHARED));
    }

    #[test]
    fn test_contains() {
        let shared = ByteRange::SHARED;
        assert!(shared.contains(ByteRange::byte(SHARED_FIRST)));
        assert!(shared.contains(ByteRange::byte(SHARED_FIRST + SHARED_SIZE - 1)));
        assert!(!shared.contains(ByteRange::byte(SHARED_FIRST + SHARED_SIZE)));
        assert!(!shared.contains(ByteRange::PENDING));
    }
}
