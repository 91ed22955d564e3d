//! Shared-memory (WAL index) lock slots.
//!
//! The WAL index exposes `SHM_NLOCK` independently lockable slots. Slot `i`
//! is backed by one advisory-lock byte at `SHM_LOCK_BASE + i` of the
//! shared-memory file; the deadman switch lives on its own byte directly
//! after the slot bytes.

use std::ops::{BitAnd, BitOr, Not};

use crate::layout::ByteRange;

/// Number of lock slots in the shared-memory index.
pub const SHM_NLOCK: u32 = 8;
/// Byte offset of the first slot lock byte in the shared-memory file.
pub const SHM_LOCK_BASE: u64 = (22 + SHM_NLOCK as u64) * 4;
/// Byte offset of the deadman-switch probe slot.
pub const SHM_DMS: u64 = SHM_LOCK_BASE + SHM_NLOCK as u64;

/// Slot holding the WAL writer lock.
pub const WAL_WRITE_LOCK: u32 = 0;
/// Slot holding the checkpointer lock.
pub const WAL_CKPT_LOCK: u32 = 1;
/// Slot holding the recovery lock.
pub const WAL_RECOVER_LOCK: u32 = 2;
/// Number of reader mark slots.
pub const WAL_NREADER: u32 = SHM_NLOCK - 3;

/// Slot for reader mark `i`, if `i < WAL_NREADER`.
#[must_use]
pub const fn wal_read_lock(i: u32) -> Option<u32> {
    if i < WAL_NREADER { Some(3 + i) } else { None }
}

/// Lock-byte span for `len` slots starting at `first`.
#[must_use]
pub const fn slot_byte_range(first: u32, len: u32) -> ByteRange {
    ByteRange::new(SHM_LOCK_BASE + first as u64, len as u64)
}

/// Lock byte of the deadman switch.
pub const DMS_RANGE: ByteRange = ByteRange::byte(SHM_DMS);

const ALL_BITS: u16 = (1 << SHM_NLOCK) - 1;

/// A set of shared-memory lock slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlotMask(u16);

impl SlotMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(ALL_BITS);

    /// A mask of the single slot `i`.
    #[must_use]
    pub const fn slot(i: u32) -> Option<Self> {
        if i < SHM_NLOCK { Some(Self(1 << i)) } else { None }
    }

    /// A mask of `n` contiguous slots starting at `first`.
    ///
    /// Returns `None` when `n` is zero or the run leaves the slot table.
    #[must_use]
    pub const fn range(first: u32, n: u32) -> Option<Self> {
        if n == 0 || first >= SHM_NLOCK || n > SHM_NLOCK - first {
            return None;
        }
        let end = first + n;
        #[allow(clippy::cast_possible_truncation)]
        let bits = ((1_u32 << end) - (1_u32 << first)) as u16;
        Some(Self(bits))
    }

    /// Build a mask from raw bits; `None` if any bit lies past `SHM_NLOCK`.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Option<Self> {
        if bits & !ALL_BITS == 0 { Some(Self(bits)) } else { None }
    }

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Maximal contiguous runs as `(first, len)`, in ascending order.
    pub fn runs(self) -> impl Iterator<Item = (u32, u32)> {
        let mut rest = self.0;
        std::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let first = rest.trailing_zeros();
            let len = (rest >> first).trailing_ones();
            #[allow(clippy::cast_possible_truncation)]
            let run = ((1_u32 << (first + len)) - (1_u32 << first)) as u16;
            rest &= !run;
            Some((first, len))
        })
    }

    /// Individual slot indices in ascending order.
    pub fn slots(self) -> impl Iterator<Item = u32> {
        (0..SHM_NLOCK).filter(move |i| self.0 & (1 << i) != 0)
    }
}

impl BitOr for SlotMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitAnd for SlotMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl Not for SlotMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & ALL_BITS)
    }
}

impl std::fmt::Display for SlotMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_shm_layout_matches_sqlite() {
        assert_eq!(SHM_LOCK_BASE, 120);
        assert_eq!(SHM_DMS, 128);
        assert_eq!(slot_byte_range(0, 1), ByteRange::byte(120));
        assert_eq!(slot_byte_range(3, 5), ByteRange::new(123, 5));
        assert!(!DMS_RANGE.overlaps(slot_byte_range(0, SHM_NLOCK)));
    }

    #[test]
    fn test_wal_read_lock_slots() {
        assert_eq!(wal_read_lock(0), Some(3));
        assert_eq!(wal_read_lock(4), Some(7));
        assert_eq!(wal_read_lock(5), None);
    }

    #[test]
    fn test_slot_mask_range() {
        assert_eq!(SlotMask::range(0, 2).map(SlotMask::bits), Some(0b11));
        assert_eq!(SlotMask::range(2, 2).map(SlotMask::bits), Some(0b1100));
        assert_eq!(SlotMask::range(0, 8), Some(SlotMask::ALL));
        assert_eq!(SlotMask::range(7, 2), None);
        assert_eq!(SlotMask::range(0, 0), None);
        assert_eq!(SlotMask::range(8, 1), None);
    }

    #[test]
    fn test_slot_mask_from_bits_rejects_out_of_table() {
        assert!(SlotMask::from_bits(0xFF).is_some());
        assert!(SlotMask::from_bits(0x100).is_none());
    }

    #[test]
    fn test_slot_mask_set_ops() {
        let a = SlotMask::range(0, 2).unwrap();
        let b = SlotMask::range(1, 2).unwrap();
        assert!(a.intersects(b));
        assert_eq!((a | b).bits(), 0b111);
        assert_eq!((a & b).bits(), 0b10);
        assert_eq!(a.difference(b).bits(), 0b1);
        assert_eq!((!a).bits(), 0xFC);
        assert!((a | b).contains(a));
        assert!(!a.contains(b));
    }

    #[test]
    fn test_slot_mask_runs() {
        let mask = SlotMask::from_bits(0b1011_0110).unwrap();
        let runs: Vec<_> = mask.runs().collect();
        assert_eq!(runs, vec![(1, 2), (4, 2), (7, 1)]);
        assert_eq!(SlotMask::EMPTY.runs().count(), 0);
        assert_eq!(SlotMask::ALL.runs().collect::<Vec<_>>(), vec![(0, 8)]);
    }

    proptest! {
        #[test]
        fn prop_runs_partition_mask(bits in 0_u16..=0xFF) {
            let mask = SlotMask::from_bits(bits).unwrap();
            let mut rebuilt = SlotMask::EMPTY;
            let mut last_end = None;
            for (first, len) in mask.runs() {
                let run = SlotMask::range(first, len).unwrap();
                prop_assert!(!rebuilt.intersects(run));
                if let Some(end) = last_end {
                    // Runs are maximal, so a gap separates consecutive runs.
                    prop_assert!(first > end);
                }
                last_end = Some(first + len);
                rebuilt = rebuilt | run;
            }
            prop_assert_eq!(rebuilt, mask);
        }
    }
}
