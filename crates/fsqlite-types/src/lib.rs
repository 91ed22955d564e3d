//! Lock vocabulary shared by FrankenSQLite VFS backends.
//!
//! - [`LockLevel`]: the five-level file lock hierarchy.
//! - [`LockMode`]: shared-vs-exclusive mode of a single advisory lock.
//! - [`layout`]: reserved lock-byte offsets that every process sharing a
//!   database file must agree on.
//! - [`shm`]: slot masks and lock bytes of the shared-memory index.

pub mod layout;
pub mod shm;

pub use layout::{ByteRange, PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE};
pub use shm::{SHM_DMS, SHM_LOCK_BASE, SHM_NLOCK, SlotMask};

/// SQLite file lock level.
///
/// Levels only increase along `None → Shared → Reserved → Pending →
/// Exclusive` until an explicit release, which returns to `Shared` or
/// `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared lock (reading).
    Shared = 1,
    /// Reserved lock (intending to write).
    Reserved = 2,
    /// Pending lock (waiting for shared locks to clear).
    Pending = 3,
    /// Exclusive lock (writing).
    Exclusive = 4,
}

impl LockLevel {
    /// All levels in ascending order.
    pub const ALL: [Self; 5] = [
        Self::None,
        Self::Shared,
        Self::Reserved,
        Self::Pending,
        Self::Exclusive,
    ];

    /// Whether `target` can be requested directly from `self`.
    ///
    /// `Reserved` is reachable only from `Shared`; `Pending` and `Exclusive`
    /// are reachable from `Shared` or `Reserved` (and `Exclusive` from
    /// `Pending`). Nothing above `Shared` is reachable from `None`.
    #[must_use]
    pub const fn can_escalate_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::None, Self::Shared)
                | (
                    Self::Shared,
                    Self::Reserved | Self::Pending | Self::Exclusive
                )
                | (Self::Reserved, Self::Pending | Self::Exclusive)
                | (Self::Pending, Self::Exclusive)
        )
    }

    /// Whether this level is a legal argument to a release.
    #[must_use]
    pub const fn is_release_target(self) -> bool {
        matches!(self, Self::None | Self::Shared)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Shared => "SHARED",
            Self::Reserved => "RESERVED",
            Self::Pending => "PENDING",
            Self::Exclusive => "EXCLUSIVE",
        }
    }

    /// Decode a level reported as a raw integer (`SQLITE_FCNTL_LOCKSTATE`).
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Shared),
            2 => Some(Self::Reserved),
            3 => Some(Self::Pending),
            4 => Some(Self::Exclusive),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode of a single advisory byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Compatible with other shared holders.
    Shared,
    /// Excludes every other holder.
    Exclusive,
}

impl LockMode {
    /// Whether two locks in these modes over overlapping bytes conflict
    /// when held by different owners.
    #[must_use]
    pub const fn conflicts_with(self, other: Self) -> bool {
        matches!(self, Self::Exclusive) || matches!(other, Self::Exclusive)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
