//! How the SHARED level is represented on the shared lock range.

use fsqlite_error::Result;
use fsqlite_types::{ByteRange, LockMode, SHARED_FIRST, SHARED_SIZE};
use rand::Rng;

use crate::config::LockStrategyKind;
use crate::traits::RangeLock;

/// Which shared-range lock a handle holds while at SHARED or above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedToken {
    /// A shared lock over the whole shared range.
    FullRange,
    /// An exclusive lock on `SHARED_FIRST + offset`.
    Byte(u16),
}

impl SharedToken {
    /// The bytes this token locks.
    #[must_use]
    pub const fn range(self) -> ByteRange {
        match self {
            Self::FullRange => ByteRange::SHARED,
            Self::Byte(offset) => ByteRange::byte(SHARED_FIRST + offset as u64),
        }
    }

    /// Mode the token's bytes are locked in.
    #[must_use]
    pub const fn mode(self) -> LockMode {
        match self {
            Self::FullRange => LockMode::Shared,
            Self::Byte(_) => LockMode::Exclusive,
        }
    }
}

/// Acquires and releases the read lock for one file handle.
///
/// Chosen once when the handle is created. Exclusive acquisition always
/// locks the whole shared range, whatever the strategy.
pub trait ReadLockStrategy: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> LockStrategyKind;

    /// Try to take the read lock. `Ok(None)` means contended.
    fn lock_read(&self, lock: &dyn RangeLock) -> Result<Option<SharedToken>>;

    /// Release the read lock described by `token`.
    fn unlock_read(&self, lock: &dyn RangeLock, token: SharedToken) -> Result<()> {
        lock.unlock(token.range())
    }
}

/// Shared lock on `SHARED_FIRST..SHARED_FIRST + SHARED_SIZE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullRangeStrategy;

impl ReadLockStrategy for FullRangeStrategy {
    fn kind(&self) -> LockStrategyKind {
        LockStrategyKind::FullRange
    }

    fn lock_read(&self, lock: &dyn RangeLock) -> Result<Option<SharedToken>> {
        let token = SharedToken::FullRange;
        Ok(lock
            .try_lock(token.range(), LockMode::Shared)?
            .then_some(token))
    }
}

/// Exclusive lock on one random byte of the shared range.
///
/// Two readers collide when they draw the same byte; the caller sees
/// `Busy` and retries. A writer's exclusive lock over the full range still
/// conflicts with every reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleByteStrategy;

impl SingleByteStrategy {
    fn pick() -> u16 {
        // Same draw as C SQLite: the last shared byte is never picked.
        #[allow(clippy::cast_possible_truncation)]
        let bound = (SHARED_SIZE - 1) as u16;
        rand::thread_rng().gen_range(0..bound)
    }
}

impl ReadLockStrategy for SingleByteStrategy {
    fn kind(&self) -> LockStrategyKind {
        LockStrategyKind::SingleByte
    }

    fn lock_read(&self, lock: &dyn RangeLock) -> Result<Option<SharedToken>> {
        let token = SharedToken::Byte(Self::pick());
        Ok(lock
            .try_lock(token.range(), LockMode::Exclusive)?
            .then_some(token))
    }
}

/// Strategy object for `kind`.
#[must_use]
pub fn for_kind(kind: LockStrategyKind) -> Box<dyn ReadLockStrategy> {
    match kind {
        LockStrategyKind::FullRange => Box::new(FullRangeStrategy),
        LockStrategyKind::SingleByte => Box::new(SingleByteStrategy),
    }
}
