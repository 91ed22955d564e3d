use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use fsqlite_error::{FrankenError, IoOp, Result};
use fsqlite_types::{ByteRange, LockMode};
use parking_lot::Mutex;

use crate::shm::ShmRegion;
use crate::shm_node::ShmIdentity;
use crate::traits::{RangeLock, ShmBackend, ShmFile};

// ---------------------------------------------------------------------------
// Lock space
// ---------------------------------------------------------------------------

/// One contiguous piece of bytes locked by an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeldRange {
    owner: u64,
    start: u64,
    end: u64,
    mode: LockMode,
}

impl HeldRange {
    const fn overlaps(&self, range: ByteRange) -> bool {
        self.start < range.end() && range.start < self.end
    }
}

/// A one-shot failure armed on a [`MemoryLockSpace`].
///
/// A fault fires on the next call whose range equals `range` exactly (and
/// whose mode matches, when `mode` is given), then disarms itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFault {
    /// `try_lock` reports contention without touching lock state.
    Contended {
        range: ByteRange,
        mode: Option<LockMode>,
    },
    /// `try_lock` fails with the given OS error number.
    LockError {
        range: ByteRange,
        mode: Option<LockMode>,
        errno: i32,
    },
    /// `unlock` fails with the given OS error number; the lock stays held.
    UnlockError { range: ByteRange, errno: i32 },
}

#[derive(Debug, Default)]
struct SpaceInner {
    held: Vec<HeldRange>,
    next_owner: u64,
    faults: Vec<LockFault>,
    attempts: HashMap<ByteRange, u32>,
}

impl SpaceInner {
    fn take_lock_fault(&mut self, range: ByteRange, mode: LockMode) -> Option<LockFault> {
        let idx = self.faults.iter().position(|fault| match *fault {
            LockFault::Contended { range: r, mode: m }
            | LockFault::LockError {
                range: r, mode: m, ..
            } => r == range && m.is_none_or(|m| m == mode),
            LockFault::UnlockError { .. } => false,
        })?;
        Some(self.faults.remove(idx))
    }

    fn take_unlock_fault(&mut self, range: ByteRange) -> Option<i32> {
        let idx = self.faults.iter().position(
            |fault| matches!(*fault, LockFault::UnlockError { range: r, .. } if r == range),
        )?;
        match self.faults.remove(idx) {
            LockFault::UnlockError { errno, .. } => Some(errno),
            _ => None,
        }
    }

    /// Remove `owner`'s locks from `range`, splitting pieces that straddle it.
    fn subtract(&mut self, owner: u64, range: ByteRange) {
        let mut kept = Vec::with_capacity(self.held.len() + 1);
        for piece in self.held.drain(..) {
            if piece.owner != owner || !piece.overlaps(range) {
                kept.push(piece);
                continue;
            }
            if piece.start < range.start {
                kept.push(HeldRange {
                    end: range.start,
                    ..piece
                });
            }
            if piece.end > range.end() {
                kept.push(HeldRange {
                    start: range.end(),
                    ..piece
                });
            }
        }
        self.held = kept;
    }
}

/// In-process emulation of advisory byte-range locks.
///
/// Every [`MemoryRangeLock`] handed out by [`handle`](Self::handle) is a
/// distinct owner with open-file-description semantics: an owner never
/// conflicts with itself, re-locking its own bytes converts their mode,
/// unlocking splits ranges, and dropping the handle releases everything it
/// held. Handles of one space behave like descriptors of one file opened by
/// separate processes.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockSpace {
    inner: Arc<Mutex<SpaceInner>>,
}

impl MemoryLockSpace {
    /// Create an empty lock space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, independent lock owner.
    #[must_use]
    pub fn handle(&self) -> MemoryRangeLock {
        let mut inner = self.inner.lock();
        let owner = inner.next_owner;
        inner.next_owner += 1;
        drop(inner);
        MemoryRangeLock {
            owner,
            space: Arc::clone(&self.inner),
        }
    }

    /// Arm a one-shot fault.
    pub fn inject_fault(&self, fault: LockFault) {
        self.inner.lock().faults.push(fault);
    }

    /// Disarm every pending fault.
    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Number of `try_lock` calls made for exactly `range`.
    #[must_use]
    pub fn attempts(&self, range: ByteRange) -> u32 {
        self.inner.lock().attempts.get(&range).copied().unwrap_or(0)
    }

    /// Reset every attempt counter.
    pub fn reset_attempts(&self) {
        self.inner.lock().attempts.clear();
    }

    /// Whether no owner holds any lock.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.inner.lock().held.is_empty()
    }

    /// Number of distinct owners holding any byte of `range`.
    #[must_use]
    pub fn holders(&self, range: ByteRange) -> usize {
        let inner = self.inner.lock();
        let mut owners: Vec<u64> = inner
            .held
            .iter()
            .filter(|piece| piece.overlaps(range))
            .map(|piece| piece.owner)
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners.len()
    }
}

/// One lock owner in a [`MemoryLockSpace`].
#[derive(Debug)]
pub struct MemoryRangeLock {
    owner: u64,
    space: Arc<Mutex<SpaceInner>>,
}

impl MemoryRangeLock {
    /// Owner number within the space; assigned in creation order.
    #[must_use]
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Whether this owner holds every byte of `range` in `mode`.
    #[must_use]
    pub fn holds(&self, range: ByteRange, mode: LockMode) -> bool {
        let inner = self.space.lock();
        let mut pieces: Vec<(u64, u64)> = inner
            .held
            .iter()
            .filter(|piece| piece.owner == self.owner && piece.mode == mode)
            .filter(|piece| piece.overlaps(range))
            .map(|piece| (piece.start, piece.end))
            .collect();
        drop(inner);
        pieces.sort_unstable();
        let mut covered = range.start;
        for (start, end) in pieces {
            if start > covered {
                break;
            }
            covered = covered.max(end);
        }
        !range.is_empty() && covered >= range.end()
    }

    /// Whether any other owner holds a lock overlapping `range`.
    #[must_use]
    pub fn held_by_others(&self, range: ByteRange) -> bool {
        self.space
            .lock()
            .held
            .iter()
            .any(|piece| piece.owner != self.owner && piece.overlaps(range))
    }
}

impl RangeLock for MemoryRangeLock {
    fn try_lock(&self, range: ByteRange, mode: LockMode) -> Result<bool> {
        let mut inner = self.space.lock();
        *inner.attempts.entry(range).or_insert(0) += 1;

        match inner.take_lock_fault(range, mode) {
            Some(LockFault::Contended { .. }) => return Ok(false),
            Some(LockFault::LockError { errno, .. }) => {
                return Err(FrankenError::Io(std::io::Error::from_raw_os_error(errno)));
            }
            Some(LockFault::UnlockError { .. }) | None => {}
        }

        if range.is_empty() {
            return Ok(true);
        }
        let conflict = inner.held.iter().any(|piece| {
            piece.owner != self.owner && piece.overlaps(range) && piece.mode.conflicts_with(mode)
        });
        if conflict {
            return Ok(false);
        }
        inner.subtract(self.owner, range);
        inner.held.push(HeldRange {
            owner: self.owner,
            start: range.start,
            end: range.end(),
            mode,
        });
        Ok(true)
    }

    fn unlock(&self, range: ByteRange) -> Result<()> {
        let mut inner = self.space.lock();
        if let Some(errno) = inner.take_unlock_fault(range) {
            return Err(FrankenError::Io(std::io::Error::from_raw_os_error(errno)));
        }
        inner.subtract(self.owner, range);
        Ok(())
    }
}

impl Drop for MemoryRangeLock {
    fn drop(&mut self) {
        let owner = self.owner;
        self.space.lock().held.retain(|piece| piece.owner != owner);
    }
}

// ---------------------------------------------------------------------------
// Shared-memory backend
// ---------------------------------------------------------------------------

/// Contents of one in-memory `-shm` file.
#[derive(Debug, Default)]
struct ShmStorage {
    locks: MemoryLockSpace,
    state: Mutex<ShmContents>,
}

#[derive(Debug, Default)]
struct ShmContents {
    len: u64,
    /// Mapped regions by index; every opener sees the same bytes.
    regions: HashMap<u32, ShmRegion>,
}

type ShmFiles = Arc<Mutex<HashMap<PathBuf, Arc<ShmStorage>>>>;

/// Shared-memory backend whose files live in process memory.
///
/// Each [`open`](ShmBackend::open) is a separate lock owner, so several
/// [`ShmRegistry`](crate::ShmRegistry) instances over one backend behave
/// like separate processes sharing a `-shm` file.
#[derive(Debug, Clone, Default)]
pub struct MemoryShmBackend {
    files: ShmFiles,
}

impl MemoryShmBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a backing file exists for `identity`.
    #[must_use]
    pub fn exists(&self, identity: &ShmIdentity) -> bool {
        self.files.lock().contains_key(identity.path())
    }

    /// Lock space of the backing file, for fault injection and inspection.
    #[must_use]
    pub fn lock_space(&self, identity: &ShmIdentity) -> Option<MemoryLockSpace> {
        self.files
            .lock()
            .get(identity.path())
            .map(|storage| storage.locks.clone())
    }

    /// Current size of the backing file.
    #[must_use]
    pub fn file_len(&self, identity: &ShmIdentity) -> Option<u64> {
        self.files
            .lock()
            .get(identity.path())
            .map(|storage| storage.state.lock().len)
    }
}

impl ShmBackend for MemoryShmBackend {
    fn open(&self, identity: &ShmIdentity) -> Result<Box<dyn ShmFile>> {
        let storage = Arc::clone(
            self.files
                .lock()
                .entry(identity.path().to_path_buf())
                .or_default(),
        );
        let lock = storage.locks.handle();
        Ok(Box::new(MemoryShmFile {
            path: identity.path().to_path_buf(),
            storage,
            lock,
            files: Arc::clone(&self.files),
        }))
    }
}

/// An opened in-memory `-shm` file.
#[derive(Debug)]
pub struct MemoryShmFile {
    path: PathBuf,
    storage: Arc<ShmStorage>,
    lock: MemoryRangeLock,
    files: ShmFiles,
}

impl ShmFile for MemoryShmFile {
    fn range_lock(&self) -> &dyn RangeLock {
        &self.lock
    }

    fn size(&self) -> Result<u64> {
        Ok(self.storage.state.lock().len)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut state = self.storage.state.lock();
        state.regions.retain(|&index, region| {
            let end = u64::from(index + 1) * region.len() as u64;
            end <= len
        });
        state.len = len;
        Ok(())
    }

    fn map_region(&self, index: u32, size: usize) -> Result<ShmRegion> {
        let mut state = self.storage.state.lock();
        let end = (u64::from(index) + 1) * size as u64;
        if end > state.len {
            return Err(FrankenError::IoErr {
                op: IoOp::ShmMap,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("region {index} ends at {end}, file is {} bytes", state.len),
                ),
            });
        }
        let region = state
            .regions
            .entry(index)
            .or_insert_with(|| ShmRegion::new(size));
        if region.len() != size {
            return Err(FrankenError::misuse(format!(
                "region {index} already mapped with {} bytes, requested {size}",
                region.len()
            )));
        }
        Ok(region.clone())
    }

    fn delete(&self) -> Result<()> {
        self.files.lock().remove(&self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EIO: i32 = 5;

    #[test]
    fn shared_locks_coexist_exclusive_conflicts() {
        let space = MemoryLockSpace::new();
        let a = space.handle();
        let b = space.handle();
        let range = ByteRange::new(100, 10);

        assert!(a.try_lock(range, LockMode::Shared).unwrap());
        assert!(b.try_lock(range, LockMode::Shared).unwrap());
        assert!(!b.try_lock(ByteRange::byte(105), LockMode::Exclusive).unwrap());
        assert!(b.try_lock(ByteRange::byte(110), LockMode::Exclusive).unwrap());
        assert_eq!(space.holders(range), 2);
    }

    #[test]
    fn owner_converts_its_own_lock() {
        let space = MemoryLockSpace::new();
        let a = space.handle();
        let range = ByteRange::new(0, 4);

        assert!(a.try_lock(range, LockMode::Shared).unwrap());
        assert!(a.try_lock(range, LockMode::Exclusive).unwrap());
        assert!(a.holds(range, LockMode::Exclusive));
        assert!(!a.holds(range, LockMode::Shared));
        assert!(a.try_lock(range, LockMode::Shared).unwrap());
        assert!(a.holds(range, LockMode::Shared));
    }

    #[test]
    fn unlock_splits_ranges() {
        let space = MemoryLockSpace::new();
        let a = space.handle();
        let b = space.handle();

        assert!(a.try_lock(ByteRange::new(0, 10), LockMode::Exclusive).unwrap());
        a.unlock(ByteRange::new(3, 2)).unwrap();
        assert!(a.holds(ByteRange::new(0, 3), LockMode::Exclusive));
        assert!(a.holds(ByteRange::new(5, 5), LockMode::Exclusive));
        assert!(!a.holds(ByteRange::new(0, 10), LockMode::Exclusive));
        assert!(b.try_lock(ByteRange::new(3, 2), LockMode::Exclusive).unwrap());
        assert!(!b.try_lock(ByteRange::new(2, 2), LockMode::Exclusive).unwrap());
    }

    #[test]
    fn unlock_of_unheld_range_is_noop() {
        let space = MemoryLockSpace::new();
        let a = space.handle();
        a.unlock(ByteRange::new(0, 100)).unwrap();
        assert!(space.is_unlocked());
    }

    #[test]
    fn drop_releases_owner_locks() {
        let space = MemoryLockSpace::new();
        let b = space.handle();
        {
            let a = space.handle();
            assert!(a.try_lock(ByteRange::byte(7), LockMode::Exclusive).unwrap());
            assert!(b.held_by_others(ByteRange::byte(7)));
        }
        assert!(!b.held_by_others(ByteRange::byte(7)));
        assert!(b.try_lock(ByteRange::byte(7), LockMode::Exclusive).unwrap());
    }

    #[test]
    fn faults_fire_once_on_matching_calls() {
        let space = MemoryLockSpace::new();
        let a = space.handle();
        let range = ByteRange::byte(1);

        space.inject_fault(LockFault::Contended {
            range,
            mode: Some(LockMode::Exclusive),
        });
        // Shared mode does not match the armed fault.
        assert!(a.try_lock(range, LockMode::Shared).unwrap());
        assert!(!a.try_lock(range, LockMode::Exclusive).unwrap());
        assert!(a.try_lock(range, LockMode::Exclusive).unwrap());

        space.inject_fault(LockFault::LockError {
            range,
            mode: None,
            errno: EIO,
        });
        let err = a.try_lock(range, LockMode::Shared).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(EIO));

        space.inject_fault(LockFault::UnlockError {
            range,
            errno: EIO,
        });
        assert!(a.unlock(range).is_err());
        // The failed calls left the exclusive lock in place.
        assert!(a.holds(range, LockMode::Exclusive));
        a.unlock(range).unwrap();
        assert!(space.is_unlocked());
    }

    #[test]
    fn attempts_are_counted_per_range() {
        let space = MemoryLockSpace::new();
        let a = space.handle();
        for _ in 0..3 {
            let _ = a.try_lock(ByteRange::PENDING, LockMode::Exclusive).unwrap();
        }
        let _ = a.try_lock(ByteRange::RESERVED, LockMode::Exclusive).unwrap();
        assert_eq!(space.attempts(ByteRange::PENDING), 3);
        assert_eq!(space.attempts(ByteRange::RESERVED), 1);
        space.reset_attempts();
        assert_eq!(space.attempts(ByteRange::PENDING), 0);
    }

    #[test]
    fn shm_backend_shares_regions_between_openers() {
        let backend = MemoryShmBackend::new();
        let identity = ShmIdentity::from_path("/virtual/test.db-shm");
        let first = backend.open(&identity).unwrap();
        let second = backend.open(&identity).unwrap();

        first.truncate(64).unwrap();
        assert_eq!(second.size().unwrap(), 64);
        let a = first.map_region(0, 32).unwrap();
        let b = second.map_region(0, 32).unwrap();
        a.write_u32_le(4, 0xDEAD_BEEF).unwrap();
        assert_eq!(b.read_u32_le(4).unwrap(), 0xDEAD_BEEF);

        assert!(second.map_region(0, 16).is_err());
        assert!(second.map_region(2, 32).is_err());

        // Separate openers are separate lock owners.
        assert!(first
            .range_lock()
            .try_lock(ByteRange::byte(3), LockMode::Exclusive)
            .unwrap());
        assert!(!second
            .range_lock()
            .try_lock(ByteRange::byte(3), LockMode::Shared)
            .unwrap());

        first.truncate(0).unwrap();
        let fresh = second.map_region(0, 32);
        assert!(fresh.is_err());
        second.truncate(32).unwrap();
        assert_eq!(second.map_region(0, 32).unwrap().read_u32_le(4).unwrap(), 0);

        first.delete().unwrap();
        assert!(!backend.exists(&identity));
    }
}
