use std::fmt;

use fsqlite_error::Result;
use fsqlite_types::{ByteRange, LockMode};

use crate::shm::ShmRegion;
use crate::shm_node::ShmIdentity;

/// Advisory byte-range lock primitive of the operating environment.
///
/// Both calls fail fast: contention is reported as `Ok(false)` from
/// [`try_lock`](Self::try_lock) and never waits. Any other failure is an
/// `Err` carrying the OS diagnostic.
///
/// Ownership follows open-file-description semantics: locks belong to the
/// `RangeLock` value, re-locking an owned range converts its mode, and
/// unlocking releases only this owner's bytes.
pub trait RangeLock: Send + Sync + fmt::Debug {
    /// Try to lock `range` in `mode` without blocking.
    fn try_lock(&self, range: ByteRange, mode: LockMode) -> Result<bool>;

    /// Release any lock this owner holds on `range`.
    fn unlock(&self, range: ByteRange) -> Result<()>;
}

/// Opens the backing file of a shared-memory index.
///
/// One `ShmBackend` serves one [`ShmRegistry`](crate::ShmRegistry); each
/// call to [`open`](Self::open) yields an independent lock owner.
pub trait ShmBackend: Send + Sync + fmt::Debug {
    fn open(&self, identity: &ShmIdentity) -> Result<Box<dyn ShmFile>>;
}

/// The opened backing file of a shared-memory index.
///
/// Access is serialized by the owning node's mutex.
pub trait ShmFile: Send + Sync + fmt::Debug {
    /// Advisory locks on the shared-memory file.
    fn range_lock(&self) -> &dyn RangeLock;

    /// Current size of the backing file in bytes.
    fn size(&self) -> Result<u64>;

    /// Set the backing file size, zero-filling on growth.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Map region `index` of `size` bytes. The file already covers it.
    fn map_region(&self, index: u32, size: usize) -> Result<ShmRegion>;

    /// Remove the backing file.
    fn delete(&self) -> Result<()>;
}

impl<T: RangeLock + ?Sized> RangeLock for &T {
    fn try_lock(&self, range: ByteRange, mode: LockMode) -> Result<bool> {
        (**self).try_lock(range, mode)
    }

    fn unlock(&self, range: ByteRange) -> Result<()> {
        (**self).unlock(range)
    }
}

impl<T: RangeLock + ?Sized> RangeLock for Box<T> {
    fn try_lock(&self, range: ByteRange, mode: LockMode) -> Result<bool> {
        (**self).try_lock(range, mode)
    }

    fn unlock(&self, range: ByteRange) -> Result<()> {
        (**self).unlock(range)
    }
}

impl<T: RangeLock + ?Sized> RangeLock for std::sync::Arc<T> {
    fn try_lock(&self, range: ByteRange, mode: LockMode) -> Result<bool> {
        (**self).try_lock(range, mode)
    }

    fn unlock(&self, range: ByteRange) -> Result<()> {
        (**self).unlock(range)
    }
}
