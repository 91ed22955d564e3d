//! Lock coordination for FrankenSQLite database files.
//!
//! - [`FileLockState`]: the five-level file lock protocol over the reserved
//!   lock bytes of a database file.
//! - [`ShmRegistry`] / [`ShmHandle`]: the process-wide shared-memory index
//!   table and its per-connection slot locks.
//! - [`RangeLock`]: the advisory byte-range lock seam, implemented by
//!   [`FcntlRangeLock`] on unix and by [`MemoryRangeLock`] in process.

pub mod config;
pub mod lock;
pub mod memory;
pub mod retry;
pub mod shm;
pub mod shm_lock;
pub mod shm_node;
pub mod strategy;
pub mod traits;
#[cfg(unix)]
pub mod unix;

pub use config::{LOCK_STRATEGY_ENV, LockConfig, LockStrategyKind, RetryPolicy};
pub use lock::FileLockState;
pub use memory::{LockFault, MemoryLockSpace, MemoryRangeLock, MemoryShmBackend, MemoryShmFile};
pub use retry::retry;
pub use shm::{ShmRegion, ShmRegionGuard};
pub use shm_node::{DeadmanOutcome, ShmHandle, ShmIdentity, ShmRegistry};
pub use strategy::{FullRangeStrategy, ReadLockStrategy, SharedToken, SingleByteStrategy};
pub use traits::{RangeLock, ShmBackend, ShmFile};
#[cfg(unix)]
pub use unix::{FcntlFlavor, FcntlRangeLock, UnixShmBackend, UnixShmFile};
