//! fcntl advisory byte-range locks and the file-backed shared-memory backend.
//!
//! Classic POSIX record locks (`F_SETLK`) belong to the process: two
//! descriptors of one file opened by the same process never conflict, and
//! closing either drops the locks of both. Open-file-description locks
//! (`F_OFD_SETLK`, Linux) belong to the descriptor instead, which gives
//! every [`FcntlRangeLock`] the same owner semantics as the in-memory
//! backend and lets two handles in one process exclude each other.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use fsqlite_error::{FrankenError, IoOp, Result};
use fsqlite_types::{ByteRange, LockMode};
use memmap2::MmapOptions;
use tracing::{debug, warn};

use crate::shm::ShmRegion;
use crate::shm_node::ShmIdentity;
use crate::traits::{RangeLock, ShmBackend, ShmFile};

/// Which fcntl lock family a [`FcntlRangeLock`] issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FcntlFlavor {
    /// `F_OFD_SETLK`: owned by the open file description.
    OpenFileDescription,
    /// `F_SETLK`: owned by the process.
    Process,
}

impl FcntlFlavor {
    /// OFD locks where the platform has them, process locks elsewhere.
    #[must_use]
    pub const fn platform_default() -> Self {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            Self::OpenFileDescription
        } else {
            Self::Process
        }
    }

    /// Whether this platform supports the flavor.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        match self {
            Self::OpenFileDescription => cfg!(any(target_os = "linux", target_os = "android")),
            Self::Process => true,
        }
    }
}

/// fcntl locks on one open file.
#[derive(Debug)]
pub struct FcntlRangeLock {
    file: File,
    flavor: FcntlFlavor,
}

impl FcntlRangeLock {
    /// Wrap `file` with the platform's default flavor.
    #[must_use]
    pub fn new(file: File) -> Self {
        Self {
            file,
            flavor: FcntlFlavor::platform_default(),
        }
    }

    /// Wrap `file` with an explicit flavor.
    pub fn with_flavor(file: File, flavor: FcntlFlavor) -> Result<Self> {
        if !flavor.is_supported() {
            return Err(FrankenError::Unsupported);
        }
        Ok(Self { file, flavor })
    }

    /// Open `path` read-write, creating it if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| {
                warn!(
                    target: "fsqlite_vfs::unix",
                    path = %path.display(),
                    error = %source,
                    "cannot open file for locking"
                );
                FrankenError::CannotOpen {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        Ok(Self::new(file))
    }

    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[must_use]
    pub fn flavor(&self) -> FcntlFlavor {
        self.flavor
    }

    /// Issue a non-blocking set-lock. `Ok(false)` if another owner conflicts.
    fn setlk(&self, lock_type: i32, range: ByteRange) -> Result<bool> {
        let l_type = i16::try_from(lock_type)
            .map_err(|_| FrankenError::internal("fcntl lock type does not fit in i16"))?;
        let l_whence = i16::try_from(libc::SEEK_SET)
            .map_err(|_| FrankenError::internal("SEEK_SET does not fit in i16"))?;
        let offset = |value: u64| {
            libc::off_t::try_from(value).map_err(|_| FrankenError::OutOfRange {
                what: "lock offset".to_owned(),
                value: value.to_string(),
            })
        };
        let flock = libc::flock {
            l_type,
            l_whence,
            l_start: offset(range.start)?,
            l_len: offset(range.len)?,
            l_pid: 0,
        };

        let fd = self.file.as_raw_fd();
        let outcome = match self.flavor {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            FcntlFlavor::OpenFileDescription => {
                nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_OFD_SETLK(&flock))
            }
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            FcntlFlavor::OpenFileDescription => return Err(FrankenError::Unsupported),
            FcntlFlavor::Process => nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETLK(&flock)),
        };

        match outcome {
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
            Err(errno) => {
                warn!(
                    target: "fsqlite_vfs::unix",
                    fd,
                    offset = range.start,
                    len = range.len,
                    %errno,
                    "fcntl lock call failed"
                );
                Err(FrankenError::Io(errno.into()))
            }
        }
    }
}

impl RangeLock for FcntlRangeLock {
    fn try_lock(&self, range: ByteRange, mode: LockMode) -> Result<bool> {
        // A zero length would mean "to end of file" to fcntl.
        if range.is_empty() {
            return Ok(true);
        }
        let lock_type = match mode {
            LockMode::Shared => libc::F_RDLCK,
            LockMode::Exclusive => libc::F_WRLCK,
        };
        self.setlk(lock_type, range)
    }

    fn unlock(&self, range: ByteRange) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        if self.setlk(libc::F_UNLCK, range)? {
            Ok(())
        } else {
            Err(FrankenError::internal("F_UNLCK reported contention"))
        }
    }
}

// ---------------------------------------------------------------------------
// Shared-memory backend
// ---------------------------------------------------------------------------

/// Shared-memory backend over real `-shm` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixShmBackend;

impl ShmBackend for UnixShmBackend {
    fn open(&self, identity: &ShmIdentity) -> Result<Box<dyn ShmFile>> {
        let path = identity.path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| {
                warn!(
                    target: "fsqlite_vfs::unix",
                    path = %path.display(),
                    error = %source,
                    "cannot open shm file"
                );
                FrankenError::IoErr {
                    op: IoOp::ShmOpen,
                    source,
                }
            })?;
        debug!(target: "fsqlite_vfs::unix", path = %path.display(), "opened shm file");
        Ok(Box::new(UnixShmFile {
            path: path.to_path_buf(),
            lock: FcntlRangeLock::new(file),
        }))
    }
}

/// An opened `-shm` file.
#[derive(Debug)]
pub struct UnixShmFile {
    path: PathBuf,
    lock: FcntlRangeLock,
}

impl ShmFile for UnixShmFile {
    fn range_lock(&self) -> &dyn RangeLock {
        &self.lock
    }

    fn size(&self) -> Result<u64> {
        self.lock
            .file()
            .metadata()
            .map(|meta| meta.len())
            .map_err(|source| FrankenError::IoErr {
                op: IoOp::ShmSize,
                source,
            })
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.lock
            .file()
            .set_len(len)
            .map_err(|source| FrankenError::IoErr {
                op: IoOp::ShmSize,
                source,
            })
    }

    fn map_region(&self, index: u32, size: usize) -> Result<ShmRegion> {
        let offset = u64::from(index) * size as u64;
        // SAFETY: the mapping covers bytes the node has already allocated in
        // the file, and the node keeps this file open for as long as any
        // region handed out from it is cached. Concurrent writers in other
        // processes are coordinated by the slot locks, not by Rust aliasing.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(size)
                .map_mut(self.lock.file())
        }
        .map_err(|source| FrankenError::IoErr {
            op: IoOp::ShmMap,
            source,
        })?;
        Ok(ShmRegion::from_mmap(map))
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(FrankenError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_temp_path(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn test_same_descriptor_converts_lock() {
        let (_dir, path) = make_temp_path("convert.db");
        let lock = FcntlRangeLock::open(&path).unwrap();
        assert!(lock.try_lock(ByteRange::SHARED, LockMode::Shared).unwrap());
        assert!(lock.try_lock(ByteRange::SHARED, LockMode::Exclusive).unwrap());
        lock.unlock(ByteRange::SHARED).unwrap();
        // Unlocking bytes that are not held is not an error.
        lock.unlock(ByteRange::PENDING).unwrap();
    }

    #[test]
    fn test_open_failure_keeps_os_error() {
        let (_dir, path) = make_temp_path("missing/dir/x.db");
        let err = FcntlRangeLock::open(&path).unwrap_err();
        assert!(matches!(err, FrankenError::CannotOpen { .. }));
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert!(err.to_string().contains("x.db"));
    }

    #[test]
    fn test_empty_range_is_trivially_locked() {
        let (_dir, path) = make_temp_path("empty.db");
        let lock = FcntlRangeLock::open(&path).unwrap();
        assert!(lock
            .try_lock(ByteRange::new(10, 0), LockMode::Exclusive)
            .unwrap());
        lock.unlock(ByteRange::new(10, 0)).unwrap();
    }

    #[test]
    fn test_process_locks_do_not_exclude_same_process() {
        let (_dir, path) = make_temp_path("process.db");
        let open = || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap();
            FcntlRangeLock::with_flavor(file, FcntlFlavor::Process).unwrap()
        };
        let a = open();
        let b = open();
        assert!(a.try_lock(ByteRange::RESERVED, LockMode::Exclusive).unwrap());
        assert!(b.try_lock(ByteRange::RESERVED, LockMode::Exclusive).unwrap());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_ofd_locks_exclude_other_descriptors() {
        let (_dir, path) = make_temp_path("ofd.db");
        let a = FcntlRangeLock::open(&path).unwrap();
        let b = FcntlRangeLock::open(&path).unwrap();
        assert_eq!(a.flavor(), FcntlFlavor::OpenFileDescription);

        assert!(a.try_lock(ByteRange::SHARED, LockMode::Shared).unwrap());
        assert!(b.try_lock(ByteRange::SHARED, LockMode::Shared).unwrap());
        assert!(!b.try_lock(ByteRange::SHARED, LockMode::Exclusive).unwrap());

        assert!(a.try_lock(ByteRange::RESERVED, LockMode::Exclusive).unwrap());
        assert!(!b.try_lock(ByteRange::RESERVED, LockMode::Exclusive).unwrap());

        drop(a);
        assert!(b.try_lock(ByteRange::RESERVED, LockMode::Exclusive).unwrap());
        assert!(b.try_lock(ByteRange::SHARED, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn test_shm_file_map_and_reopen() {
        let (_dir, path) = make_temp_path("test.db-shm");
        let identity = ShmIdentity::from_path(&path);
        let backend = UnixShmBackend;

        let first = backend.open(&identity).unwrap();
        assert_eq!(first.size().unwrap(), 0);
        first.truncate(32 * 1024).unwrap();
        let region = first.map_region(0, 32 * 1024).unwrap();
        assert!(region.is_mapped());
        region.write_u32_le(16, 0xC0FF_EE00).unwrap();

        let second = backend.open(&identity).unwrap();
        let again = second.map_region(0, 32 * 1024).unwrap();
        assert_eq!(again.read_u32_le(16).unwrap(), 0xC0FF_EE00);

        drop((region, again));
        first.truncate(0).unwrap();
        assert_eq!(second.size().unwrap(), 0);
        first.delete().unwrap();
        assert!(!path.exists());
        // Deleting twice is fine.
        second.delete().unwrap();
    }
}
