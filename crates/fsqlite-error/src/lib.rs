use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for the FrankenSQLite lock layer.
///
/// Modeled after SQLite's result codes: contention is always [`Busy`],
/// anything the operating system rejected for another reason is an I/O
/// error carrying the original OS diagnostic, and out-of-sequence calls are
/// [`Misuse`].
///
/// [`Busy`]: FrankenError::Busy
/// [`Misuse`]: FrankenError::Misuse
#[derive(Error, Debug)]
pub enum FrankenError {
    // === BUSY ===
    /// A lock is held by another connection or process. Always retryable.
    #[error("database is busy")]
    Busy,

    // === I/O Errors ===
    /// Raw I/O error from the operating system, not yet tagged with the
    /// lock operation that produced it.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk I/O error raised by a specific lock or shared-memory operation.
    #[error("disk I/O error during {op}: {source}")]
    IoErr {
        op: IoOp,
        #[source]
        source: std::io::Error,
    },

    /// A previously held lock could not be restored; the caller has lost
    /// the guarantee it held before the failed call.
    #[error("lock lost: {detail}")]
    LockLost { detail: String },

    // === Caller Errors ===
    /// Lock transition or request that is not valid from the current state.
    #[error("library routine called out of sequence: {detail}")]
    Misuse { detail: String },

    /// Cannot open the backing file.
    #[error("unable to open file: '{path}': {source}")]
    CannotOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Value out of range.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: String, value: String },

    // === Internal Errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation is not supported by the current backend or platform.
    #[error("unsupported operation")]
    Unsupported,
}

/// The lock-layer operation an I/O error belongs to.
///
/// Each operation maps onto one of SQLite's extended `SQLITE_IOERR_*`
/// codes so callers can report the same diagnostics as C SQLite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    /// Acquiring a file lock byte or range.
    Lock,
    /// Releasing a file lock byte or range.
    Unlock,
    /// Acquiring or restoring the shared (read) lock.
    ReadLock,
    /// Probing the reserved byte.
    CheckReservedLock,
    /// Opening or initialising the shared-memory file.
    ShmOpen,
    /// Querying or growing the shared-memory file.
    ShmSize,
    /// Acquiring or releasing a shared-memory slot lock.
    ShmLock,
    /// Mapping a shared-memory region.
    ShmMap,
}

impl IoOp {
    /// Extended result code (`SQLITE_IOERR | (n << 8)`).
    pub const fn extended_code(self) -> i32 {
        let minor = match self {
            Self::Unlock => 8,
            Self::ReadLock => 9,
            Self::CheckReservedLock => 14,
            Self::Lock => 15,
            Self::ShmOpen => 18,
            Self::ShmSize => 19,
            Self::ShmLock => 20,
            Self::ShmMap => 21,
        };
        ErrorCode::IoErr as i32 | (minor << 8)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::ReadLock => "read lock",
            Self::CheckReservedLock => "check reserved lock",
            Self::ShmOpen => "shm open",
            Self::ShmSize => "shm size",
            Self::ShmLock => "shm lock",
            Self::ShmMap => "shm map",
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQLite primary result codes used by the lock layer.
///
/// These match the numeric values from C SQLite's `sqlite3.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Database file is locked.
    Busy = 5,
    /// Disk I/O error.
    IoErr = 10,
    /// Unable to open database file.
    CantOpen = 14,
    /// Library used incorrectly.
    Misuse = 21,
    /// OS feature not available.
    NoLfs = 22,
    /// Parameter out of range.
    Range = 25,
}

impl FrankenError {
    /// Map this error to a SQLite primary result code.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Busy => ErrorCode::Busy,
            Self::Io(_) | Self::IoErr { .. } | Self::LockLost { .. } => ErrorCode::IoErr,
            Self::Misuse { .. } => ErrorCode::Misuse,
            Self::CannotOpen { .. } => ErrorCode::CantOpen,
            Self::OutOfRange { .. } => ErrorCode::Range,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Unsupported => ErrorCode::NoLfs,
        }
    }

    /// Extended result code; equal to the primary code when no extended
    /// code applies.
    pub const fn extended_code(&self) -> i32 {
        match self {
            Self::IoErr { op, .. } => op.extended_code(),
            Self::LockLost { .. } => IoOp::ReadLock.extended_code(),
            _ => self.error_code() as i32,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Whether this error reports an operating-system failure.
    pub const fn is_io(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::IoErr { .. } | Self::LockLost { .. }
        )
    }

    /// The OS error number attached to this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err)
            | Self::IoErr { source: err, .. }
            | Self::CannotOpen { source: err, .. } => err.raw_os_error(),
            _ => None,
        }
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Busy => Some("Retry the operation after a short delay"),
            Self::LockLost { .. } => {
                Some("Roll back the current transaction and reacquire locks from UNLOCKED")
            }
            Self::Misuse { .. } => Some("Check the lock level before requesting a transition"),
            _ => None,
        }
    }

    /// Tag a raw [`FrankenError::Io`] with the operation that produced it.
    ///
    /// Other variants are returned unchanged.
    #[must_use]
    pub fn with_io_op(self, op: IoOp) -> Self {
        match self {
            Self::Io(source) => Self::IoErr { op, source },
            other => other,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a misuse error.
    pub fn misuse(detail: impl Into<String>) -> Self {
        Self::Misuse {
            detail: detail.into(),
        }
    }

    /// Create a lock-lost error.
    pub fn lock_lost(detail: impl Into<String>) -> Self {
        Self::LockLost {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `FrankenError`.
pub type Result<T> = std::result::Result<T, FrankenError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn eio() -> std::io::Error {
        std::io::Error::from_raw_os_error(5)
    }

    #[test]
    fn error_display_busy() {
        assert_eq!(FrankenError::Busy.to_string(), "database is busy");
    }

    #[test]
    fn error_display_io_err_names_operation() {
        let err = FrankenError::IoErr {
            op: IoOp::Unlock,
            source: std::io::Error::other("bad descriptor"),
        };
        assert_eq!(err.to_string(), "disk I/O error during unlock: bad descriptor");
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(FrankenError::Busy.error_code(), ErrorCode::Busy);
        assert_eq!(FrankenError::Io(eio()).error_code(), ErrorCode::IoErr);
        assert_eq!(
            FrankenError::lock_lost("shared").error_code(),
            ErrorCode::IoErr
        );
        assert_eq!(FrankenError::misuse("x").error_code(), ErrorCode::Misuse);
        assert_eq!(FrankenError::internal("x").error_code(), ErrorCode::Internal);
        assert_eq!(FrankenError::Unsupported.error_code(), ErrorCode::NoLfs);
    }

    #[test]
    fn extended_codes_match_sqlite() {
        assert_eq!(IoOp::Unlock.extended_code(), 2058);
        assert_eq!(IoOp::ReadLock.extended_code(), 2314);
        assert_eq!(IoOp::CheckReservedLock.extended_code(), 3594);
        assert_eq!(IoOp::Lock.extended_code(), 3850);
        assert_eq!(IoOp::ShmOpen.extended_code(), 4618);
        assert_eq!(IoOp::ShmSize.extended_code(), 4874);
        assert_eq!(IoOp::ShmLock.extended_code(), 5130);
        assert_eq!(IoOp::ShmMap.extended_code(), 5386);

        assert_eq!(FrankenError::Busy.extended_code(), 5);
        assert_eq!(FrankenError::lock_lost("x").extended_code(), 2314);
    }

    #[test]
    fn with_io_op_preserves_os_error() {
        let err = FrankenError::Io(eio()).with_io_op(IoOp::Lock);
        assert!(matches!(err, FrankenError::IoErr { op: IoOp::Lock, .. }));
        assert_eq!(err.raw_os_error(), Some(5));
        assert_eq!(err.extended_code(), 3850);

        let busy = FrankenError::Busy.with_io_op(IoOp::Lock);
        assert!(matches!(busy, FrankenError::Busy));
    }

    #[test]
    fn only_busy_is_transient() {
        assert!(FrankenError::Busy.is_transient());
        assert!(!FrankenError::Io(eio()).is_transient());
        assert!(!FrankenError::lock_lost("x").is_transient());
        assert!(!FrankenError::misuse("x").is_transient());
    }

    #[test]
    fn io_classification() {
        assert!(FrankenError::Io(eio()).is_io());
        assert!(FrankenError::lock_lost("x").is_io());
        assert!(!FrankenError::Busy.is_io());
        assert!(!FrankenError::misuse("x").is_io());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: FrankenError = io_err.into();
        assert!(matches!(err, FrankenError::Io(_)));
        assert_eq!(err.error_code(), ErrorCode::IoErr);
    }

    #[test]
    fn suggestions() {
        assert!(FrankenError::Busy.suggestion().is_some());
        assert!(FrankenError::lock_lost("x").suggestion().is_some());
        assert!(FrankenError::Unsupported.suggestion().is_none());
    }
}
