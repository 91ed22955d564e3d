//! Five-level file lock state machine.
//!
//! A [`FileLockState`] drives one handle's advisory locks on the reserved
//! lock bytes of a database file:
//!
//! | level       | bytes held                                               |
//! |-------------|----------------------------------------------------------|
//! | `None`      | nothing                                                  |
//! | `Shared`    | read lock on the shared range (per strategy)             |
//! | `Reserved`  | read lock + `RESERVED` exclusive                         |
//! | `Pending`   | read lock + `RESERVED` + `PENDING` exclusive             |
//! | `Exclusive` | `RESERVED` + `PENDING` + whole shared range exclusive    |
//!
//! `PENDING` is also taken briefly while acquiring `Shared`, which is what
//! keeps new readers out once a writer is waiting. Every OS call fails fast;
//! the only wait is the bounded retry on the `PENDING` byte.

use fsqlite_error::{FrankenError, IoOp, Result};
use fsqlite_types::{ByteRange, LockLevel, LockMode};
use tracing::{debug, error, warn};

use crate::config::{LockConfig, LockStrategyKind, RetryPolicy};
use crate::retry::retry;
use crate::strategy::{self, ReadLockStrategy, SharedToken};
use crate::traits::RangeLock;

/// Lock state of one open file handle.
///
/// Not internally synchronized: a handle shared between threads must be
/// serialized by its owner.
#[derive(Debug)]
pub struct FileLockState<L: RangeLock> {
    lock: L,
    strategy: Box<dyn ReadLockStrategy>,
    pending_retry: RetryPolicy,
    level: LockLevel,
    shared_token: Option<SharedToken>,
    pending_held: bool,
    /// `RESERVED` left held below `Reserved` by a failed unlock.
    stray_reserved: bool,
    last_errno: Option<i32>,
}

impl<L: RangeLock> FileLockState<L> {
    /// Lock state over `lock`, starting at `None`.
    pub fn new(lock: L, config: LockConfig) -> Self {
        Self::with_strategy(lock, strategy::for_kind(config.strategy), config.pending_retry)
    }

    /// Lock state with an explicit read-lock strategy object.
    pub fn with_strategy(
        lock: L,
        strategy: Box<dyn ReadLockStrategy>,
        pending_retry: RetryPolicy,
    ) -> Self {
        Self {
            lock,
            strategy,
            pending_retry,
            level: LockLevel::None,
            shared_token: None,
            pending_held: false,
            stray_reserved: false,
            last_errno: None,
        }
    }

    #[must_use]
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Read lock currently held, if any. `None` at `Exclusive`.
    #[must_use]
    pub fn shared_token(&self) -> Option<SharedToken> {
        self.shared_token
    }

    #[must_use]
    pub fn strategy_kind(&self) -> LockStrategyKind {
        self.strategy.kind()
    }

    /// OS error number of the last failed lock call.
    #[must_use]
    pub fn last_errno(&self) -> Option<i32> {
        self.last_errno
    }

    /// Whether this handle holds the `PENDING` byte.
    #[must_use]
    pub fn pending_held(&self) -> bool {
        self.pending_held
    }

    #[must_use]
    pub fn range_lock(&self) -> &L {
        &self.lock
    }

    /// Raise the lock to at least `target`.
    ///
    /// Already holding `target` or more is a no-op. A target that is not
    /// reachable from the current level is [`FrankenError::Misuse`].
    /// Contention returns [`FrankenError::Busy`] with the level unchanged.
    pub fn acquire(&mut self, target: LockLevel) -> Result<()> {
        let from = self.level;
        if from >= target {
            return Ok(());
        }
        if !from.can_escalate_to(target) {
            return Err(FrankenError::misuse(format!(
                "cannot acquire {target} while holding {from}"
            )));
        }

        let result = match target {
            LockLevel::None => Ok(()),
            LockLevel::Shared => self.acquire_shared(),
            LockLevel::Reserved => self.acquire_reserved(),
            LockLevel::Pending => self.acquire_pending(),
            LockLevel::Exclusive => self.acquire_exclusive(),
        };
        match &result {
            Ok(()) => debug!(
                target: "fsqlite_vfs::lock",
                from = %from,
                to = %self.level,
                strategy = self.strategy.kind().as_str(),
                "lock acquired"
            ),
            Err(err) => debug!(
                target: "fsqlite_vfs::lock",
                from = %from,
                requested = %target,
                level = %self.level,
                error = %err,
                "lock not acquired"
            ),
        }
        result
    }

    fn acquire_shared(&mut self) -> Result<()> {
        if !self.take_pending()? {
            return Err(FrankenError::Busy);
        }
        let read = self
            .strategy
            .lock_read(&self.lock)
            .map_err(|err| self.tag(IoOp::ReadLock, err));
        if let Ok(Some(token)) = read {
            self.shared_token = Some(token);
            self.level = LockLevel::Shared;
        }
        // PENDING only guards the acquisition itself.
        let unlocked = self.drop_pending();
        match read? {
            Some(_) => unlocked,
            None => unlocked.and(Err(FrankenError::Busy)),
        }
    }

    fn acquire_reserved(&mut self) -> Result<()> {
        if self.take_reserved()? {
            self.level = LockLevel::Reserved;
            Ok(())
        } else {
            Err(FrankenError::Busy)
        }
    }

    fn acquire_pending(&mut self) -> Result<()> {
        let waypoint = self.enter_pending()?;
        if waypoint.entered {
            self.level = LockLevel::Pending;
            Ok(())
        } else {
            Err(FrankenError::Busy)
        }
    }

    fn acquire_exclusive(&mut self) -> Result<()> {
        let prior = self.level;
        let waypoint = self.enter_pending()?;
        if !waypoint.entered {
            return Err(FrankenError::Busy);
        }

        let token = self.shared_token.take();
        if let Some(token) = token {
            if let Err(err) = self.strategy.unlock_read(&self.lock, token) {
                self.shared_token = Some(token);
                let err = self.tag(IoOp::Unlock, err);
                self.leave_waypoint(waypoint);
                return Err(err);
            }
        }

        match self.lock.try_lock(ByteRange::SHARED, LockMode::Exclusive) {
            Ok(true) => {
                self.level = LockLevel::Exclusive;
                Ok(())
            }
            outcome => {
                let failure = match outcome {
                    Err(err) => self.tag(IoOp::Lock, err),
                    Ok(_) => FrankenError::Busy,
                };
                self.restore_after_failed_exclusive(prior, token, waypoint, failure)
            }
        }
    }

    /// Put back the read lock given up for a failed `Exclusive` attempt.
    ///
    /// The same token is re-taken; other readers cannot have claimed its
    /// bytes in between because this handle still holds `PENDING`.
    fn restore_after_failed_exclusive(
        &mut self,
        prior: LockLevel,
        token: Option<SharedToken>,
        waypoint: Waypoint,
        failure: FrankenError,
    ) -> Result<()> {
        let Some(token) = token else {
            self.leave_waypoint(waypoint);
            self.level = prior;
            return Err(failure);
        };
        match self.lock.try_lock(token.range(), token.mode()) {
            Ok(true) => {
                self.shared_token = Some(token);
                self.leave_waypoint(waypoint);
                self.level = prior;
                Err(failure)
            }
            outcome => {
                let cause = match outcome {
                    Err(err) => self.tag(IoOp::ReadLock, err).to_string(),
                    Ok(_) => "read lock contended".to_owned(),
                };
                error!(
                    target: "fsqlite_vfs::lock",
                    prior = %prior,
                    exclusive_error = %failure,
                    %cause,
                    "read lock lost after failed exclusive attempt"
                );
                self.abandon();
                Err(FrankenError::lock_lost(format!(
                    "could not restore {prior} after failed EXCLUSIVE ({failure}): {cause}"
                )))
            }
        }
    }

    /// Lower the lock to `target`, which must be `Shared` or `None`.
    ///
    /// Holding `target` or less leaves the level alone and only frees bytes
    /// that earlier failed unlocks left behind. Every unlock is attempted
    /// even after a failure; the level ends at `target` and the first I/O
    /// error is returned.
    pub fn release_to(&mut self, target: LockLevel) -> Result<()> {
        if !target.is_release_target() {
            return Err(FrankenError::misuse(format!(
                "cannot release to {target}; only SHARED or NONE"
            )));
        }
        let from = self.level;
        if from <= target {
            return self.release_leftovers();
        }

        let mut first_err: Option<FrankenError> = None;
        let mut lost: Option<String> = None;

        if from == LockLevel::Exclusive {
            if let Err(err) = self.lock.unlock(ByteRange::SHARED) {
                let err = self.tag(IoOp::Unlock, err);
                first_err.get_or_insert(err);
            }
            if target == LockLevel::Shared {
                match self.strategy.lock_read(&self.lock) {
                    Ok(Some(token)) => self.shared_token = Some(token),
                    Ok(None) => lost = Some("read lock contended".to_owned()),
                    Err(err) => lost = Some(self.tag(IoOp::ReadLock, err).to_string()),
                }
            }
        }
        if from >= LockLevel::Reserved || self.stray_reserved {
            if let Err(err) = self.drop_reserved() {
                first_err.get_or_insert(err);
            }
        }
        if self.pending_held {
            if let Err(err) = self.drop_pending() {
                first_err.get_or_insert(err);
            }
        }
        if target == LockLevel::None {
            if let Some(token) = self.shared_token.take() {
                if let Err(err) = self.strategy.unlock_read(&self.lock, token) {
                    let err = self.tag(IoOp::Unlock, err);
                    first_err.get_or_insert(err);
                }
            }
        }

        if let Some(cause) = lost {
            error!(
                target: "fsqlite_vfs::lock",
                from = %from,
                %cause,
                "read lock lost while downgrading from EXCLUSIVE"
            );
            self.abandon();
            return Err(FrankenError::lock_lost(format!(
                "could not re-take SHARED after EXCLUSIVE: {cause}"
            )));
        }

        self.level = target;
        debug!(target: "fsqlite_vfs::lock", from = %from, to = %target, "lock released");
        first_err.map_or(Ok(()), Err)
    }

    /// Whether any handle holds `RESERVED` or higher on this file.
    ///
    /// Answered locally when this handle does; otherwise probes the
    /// `RESERVED` byte and releases the probe at once. A probe that cannot
    /// be released is remembered and freed by the next [`release_to`].
    ///
    /// [`release_to`]: Self::release_to
    pub fn check_reserved(&mut self) -> Result<bool> {
        if self.level >= LockLevel::Reserved {
            return Ok(true);
        }
        match self.lock.try_lock(ByteRange::RESERVED, LockMode::Exclusive) {
            Ok(true) => {
                match self.lock.unlock(ByteRange::RESERVED) {
                    Ok(()) => self.stray_reserved = false,
                    Err(err) => {
                        let err = self.tag(IoOp::CheckReservedLock, err);
                        self.stray_reserved = true;
                        warn!(
                            target: "fsqlite_vfs::lock",
                            error = %err,
                            "RESERVED probe not released"
                        );
                    }
                }
                Ok(false)
            }
            Ok(false) => Ok(true),
            Err(err) => Err(self.tag(IoOp::CheckReservedLock, err)),
        }
    }

    /// Release every lock. The state can be reused afterwards.
    pub fn close(&mut self) -> Result<()> {
        self.release_to(LockLevel::None)
    }

    // -----------------------------------------------------------------------
    // Byte helpers
    // -----------------------------------------------------------------------

    /// Take `PENDING` under the bounded retry. `Ok(false)` when exhausted.
    fn take_pending(&mut self) -> Result<bool> {
        let policy = self.pending_retry;
        let lock = &self.lock;
        let outcome = retry(policy, |_| {
            lock.try_lock(ByteRange::PENDING, LockMode::Exclusive)
        });
        match outcome {
            Ok(true) => {
                self.pending_held = true;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => Err(self.tag(IoOp::Lock, err)),
        }
    }

    fn drop_pending(&mut self) -> Result<()> {
        self.lock
            .unlock(ByteRange::PENDING)
            .map_err(|err| self.tag(IoOp::Unlock, err))?;
        self.pending_held = false;
        Ok(())
    }

    fn take_reserved(&mut self) -> Result<bool> {
        let taken = self
            .lock
            .try_lock(ByteRange::RESERVED, LockMode::Exclusive)
            .map_err(|err| self.tag(IoOp::Lock, err))?;
        if taken {
            self.stray_reserved = false;
        }
        Ok(taken)
    }

    /// Unlock `RESERVED`; on failure the byte is remembered as stray.
    fn drop_reserved(&mut self) -> Result<()> {
        match self.lock.unlock(ByteRange::RESERVED) {
            Ok(()) => {
                self.stray_reserved = false;
                Ok(())
            }
            Err(err) => {
                self.stray_reserved = true;
                Err(self.tag(IoOp::Unlock, err))
            }
        }
    }

    /// Free `PENDING` and `RESERVED` bytes held without the matching level.
    fn release_leftovers(&mut self) -> Result<()> {
        let mut first_err = None;
        if self.pending_held && self.level < LockLevel::Pending {
            if let Err(err) = self.drop_pending() {
                first_err.get_or_insert(err);
            }
        }
        if self.stray_reserved && self.level < LockLevel::Reserved {
            if let Err(err) = self.drop_reserved() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Reach the `Pending` waypoint: `RESERVED` (when coming straight from
    /// `Shared`) and `PENDING`, recording which bytes this call took.
    fn enter_pending(&mut self) -> Result<Waypoint> {
        let mut waypoint = Waypoint::default();
        if self.level < LockLevel::Reserved {
            if !self.take_reserved()? {
                return Ok(waypoint);
            }
            waypoint.took_reserved = true;
        }
        if !self.pending_held {
            match self.take_pending() {
                Ok(true) => waypoint.took_pending = true,
                Ok(false) => {
                    self.leave_waypoint(waypoint);
                    return Ok(Waypoint::default());
                }
                Err(err) => {
                    self.leave_waypoint(waypoint);
                    return Err(err);
                }
            }
        }
        waypoint.entered = true;
        Ok(waypoint)
    }

    /// Undo the bytes a waypoint took. Failures are logged, not returned:
    /// the caller is already reporting the error that made it back out.
    fn leave_waypoint(&mut self, waypoint: Waypoint) {
        if waypoint.took_pending {
            if let Err(err) = self.drop_pending() {
                warn!(target: "fsqlite_vfs::lock", error = %err, "failed to release PENDING");
            }
        }
        if waypoint.took_reserved {
            if let Err(err) = self.drop_reserved() {
                warn!(target: "fsqlite_vfs::lock", error = %err, "failed to release RESERVED");
            }
        }
    }

    /// Drop every byte after a lost read lock and fall to `None`.
    ///
    /// `RESERVED` or `PENDING` bytes whose unlock fails stay tracked so a
    /// later release can free them.
    fn abandon(&mut self) {
        for range in [ByteRange::SHARED, ByteRange::RESERVED, ByteRange::PENDING] {
            let unlocked = self.lock.unlock(range);
            if range == ByteRange::RESERVED {
                self.stray_reserved = unlocked.is_err();
            } else if range == ByteRange::PENDING {
                self.pending_held = unlocked.is_err();
            }
            if let Err(err) = unlocked {
                let err = self.tag(IoOp::Unlock, err);
                warn!(
                    target: "fsqlite_vfs::lock",
                    offset = range.start,
                    len = range.len,
                    error = %err,
                    "unlock failed while abandoning locks"
                );
            }
        }
        // A single-byte token lies inside SHARED, so it is gone too.
        self.shared_token = None;
        self.level = LockLevel::None;
    }

    /// Attach `op` to a raw I/O error and remember its errno.
    fn tag(&mut self, op: IoOp, err: FrankenError) -> FrankenError {
        let err = err.with_io_op(op);
        if let Some(errno) = err.raw_os_error() {
            self.last_errno = Some(errno);
        }
        err
    }
}

impl<L: RangeLock> Drop for FileLockState<L> {
    fn drop(&mut self) {
        if self.level == LockLevel::None && !self.pending_held && !self.stray_reserved {
            return;
        }
        if let Err(err) = self.release_to(LockLevel::None) {
            warn!(
                target: "fsqlite_vfs::lock",
                error = %err,
                "failed to release locks on drop"
            );
        }
    }
}

/// Bytes taken on the way to `Pending` by one call.
#[derive(Debug, Clone, Copy, Default)]
struct Waypoint {
    entered: bool,
    took_reserved: bool,
    took_pending: bool,
}
