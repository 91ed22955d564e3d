//! Slot locks of the shared-memory index.
//!
//! Two layers of exclusion cooperate. Inside the process, the node mutex
//! and the sibling bitmasks decide conflicts between connections. Across
//! processes, one advisory lock byte per slot is held on the `-shm` file.
//! The OS lock for a slot is taken by the first sibling that needs it and
//! released by the last one, so siblings sharing a slot cost one OS lock.

use std::sync::atomic::{Ordering, fence};

use fsqlite_error::{FrankenError, IoOp, Result};
use fsqlite_types::shm::slot_byte_range;
use fsqlite_types::{LockMode, SlotMask};
use tracing::{trace, warn};

use crate::shm_node::{NodeState, ShmHandle, Sibling};

/// Why [`NodeState::os_lock`] failed.
struct SlotLockFailure {
    error: FrankenError,
    /// Slots of `keep_shared` that no longer hold any OS lock.
    lost: SlotMask,
}

impl From<FrankenError> for SlotLockFailure {
    fn from(error: FrankenError) -> Self {
        Self {
            error,
            lost: SlotMask::EMPTY,
        }
    }
}

impl NodeState {
    fn sibling(&self, id: u32) -> Result<Sibling> {
        self.siblings
            .iter()
            .find(|sibling| sibling.id == id)
            .copied()
            .ok_or_else(|| FrankenError::misuse("shm handle is not attached"))
    }

    fn sibling_mut(&mut self, id: u32) -> Result<&mut Sibling> {
        self.siblings
            .iter_mut()
            .find(|sibling| sibling.id == id)
            .ok_or_else(|| FrankenError::misuse("shm handle is not attached"))
    }

    /// Union of the shared masks of every sibling except `id`.
    pub(crate) fn shared_of_others(&self, id: u32) -> SlotMask {
        self.siblings
            .iter()
            .filter(|sibling| sibling.id != id)
            .fold(SlotMask::EMPTY, |acc, sibling| acc | sibling.shared)
    }

    fn exclusive_of_others(&self, id: u32) -> SlotMask {
        self.siblings
            .iter()
            .filter(|sibling| sibling.id != id)
            .fold(SlotMask::EMPTY, |acc, sibling| acc | sibling.exclusive)
    }

    fn shared_of_all(&self) -> SlotMask {
        self.siblings
            .iter()
            .fold(SlotMask::EMPTY, |acc, sibling| acc | sibling.shared)
    }

    fn tag(&mut self, err: FrankenError) -> FrankenError {
        let err = err.with_io_op(IoOp::ShmLock);
        if let Some(errno) = err.raw_os_error() {
            self.last_errno = Some(errno);
        }
        err
    }

    /// Take the OS lock for every slot in `mask`, one call per contiguous
    /// run. On any failure the runs already taken are released again,
    /// except the slots of `keep_shared`, which go back to a shared lock.
    /// A run that cannot go back is released and reported as lost.
    fn os_lock(
        &mut self,
        mask: SlotMask,
        mode: LockMode,
        keep_shared: SlotMask,
    ) -> std::result::Result<(), SlotLockFailure> {
        let mut taken = SlotMask::EMPTY;
        let mut failure = None;
        for (first, len) in mask.runs() {
            match self
                .file
                .range_lock()
                .try_lock(slot_byte_range(first, len), mode)
            {
                Ok(true) => {
                    if let Some(run) = SlotMask::range(first, len) {
                        taken = taken | run;
                    }
                }
                Ok(false) => {
                    failure = Some(FrankenError::Busy);
                    break;
                }
                Err(err) => {
                    failure = Some(self.tag(err));
                    break;
                }
            }
        }
        let Some(failure) = failure else {
            return Ok(());
        };
        if let Err(err) = self.os_unlock(taken.difference(keep_shared)) {
            trace!(
                target: "fsqlite_vfs::shm",
                mask = %taken,
                error = %err,
                "rollback of partial slot lock failed"
            );
        }

        let restore = taken.intersection(keep_shared);
        let mut lost = SlotMask::EMPTY;
        let mut cause = None;
        for (first, len) in restore.runs() {
            let range = slot_byte_range(first, len);
            let restored = match self.file.range_lock().try_lock(range, LockMode::Shared) {
                Ok(restored) => restored,
                Err(err) => {
                    let err = self.tag(err);
                    cause.get_or_insert(err.to_string());
                    false
                }
            };
            let Some(run) = SlotMask::range(first, len).filter(|_| !restored) else {
                continue;
            };
            if let Err(err) = self.os_unlock(run) {
                warn!(
                    target: "fsqlite_vfs::shm",
                    first,
                    len,
                    error = %err,
                    "slot lock neither restored nor released"
                );
            }
            lost = lost | run;
        }
        if lost.is_empty() {
            return Err(failure.into());
        }
        let cause = cause.unwrap_or_else(|| "contended".to_owned());
        Err(SlotLockFailure {
            error: FrankenError::lock_lost(format!(
                "shared slot lock {lost} not restored after failed upgrade: {cause}"
            )),
            lost,
        })
    }

    /// Release the OS lock for every slot in `mask`. Every run is attempted;
    /// the first error is returned.
    pub(crate) fn os_unlock(&mut self, mask: SlotMask) -> Result<()> {
        let mut first_err = None;
        for (first, len) in mask.runs() {
            if let Err(err) = self.file.range_lock().unlock(slot_byte_range(first, len)) {
                let err = self.tag(err);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl ShmHandle {
    /// Lock every slot in `mask` in `mode`.
    ///
    /// Returns [`FrankenError::Busy`] if another connection (in this process
    /// or another) holds a conflicting lock on any of the slots, and
    /// [`FrankenError::Misuse`] if the request conflicts with what this
    /// handle already holds.
    pub fn lock(&self, mask: SlotMask, mode: LockMode) -> Result<()> {
        if mask.is_empty() {
            return Err(FrankenError::misuse("shm lock mask is empty"));
        }
        let node = self.live_node()?;
        let mut state = node.state.lock();
        let me = state.sibling(self.id)?;

        match mode {
            LockMode::Shared => {
                if mask.intersects(me.exclusive) {
                    return Err(FrankenError::misuse(format!(
                        "slots {mask} already held exclusive by this handle"
                    )));
                }
                let blocking = state.exclusive_of_others(self.id).intersection(mask);
                if !blocking.is_empty() {
                    trace!(
                        target: "fsqlite_vfs::shm",
                        id = self.id,
                        mask = %mask,
                        blocking = %blocking,
                        "shared slot lock blocked by sibling"
                    );
                    return Err(FrankenError::Busy);
                }
                let fresh = mask.difference(state.shared_of_all());
                if !fresh.is_empty() {
                    state
                        .os_lock(fresh, LockMode::Shared, SlotMask::EMPTY)
                        .map_err(|failure| failure.error)?;
                }
                let sibling = state.sibling_mut(self.id)?;
                sibling.shared = sibling.shared | mask;
            }
            LockMode::Exclusive => {
                if mask.intersects(me.exclusive) {
                    return Err(FrankenError::misuse(format!(
                        "slots {mask} already held exclusive by this handle ({})",
                        me.exclusive
                    )));
                }
                let blocking = (state.shared_of_others(self.id)
                    | state.exclusive_of_others(self.id))
                .intersection(mask);
                if !blocking.is_empty() {
                    trace!(
                        target: "fsqlite_vfs::shm",
                        id = self.id,
                        mask = %mask,
                        blocking = %blocking,
                        "exclusive slot lock blocked by sibling"
                    );
                    return Err(FrankenError::Busy);
                }
                // Slots this handle holds shared are upgraded in place.
                let upgrade = mask.intersection(me.shared);
                if let Err(failure) = state.os_lock(mask, LockMode::Exclusive, upgrade) {
                    let sibling = state.sibling_mut(self.id)?;
                    sibling.shared = sibling.shared.difference(failure.lost);
                    return Err(failure.error);
                }
                let sibling = state.sibling_mut(self.id)?;
                sibling.shared = sibling.shared.difference(mask);
                sibling.exclusive = sibling.exclusive | mask;
            }
        }
        trace!(target: "fsqlite_vfs::shm", id = self.id, mask = %mask, mode = %mode, "slot lock acquired");
        Ok(())
    }

    /// Unlock the slots of `mask` this handle holds in `mode`.
    ///
    /// Bits not held in `mode` are ignored. The OS lock of a slot is
    /// released only when no other sibling still holds it shared.
    pub fn unlock(&self, mask: SlotMask, mode: LockMode) -> Result<()> {
        let node = self.live_node()?;
        let mut state = node.state.lock();
        let me = state.sibling(self.id)?;
        let held = match mode {
            LockMode::Shared => me.shared,
            LockMode::Exclusive => me.exclusive,
        };
        let mask = mask.intersection(held);
        if mask.is_empty() {
            return Ok(());
        }

        let release = mask.difference(state.shared_of_others(self.id));
        if !release.is_empty() {
            state.os_unlock(release)?;
        }
        let sibling = state.sibling_mut(self.id)?;
        match mode {
            LockMode::Shared => sibling.shared = sibling.shared.difference(mask),
            LockMode::Exclusive => sibling.exclusive = sibling.exclusive.difference(mask),
        }
        trace!(target: "fsqlite_vfs::shm", id = self.id, mask = %mask, mode = %mode, "slot lock released");
        Ok(())
    }

    /// Order memory accesses to mapped regions without changing any lock.
    pub fn fence(&self) {
        fence(Ordering::SeqCst);
        self.registry.fence(&self.node);
    }
}
