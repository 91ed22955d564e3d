//! Process-wide registry of shared-memory index nodes.
//!
//! Every connection in a process that opens the same `-shm` file shares one
//! node: one backing file, one set of OS slot locks and one list of
//! mapped regions. Each connection gets its own [`ShmHandle`] (a "sibling")
//! whose slot bitmasks live on the node.
//!
//! Lock order is always registry mutex, then node mutex. The registry owns
//! the nodes; handles keep only a `Weak` reference to theirs.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use fsqlite_error::{FrankenError, IoOp, Result};
use fsqlite_types::shm::DMS_RANGE;
use fsqlite_types::{LockMode, SlotMask};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::shm::ShmRegion;
use crate::traits::{ShmBackend, ShmFile};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Canonical identity of a shared-memory index file.
///
/// Two spellings of one file map to the same identity as long as its parent
/// directory exists: the path is made absolute and the parent is
/// canonicalised.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmIdentity {
    path: PathBuf,
}

impl ShmIdentity {
    /// Identity of the shared-memory file at `path`.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
        };
        let canonical = match (absolute.parent(), absolute.file_name()) {
            (Some(parent), Some(name)) => parent
                .canonicalize()
                .map_or_else(|_| absolute.clone(), |parent| parent.join(name)),
            _ => absolute,
        };
        Self { path: canonical }
    }

    /// Identity of the `-shm` file that belongs to database `db`.
    #[must_use]
    pub fn for_database(db: impl AsRef<Path>) -> Self {
        let mut shm: OsString = db.as_ref().as_os_str().to_owned();
        shm.push("-shm");
        Self::from_path(PathBuf::from(shm))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ShmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// What the deadman switch found when the node was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadmanOutcome {
    /// No other process had the file open; its contents were discarded.
    Reinitialized,
    /// Another process holds the file; its contents were kept.
    Attached,
}

/// One connection's slot bookkeeping on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sibling {
    pub(crate) id: u32,
    pub(crate) shared: SlotMask,
    pub(crate) exclusive: SlotMask,
}

impl Sibling {
    const fn new(id: u32) -> Self {
        Self {
            id,
            shared: SlotMask::EMPTY,
            exclusive: SlotMask::EMPTY,
        }
    }
}

/// Mutable node state, guarded by the node mutex.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) file: Box<dyn ShmFile>,
    pub(crate) siblings: Vec<Sibling>,
    next_id: u32,
    regions: Vec<ShmRegion>,
    region_size: Option<usize>,
    pub(crate) last_errno: Option<i32>,
}

/// Shared state of every connection in this process attached to one
/// shared-memory file.
#[derive(Debug)]
pub(crate) struct ShmNode {
    outcome: DeadmanOutcome,
    pub(crate) state: Mutex<NodeState>,
}

impl ShmNode {
    /// Open the backing file and run the deadman switch.
    fn create(backend: &dyn ShmBackend, identity: &ShmIdentity) -> Result<Self> {
        let file = backend.open(identity)?;
        let outcome = run_deadman_switch(file.as_ref())?;
        info!(
            target: "fsqlite_vfs::shm",
            identity = %identity,
            outcome = ?outcome,
            "shm node created"
        );
        Ok(Self {
            outcome,
            state: Mutex::new(NodeState {
                file,
                siblings: Vec::new(),
                next_id: 0,
                regions: Vec::new(),
                region_size: None,
                last_errno: None,
            }),
        })
    }
}

/// Probe the deadman byte exclusively; reset the file if nobody else has
/// it open. Then hold the byte shared for the life of the node.
fn run_deadman_switch(file: &dyn ShmFile) -> Result<DeadmanOutcome> {
    let lock = file.range_lock();
    let shm_open = |err: FrankenError| err.with_io_op(IoOp::ShmOpen);

    let outcome = if lock.try_lock(DMS_RANGE, LockMode::Exclusive).map_err(shm_open)? {
        let truncated = file.truncate(0);
        let unlocked = lock.unlock(DMS_RANGE).map_err(shm_open);
        truncated?;
        unlocked?;
        DeadmanOutcome::Reinitialized
    } else {
        DeadmanOutcome::Attached
    };

    if lock.try_lock(DMS_RANGE, LockMode::Shared).map_err(shm_open)? {
        Ok(outcome)
    } else {
        // Another process is between its probe and its shared lock.
        Err(FrankenError::Busy)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Reference-counted table from [`ShmIdentity`] to shared-memory node.
///
/// A node exists exactly while at least one handle is attached to it.
#[derive(Debug)]
pub struct ShmRegistry {
    backend: Box<dyn ShmBackend>,
    nodes: Mutex<HashMap<ShmIdentity, Arc<ShmNode>>>,
}

impl ShmRegistry {
    /// A registry over `backend`.
    ///
    /// Production code uses [`global`](Self::global); separate registries
    /// over one backend stand in for separate processes.
    pub fn new(backend: impl ShmBackend + 'static) -> Arc<Self> {
        Arc::new(Self {
            backend: Box::new(backend),
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// The process-wide registry over real `-shm` files.
    #[cfg(unix)]
    pub fn global() -> Arc<Self> {
        static GLOBAL: std::sync::OnceLock<Arc<ShmRegistry>> = std::sync::OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Self::new(crate::unix::UnixShmBackend)))
    }

    /// Attach a new handle to the node for `identity`, creating the node
    /// (and running the deadman switch) if this process has none yet.
    pub fn open(self: &Arc<Self>, identity: &ShmIdentity) -> Result<ShmHandle> {
        let mut nodes = self.nodes.lock();
        let node = if let Some(node) = nodes.get(identity) {
            Arc::clone(node)
        } else {
            let node = Arc::new(ShmNode::create(self.backend.as_ref(), identity)?);
            nodes.insert(identity.clone(), Arc::clone(&node));
            node
        };

        let id = {
            let mut state = node.state.lock();
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1);
            state.siblings.push(Sibling::new(id));
            id
        };
        drop(nodes);

        debug!(target: "fsqlite_vfs::shm", identity = %identity, id, "shm handle attached");
        Ok(ShmHandle {
            registry: Arc::clone(self),
            node: Arc::downgrade(&node),
            identity: identity.clone(),
            id,
            outcome: node.outcome,
            closed: false,
        })
    }

    /// Number of handles attached to `identity`; zero when no node exists.
    #[must_use]
    pub fn ref_count(&self, identity: &ShmIdentity) -> usize {
        self.nodes
            .lock()
            .get(identity)
            .map_or(0, |node| node.state.lock().siblings.len())
    }

    #[must_use]
    pub fn contains(&self, identity: &ShmIdentity) -> bool {
        self.nodes.lock().contains_key(identity)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub(crate) fn fence(&self, node: &Weak<ShmNode>) {
        let nodes = self.nodes.lock();
        if let Some(node) = node.upgrade() {
            drop(node.state.lock());
        }
        drop(nodes);
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// One connection's attachment to a shared-memory node.
///
/// Slot locking lives in [`crate::shm_lock`]. Dropping a handle closes it
/// without deleting the backing file.
#[derive(Debug)]
pub struct ShmHandle {
    pub(crate) registry: Arc<ShmRegistry>,
    pub(crate) node: Weak<ShmNode>,
    identity: ShmIdentity,
    pub(crate) id: u32,
    outcome: DeadmanOutcome,
    closed: bool,
}

impl ShmHandle {
    /// Sibling id, unique among handles of one node.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> &ShmIdentity {
        &self.identity
    }

    /// What the deadman switch found when this handle's node was created.
    #[must_use]
    pub fn deadman_outcome(&self) -> DeadmanOutcome {
        self.outcome
    }

    #[must_use]
    pub fn held_shared(&self) -> SlotMask {
        self.with_sibling(|sibling| sibling.shared)
    }

    #[must_use]
    pub fn held_exclusive(&self) -> SlotMask {
        self.with_sibling(|sibling| sibling.exclusive)
    }

    /// OS error number of the node's last failed slot-lock call.
    #[must_use]
    pub fn last_errno(&self) -> Option<i32> {
        let node = self.node.upgrade()?;
        let state = node.state.lock();
        state.last_errno
    }

    fn with_sibling(&self, f: impl FnOnce(&Sibling) -> SlotMask) -> SlotMask {
        let Some(node) = self.node.upgrade() else {
            return SlotMask::EMPTY;
        };
        let state = node.state.lock();
        state
            .siblings
            .iter()
            .find(|sibling| sibling.id == self.id)
            .map_or(SlotMask::EMPTY, f)
    }

    pub(crate) fn live_node(&self) -> Result<Arc<ShmNode>> {
        if self.closed {
            return Err(FrankenError::misuse("shm handle is closed"));
        }
        self.node
            .upgrade()
            .ok_or_else(|| FrankenError::misuse("shm node no longer exists"))
    }

    /// Region `index` of `size` bytes.
    ///
    /// When the file does not yet cover the region, it is grown if `extend`
    /// is set and `Ok(None)` is returned otherwise. All regions of a node
    /// share the size of the first one mapped.
    pub fn map_region(&self, index: u32, size: usize, extend: bool) -> Result<Option<ShmRegion>> {
        if size == 0 {
            return Err(FrankenError::misuse("shm region size must be > 0"));
        }
        let node = self.live_node()?;
        let mut state = node.state.lock();

        if let Some(existing) = state.region_size {
            if existing != size {
                return Err(FrankenError::misuse(format!(
                    "shm regions are {existing} bytes, requested {size}"
                )));
            }
        }
        let slot = index as usize;
        if let Some(region) = state.regions.get(slot) {
            return Ok(Some(region.clone()));
        }

        let needed = u64::from(index)
            .checked_add(1)
            .and_then(|regions| regions.checked_mul(size as u64))
            .ok_or_else(|| FrankenError::OutOfRange {
                what: "shm file length".to_owned(),
                value: format!("region={index}, size={size}"),
            })?;
        let current = state
            .file
            .size()
            .map_err(|err| err.with_io_op(IoOp::ShmSize))?;
        if current < needed {
            if !extend {
                return Ok(None);
            }
            state
                .file
                .truncate(needed)
                .map_err(|err| err.with_io_op(IoOp::ShmSize))?;
        }

        while state.regions.len() <= slot {
            let next = u32::try_from(state.regions.len())
                .map_err(|_| FrankenError::internal("shm region count overflow"))?;
            let region = state
                .file
                .map_region(next, size)
                .map_err(|err| err.with_io_op(IoOp::ShmMap))?;
            state.regions.push(region);
        }
        state.region_size = Some(size);
        debug!(
            target: "fsqlite_vfs::shm",
            identity = %self.identity,
            id = self.id,
            index,
            size,
            "shm region mapped"
        );
        Ok(state.regions.get(slot).cloned())
    }

    /// Detach from the node, deleting the backing file if this was the last
    /// handle and `delete` is set.
    pub fn close(mut self, delete: bool) -> Result<()> {
        self.detach(delete)
    }

    fn detach(&mut self, delete: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut nodes = self.registry.nodes.lock();
        let Some(node) = self.node.upgrade() else {
            return Ok(());
        };
        let mut state = node.state.lock();
        let Some(pos) = state.siblings.iter().position(|s| s.id == self.id) else {
            return Ok(());
        };
        let sibling = state.siblings.remove(pos);

        let others = state.shared_of_others(self.id);
        let held = sibling.shared.union(sibling.exclusive);
        let mut first_err = state.os_unlock(held.difference(others)).err();

        if state.siblings.is_empty() {
            if let Err(err) = state.file.range_lock().unlock(DMS_RANGE) {
                first_err.get_or_insert(err.with_io_op(IoOp::ShmLock));
            }
            state.regions.clear();
            state.region_size = None;
            if delete {
                if let Err(err) = state.file.delete() {
                    first_err.get_or_insert(err);
                }
            }
            drop(state);
            nodes.remove(&self.identity);
            debug!(
                target: "fsqlite_vfs::shm",
                identity = %self.identity,
                delete,
                "shm node purged"
            );
        } else {
            drop(state);
        }
        drop(nodes);
        debug!(target: "fsqlite_vfs::shm", identity = %self.identity, id = self.id, "shm handle detached");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for ShmHandle {
    fn drop(&mut self) {
        if let Err(err) = self.detach(false) {
            warn!(
                target: "fsqlite_vfs::shm",
                identity = %self.identity,
                id = self.id,
                error = %err,
                "failed to close shm handle on drop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryShmBackend;

    fn identity(name: &str) -> ShmIdentity {
        ShmIdentity::from_path(format!("/virtual/{name}"))
    }

    #[test]
    fn test_identity_for_database_appends_suffix() {
        let id = ShmIdentity::for_database("/virtual/main.db");
        assert_eq!(id.path(), Path::new("/virtual/main.db-shm"));
    }

    #[test]
    fn test_identity_canonicalises_parent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sub");
        std::fs::create_dir(&nested).unwrap();
        let direct = ShmIdentity::from_path(dir.path().join("x.db-shm"));
        let dotted = ShmIdentity::from_path(nested.join("..").join("x.db-shm"));
        assert_eq!(direct, dotted);
    }

    #[test]
    fn test_open_assigns_distinct_ids() {
        let registry = ShmRegistry::new(MemoryShmBackend::new());
        let id = identity("a.db-shm");
        let first = registry.open(&id).unwrap();
        let second = registry.open(&id).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.ref_count(&id), 2);
        assert_eq!(first.deadman_outcome(), DeadmanOutcome::Reinitialized);
        assert_eq!(second.deadman_outcome(), DeadmanOutcome::Reinitialized);
    }

    #[test]
    fn test_map_region_extend_rules() {
        let backend = MemoryShmBackend::new();
        let registry = ShmRegistry::new(backend.clone());
        let id = identity("map.db-shm");
        let handle = registry.open(&id).unwrap();

        assert!(handle.map_region(0, 1024, false).unwrap().is_none());
        let region = handle.map_region(1, 1024, true).unwrap().unwrap();
        assert_eq!(region.len(), 1024);
        assert_eq!(backend.file_len(&id), Some(2048));
        // Region 0 became available when the file grew.
        assert!(handle.map_region(0, 1024, false).unwrap().is_some());

        let err = handle.map_region(0, 512, true).unwrap_err();
        assert!(matches!(err, FrankenError::Misuse { .. }));
        assert!(handle.map_region(0, 0, true).is_err());
    }

    #[test]
    fn test_regions_are_shared_between_siblings() {
        let registry = ShmRegistry::new(MemoryShmBackend::new());
        let id = identity("share.db-shm");
        let a = registry.open(&id).unwrap();
        let b = registry.open(&id).unwrap();
        let ra = a.map_region(0, 256, true).unwrap().unwrap();
        ra.write_u64_le(8, 42).unwrap();
        let rb = b.map_region(0, 256, false).unwrap().unwrap();
        assert_eq!(rb.read_u64_le(8).unwrap(), 42);
    }

    #[test]
    fn test_close_with_delete_removes_file() {
        let backend = MemoryShmBackend::new();
        let registry = ShmRegistry::new(backend.clone());
        let id = identity("del.db-shm");
        let a = registry.open(&id).unwrap();
        let b = registry.open(&id).unwrap();

        a.close(true).unwrap();
        // Not the last sibling, so the file stays.
        assert!(backend.exists(&id));
        assert_eq!(registry.ref_count(&id), 1);

        b.close(true).unwrap();
        assert!(!backend.exists(&id));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_drop_detaches() {
        let registry = ShmRegistry::new(MemoryShmBackend::new());
        let id = identity("drop.db-shm");
        {
            let _a = registry.open(&id).unwrap();
            assert_eq!(registry.node_count(), 1);
        }
        assert_eq!(registry.node_count(), 0);
        assert_eq!(registry.ref_count(&id), 0);
    }

    #[test]
    fn test_closed_handle_cannot_map() {
        let registry = ShmRegistry::new(MemoryShmBackend::new());
        let id = identity("closed.db-shm");
        let mut a = registry.open(&id).unwrap();
        a.detach(false).unwrap();
        assert!(matches!(
            a.map_region(0, 64, true),
            Err(FrankenError::Misuse { .. })
        ));
        assert_eq!(a.held_shared(), SlotMask::EMPTY);
    }
}
