//! Bounds-checked handle to one mapped shared-memory region.
//!
//! A region is a fixed-size chunk of the `-shm` file. Backends build it from
//! their own storage: heap buffers for [`MemoryShmBackend`], `memmap2`
//! mappings for [`UnixShmBackend`]. Clones share the same bytes.
//!
//! [`MemoryShmBackend`]: crate::MemoryShmBackend
//! [`UnixShmBackend`]: crate::UnixShmBackend

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use fsqlite_error::{FrankenError, Result};
use parking_lot::{Mutex, MutexGuard};

#[derive(Debug)]
enum Backing {
    Heap(Vec<u8>),
    #[cfg(unix)]
    Mapped(memmap2::MmapMut),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Heap(buf) => buf,
            #[cfg(unix)]
            Self::Mapped(map) => map,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(buf) => buf,
            #[cfg(unix)]
            Self::Mapped(map) => map,
        }
    }
}

/// A handle to a mapped shared-memory region.
#[derive(Debug, Clone)]
pub struct ShmRegion {
    len: usize,
    data: Arc<Mutex<Backing>>,
}

impl ShmRegion {
    /// A zeroed heap-backed region.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            len: size,
            data: Arc::new(Mutex::new(Backing::Heap(vec![0; size]))),
        }
    }

    /// A region over a writable file mapping.
    #[cfg(unix)]
    #[must_use]
    pub fn from_mmap(map: memmap2::MmapMut) -> Self {
        Self {
            len: map.len(),
            data: Arc::new(Mutex::new(Backing::Mapped(map))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this region is backed by a file mapping.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        match &*self.data.lock() {
            Backing::Heap(_) => false,
            #[cfg(unix)]
            Backing::Mapped(_) => true,
        }
    }

    /// Borrow the region as a byte slice until the guard drops.
    #[must_use]
    pub fn lock(&self) -> ShmRegionGuard<'_> {
        ShmRegionGuard {
            guard: self.data.lock(),
        }
    }

    /// Flush a file-backed region to its file. No-op for heap regions.
    pub fn flush(&self) -> Result<()> {
        match &*self.data.lock() {
            Backing::Heap(_) => Ok(()),
            #[cfg(unix)]
            Backing::Mapped(map) => map.flush().map_err(FrankenError::Io),
        }
    }

    fn check(&self, offset: usize, width: usize) -> Result<()> {
        match offset.checked_add(width) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(FrankenError::OutOfRange {
                what: "shm offset".to_owned(),
                value: format!("{offset}+{width} in {} bytes", self.len),
            }),
        }
    }

    fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        self.check(offset, N)?;
        let mut out = [0_u8; N];
        out.copy_from_slice(&self.lock()[offset..offset + N]);
        Ok(out)
    }

    fn write_array<const N: usize>(&self, offset: usize, bytes: [u8; N]) -> Result<()> {
        self.check(offset, N)?;
        self.lock()[offset..offset + N].copy_from_slice(&bytes);
        Ok(())
    }

    /// Read a little-endian `u32` at `offset`.
    pub fn read_u32_le(&self, offset: usize) -> Result<u32> {
        self.read_array(offset).map(u32::from_le_bytes)
    }

    /// Write a little-endian `u32` at `offset`.
    pub fn write_u32_le(&self, offset: usize, val: u32) -> Result<()> {
        self.write_array(offset, val.to_le_bytes())
    }

    /// Read a little-endian `u64` at `offset`.
    pub fn read_u64_le(&self, offset: usize) -> Result<u64> {
        self.read_array(offset).map(u64::from_le_bytes)
    }

    /// Write a little-endian `u64` at `offset`.
    pub fn write_u64_le(&self, offset: usize, val: u64) -> Result<()> {
        self.write_array(offset, val.to_le_bytes())
    }
}

/// Locked region access guard.
pub struct ShmRegionGuard<'a> {
    guard: MutexGuard<'a, Backing>,
}

impl Deref for ShmRegionGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.bytes()
    }
}

impl DerefMut for ShmRegionGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.bytes_mut()
    }
}
