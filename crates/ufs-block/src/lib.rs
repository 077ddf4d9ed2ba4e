#![forbid(unsafe_code)]
//! Block I/O collaborator for the allocator and snapshot engine.
//!
//! Storage is addressed in fragments. A request reads or writes a whole
//! number of fragments (up to one block) starting at a fragment address.
//! Writes carry a [`WriteMode`] mirroring the three write-back flavors
//! callers choose between. Per-address [`BufferLocks`] give callers the
//! mutual exclusion a buffer cache would give for an in-flight buffer.
//!
//! [`InterceptDevice`] wraps a device and runs an optional
//! [`WriteIntercept`] hook before every write; the snapshot engine plugs its
//! copy-on-write path in there.

mod intercept;

pub use intercept::{InterceptDevice, WriteIntercept};

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use ufs_error::{Result, UfsError};
use ufs_types::FragNumber;

/// Owned I/O buffer.
///
/// Invariant: length is a whole number of fragments of the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// How urgently a write must reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Write and flush before returning.
    Sync,
    /// Start the write; do not wait for stable storage.
    #[default]
    Async,
    /// Leave the data for a later flush.
    Delayed,
}

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, dev_len: u64, what: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| UfsError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| UfsError::Format(format!("{what} range overflows u64")))?;
    if end > dev_len {
        return Err(UfsError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, read-write if permitted, else read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(UfsError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Memory-backed byte device, used for tests and the CLI demo.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Copy of the whole image.
    #[must_use]
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "read")?;
        let start =
            usize::try_from(offset).map_err(|_| UfsError::Format("offset overflow".into()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "write")?;
        let start =
            usize::try_from(offset).map_err(|_| UfsError::Format("offset overflow".into()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Buffer locks ────────────────────────────────────────────────────────────

/// Per-address exclusive locks, one per in-flight buffer.
///
/// Not reentrant: a thread holding the lock for an address must not ask for
/// it again.
#[derive(Debug, Default)]
pub struct BufferLocks {
    held: Mutex<HashSet<u64>>,
    released: Condvar,
}

impl BufferLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it until the guard drops.
    pub fn lock(&self, key: u64) -> BufferGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(&key) {
            self.released.wait(&mut held);
        }
        held.insert(key);
        drop(held);
        BufferGuard { locks: self, key }
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: u64) -> Option<BufferGuard<'_>> {
        let mut held = self.held.lock();
        if !held.insert(key) {
            return None;
        }
        drop(held);
        Some(BufferGuard { locks: self, key })
    }

    #[must_use]
    pub fn is_locked(&self, key: u64) -> bool {
        self.held.lock().contains(&key)
    }
}

/// RAII holder of one [`BufferLocks`] entry.
#[derive(Debug)]
pub struct BufferGuard<'a> {
    locks: &'a BufferLocks,
    key: u64,
}

impl BufferGuard<'_> {
    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        held.remove(&self.key);
        drop(held);
        self.locks.released.notify_all();
    }
}

// ── Fragment-addressed devices ──────────────────────────────────────────────

/// Counters kept by a device; read with [`BlockDevice::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub delayed_writes: u64,
}

#[derive(Debug, Default)]
struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    syncs: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    delayed_writes: AtomicU64,
}

impl IoCounters {
    fn load(&self) -> IoStats {
        IoStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            delayed_writes: self.delayed_writes.load(Ordering::Relaxed),
        }
    }
}

/// Fragment-addressed I/O interface.
///
/// Every request length is a positive multiple of [`BlockDevice::frag_size`].
pub trait BlockDevice: Send + Sync {
    /// Read `len` bytes starting at fragment `addr`.
    fn read(&self, addr: FragNumber, len: usize) -> Result<BlockBuf>;

    /// Write `data` starting at fragment `addr`.
    fn write(&self, addr: FragNumber, data: &[u8], mode: WriteMode) -> Result<()>;

    /// Fragment size in bytes.
    fn frag_size(&self) -> u32;

    /// Total number of fragments.
    fn frag_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Per-address buffer locks shared by every user of this device.
    fn buffer_locks(&self) -> &BufferLocks;

    /// I/O counters since the device was opened.
    fn stats(&self) -> IoStats;
}

/// Adapts a [`ByteDevice`] into a fragment-addressed [`BlockDevice`].
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    frag_size: u32,
    frag_count: u64,
    locks: BufferLocks,
    counters: IoCounters,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, frag_size: u32) -> Result<Self> {
        if frag_size < 512 || !frag_size.is_power_of_two() {
            return Err(UfsError::Format(format!(
                "invalid frag_size={frag_size} (must be a power of two >= 512)"
            )));
        }

        let len = inner.len_bytes();
        let frag_size_u64 = u64::from(frag_size);
        let remainder = len % frag_size_u64;
        if remainder != 0 {
            return Err(UfsError::Format(format!(
                "image length is not fragment-aligned: len_bytes={len} frag_size={frag_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            frag_size,
            frag_count: len / frag_size_u64,
            locks: BufferLocks::new(),
            counters: IoCounters::default(),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn byte_range(&self, addr: FragNumber, len: usize) -> Result<u64> {
        let frag = usize::try_from(self.frag_size)
            .map_err(|_| UfsError::Format("frag_size does not fit usize".to_owned()))?;
        if len == 0 || len % frag != 0 {
            return Err(UfsError::InvalidArgument(format!(
                "I/O length {len} is not a positive multiple of frag_size {frag}"
            )));
        }
        let frags = u64::try_from(len / frag)
            .map_err(|_| UfsError::Format("I/O length overflows u64".to_owned()))?;
        let end = addr
            .0
            .checked_add(frags)
            .ok_or_else(|| UfsError::Format("fragment range overflow".to_owned()))?;
        if end > self.frag_count {
            return Err(UfsError::Format(format!(
                "fragment out of range: addr={} frags={frags} frag_count={}",
                addr.0, self.frag_count
            )));
        }
        addr.0
            .checked_mul(u64::from(self.frag_size))
            .ok_or_else(|| UfsError::Format("fragment offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read(&self, addr: FragNumber, len: usize) -> Result<BlockBuf> {
        let offset = self.byte_range(addr, len)?;
        let mut buf = vec![0_u8; len];
        self.inner.read_exact_at(offset, &mut buf)?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_read
            .fetch_add(len as u64, Ordering::Relaxed);
        trace!(frag = addr.0, len, "device read");
        Ok(BlockBuf::new(buf))
    }

    fn write(&self, addr: FragNumber, data: &[u8], mode: WriteMode) -> Result<()> {
        let offset = self.byte_range(addr, data.len())?;
        self.inner.write_all_at(offset, data)?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        match mode {
            WriteMode::Sync => self.sync()?,
            WriteMode::Delayed => {
                self.counters.delayed_writes.fetch_add(1, Ordering::Relaxed);
            }
            WriteMode::Async => {}
        }
        trace!(frag = addr.0, len = data.len(), ?mode, "device write");
        Ok(())
    }

    fn frag_size(&self) -> u32 {
        self.frag_size
    }

    fn frag_count(&self) -> u64 {
        self.frag_count
    }

    fn sync(&self) -> Result<()> {
        self.counters.syncs.fetch_add(1, Ordering::Relaxed);
        self.inner.sync()
    }

    fn buffer_locks(&self) -> &BufferLocks {
        &self.locks
    }

    fn stats(&self) -> IoStats {
        self.counters.load()
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read(&self, addr: FragNumber, len: usize) -> Result<BlockBuf> {
        (**self).read(addr, len)
    }

    fn write(&self, addr: FragNumber, data: &[u8], mode: WriteMode) -> Result<()> {
        (**self).write(addr, data, mode)
    }

    fn frag_size(&self) -> u32 {
        (**self).frag_size()
    }

    fn frag_count(&self) -> u64 {
        (**self).frag_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn buffer_locks(&self) -> &BufferLocks {
        (**self).buffer_locks()
    }

    fn stats(&self) -> IoStats {
        (**self).stats()
    }
}

/// Build an in-memory fragment device of `frag_count` fragments.
pub fn memory_device(frag_size: u32, frag_count: u64) -> Result<ByteBlockDevice<MemoryByteDevice>> {
    let len = frag_count
        .checked_mul(u64::from(frag_size))
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| UfsError::InvalidGeometry("memory image too large".to_owned()))?;
    ByteBlockDevice::new(MemoryByteDevice::new(len), frag_size)
}
