//! The per-mount snapshot registry and everything outside creation.

use crate::file::{SnapshotFile, SnapshotInfo, decode_hints, is_snapshot, read_file_blocks};
use crate::intercept::{CowHook, FreeHook};
use crate::retry::Generation;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use ufs_alloc::{AllocHint, Allocator};
use ufs_block::{BlockDevice, BufferLocks, InterceptDevice, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_inode::{DeviceIndirect, InodeTable, truncate};
use ufs_ondisk::{DiskInode, Geometry};
use ufs_types::{FragNumber, InodeNumber, SnapSlot};

/// The live device with its copy-on-write hook slot.
pub type LiveDevice = InterceptDevice<dyn BlockDevice>;

/// Copy-on-write activity since mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CowStats {
    /// Pre-write block images read from the live device.
    pub preimage_reads: u64,
    /// Blocks written into a snapshot as preserved copies.
    pub copies: u64,
    /// Freed blocks taken over by a snapshot without copying.
    pub adoptions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub preimage_reads: AtomicU64,
    pub copies: AtomicU64,
    pub adoptions: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot list plus the generation that versions it.
pub(crate) struct Registry {
    pub generation: u64,
    /// Creation order, oldest first.
    pub snaps: Vec<Arc<SnapshotFile>>,
    pub creating: bool,
}

impl Generation for Registry {
    fn generation(&self) -> u64 {
        self.generation
    }
}

/// Snapshots of one mounted filesystem.
///
/// Owns the coordination lock, the write-suspension gate, and the two
/// hooks that route live writes and frees through the snapshots.
pub struct SnapshotEngine {
    pub(crate) geo: Geometry,
    pub(crate) alloc: Arc<Allocator>,
    pub(crate) live: Arc<LiveDevice>,
    pub(crate) raw: Arc<dyn BlockDevice>,
    pub(crate) registry: Mutex<Registry>,
    /// Held shared by every filesystem mutation; creation takes it
    /// exclusively to suspend writes.
    pub(crate) gate: RwLock<()>,
    /// Serializes copy-on-write decisions per block.
    pub(crate) cow_locks: BufferLocks,
    pub(crate) counters: Counters,
}

impl std::fmt::Debug for SnapshotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEngine")
            .field("snapshots", &self.count())
            .finish_non_exhaustive()
    }
}

impl SnapshotEngine {
    /// `live` must wrap the device `alloc` writes to.
    pub fn new(alloc: Arc<Allocator>, live: Arc<LiveDevice>) -> Arc<Self> {
        let raw = Arc::clone(live.base());
        Arc::new(Self {
            geo: *alloc.geometry(),
            alloc,
            live,
            raw,
            registry: Mutex::new(Registry {
                generation: 0,
                snaps: Vec::new(),
                creating: false,
            }),
            gate: RwLock::new(()),
            cow_locks: BufferLocks::new(),
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Shared hold on the write gate; take it around every filesystem
    /// mutation so snapshot creation can suspend them.
    pub fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.registry.lock().snaps.len()
    }

    #[must_use]
    pub fn is_snapshot(&self, ino: InodeNumber) -> bool {
        self.find(ino).is_some()
    }

    #[must_use]
    pub fn stats(&self) -> CowStats {
        CowStats {
            preimage_reads: self.counters.preimage_reads.load(Ordering::Relaxed),
            copies: self.counters.copies.load(Ordering::Relaxed),
            adoptions: self.counters.adoptions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn numblks(&self) -> u64 {
        self.geo.numblks()
    }

    pub(crate) fn raw_indirect(&self) -> DeviceIndirect<'_> {
        DeviceIndirect::new(self.raw.as_ref(), &self.geo, WriteMode::Async)
    }

    pub(crate) fn find(&self, ino: InodeNumber) -> Option<Arc<SnapshotFile>> {
        self.registry.lock().snaps.iter().find(|s| s.ino == ino).cloned()
    }

    /// One block for snapshot-owned storage.
    pub(crate) fn alloc_block(&self, owner: InodeNumber) -> Result<FragNumber> {
        self.alloc.alloc(
            owner,
            self.geo.bsize,
            AllocHint {
                pref: None,
                privileged: true,
            },
        )
    }

    /// Return blocks that never became visible to any snapshot.
    pub(crate) fn release(&self, addrs: &[FragNumber]) -> Result<()> {
        for addr in addrs {
            self.alloc.free_bypass(*addr, self.geo.bsize)?;
        }
        Ok(())
    }

    pub(crate) fn install_hooks(self: &Arc<Self>) {
        self.live.set_hook(Arc::new(CowHook {
            engine: Arc::downgrade(self),
        }));
        self.alloc.set_free_hook(Arc::new(FreeHook {
            engine: Arc::downgrade(self),
        }));
    }

    fn remove_hooks(&self) {
        self.live.clear_hook();
        self.alloc.clear_free_hook();
        debug!("copy-on-write disengaged");
    }

    // ── Listing and reads ───────────────────────────────────────────────────

    /// Live snapshots, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let snaps = self.registry.lock().snaps.clone();
        let io = self.raw_indirect();
        snaps
            .iter()
            .enumerate()
            .map(|(index, snap)| {
                let st = snap.state.lock();
                Ok(SnapshotInfo {
                    ino: snap.ino.0,
                    created: snap.created,
                    index,
                    owned_blocks: st.owned_blocks(&io, self.numblks())?,
                    frags: st.inode.blocks,
                })
            })
            .collect()
    }

    /// Filesystem block `lbn` as it was when snapshot `ino` was taken.
    ///
    /// Blocks free at that time read as zeros.
    pub fn read_block(&self, ino: InodeNumber, lbn: u64) -> Result<Vec<u8>> {
        let snap = self.find(ino).ok_or(UfsError::NotSnapshot(ino.0))?;
        if lbn >= self.numblks() {
            return Err(UfsError::InvalidArgument(format!(
                "block {lbn} beyond the {} block filesystem",
                self.numblks()
            )));
        }
        let io = self.raw_indirect();
        // Excludes a copy-on-write of this block between lookup and read.
        let _serial = self.cow_locks.lock(lbn);
        let slot = snap.state.lock().slot(&io, lbn)?;
        let bsize = self.geo.bsize_usize();
        match SnapSlot::from_raw(slot) {
            SnapSlot::Owned(copy) => Ok(self.raw.read(copy, bsize)?.into_inner()),
            SnapSlot::Unclaimed => Ok(self.raw.read(self.geo.blkstofrags(lbn), bsize)?.into_inner()),
            SnapSlot::NoCopy | SnapSlot::SnapOwned => Ok(vec![0; bsize]),
        }
    }

    /// Write back snapshot inodes changed by copy-on-write.
    pub fn flush(&self) -> Result<()> {
        let snaps = self.registry.lock().snaps.clone();
        let table = InodeTable::new(self.raw.as_ref(), &self.geo);
        for snap in snaps {
            let pending = {
                let mut st = snap.state.lock();
                std::mem::take(&mut st.dirty).then_some(st.inode)
            };
            if let Some(inode) = pending {
                if let Err(err) = table.write(snap.ino, &inode, WriteMode::Delayed) {
                    snap.state.lock().dirty = true;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    // ── Mount ───────────────────────────────────────────────────────────────

    /// Rebuild the registry from the superblock's snapshot table.
    ///
    /// Returns how many snapshots were reloaded.
    pub fn load(self: &Arc<Self>) -> Result<usize> {
        let sb = self.alloc.superblock();
        let table = InodeTable::new(self.raw.as_ref(), &self.geo);
        let io = self.raw_indirect();
        let mut loaded = Vec::new();
        for raw_ino in sb.snapshots() {
            let ino = InodeNumber(u64::from(raw_ino));
            let inode = table.read(ino)?;
            if !is_snapshot(&inode) {
                warn!(ino = ino.0, "snapshot table names a non-snapshot inode; skipped");
                continue;
            }
            let hints = self.read_hints(&io, &inode)?;
            debug!(ino = ino.0, hints = hints.len(), "snapshot reloaded");
            loaded.push(Arc::new(SnapshotFile::new(ino, inode, hints)));
        }
        let count = loaded.len();
        let mut reg = self.registry.lock();
        reg.snaps = loaded;
        reg.generation += 1;
        drop(reg);
        if count > 0 {
            self.install_hooks();
            info!(snapshots = count, "snapshots active");
        }
        Ok(count)
    }

    fn read_hints(&self, io: &DeviceIndirect<'_>, inode: &DiskInode) -> Result<Vec<u64>> {
        let numblks = self.numblks();
        let bsize = self.geo.bsize_usize();
        if inode.size <= numblks * u64::from(self.geo.bsize) {
            return Ok(Vec::new());
        }
        let head = read_file_blocks(self.raw.as_ref(), io, &self.geo, inode, numblks, bsize)?;
        let count = self.geo.order.read_u64(&head, 0).map_err(|e| UfsError::corruption(0, e.to_string()))?;
        let words = usize::try_from(count)
            .map_err(|_| UfsError::corruption(0, format!("hint count {count} too large")))?
            + 1;
        let bytes = if words * 8 <= bsize {
            head
        } else {
            read_file_blocks(self.raw.as_ref(), io, &self.geo, inode, numblks, (words * 8).div_ceil(bsize) * bsize)?
        };
        decode_hints(self.geo.order, &bytes, self.geo.blkstofrags(numblks).0)
    }

    // ── Deletion ────────────────────────────────────────────────────────────

    /// Remove snapshot `ino` and free its inode.
    ///
    /// Blocks it held go back through the free path, where remaining
    /// snapshots may take them over.
    pub fn delete(&self, ino: InodeNumber) -> Result<()> {
        let _writes = self.gate.read();
        let snap = {
            let mut reg = self.registry.lock();
            if reg.creating && reg.snaps.last().is_some_and(|s| s.ino == ino) {
                return Err(UfsError::Busy);
            }
            let index = reg
                .snaps
                .iter()
                .position(|s| s.ino == ino)
                .ok_or(UfsError::NotSnapshot(ino.0))?;
            let snap = reg.snaps.remove(index);
            reg.generation += 1;
            let now_empty = reg.snaps.is_empty();
            self.alloc.update_superblock(|sb| {
                let kept: Vec<u32> = sb.snapshots().filter(|&s| u64::from(s) != ino.0).collect();
                sb.snapinum = [0; ufs_types::FSMAXSNAP];
                sb.snapinum[..kept.len()].copy_from_slice(&kept);
            });
            if now_empty {
                self.remove_hooks();
            }
            snap
        };

        let mut inode = snap.state.lock().inode;
        let table = InodeTable::new(self.raw.as_ref(), &self.geo);
        let io = self.raw_indirect();
        let outcome = truncate(
            &io,
            &mut inode,
            0,
            &mut |cut| table.write(ino, cut, WriteMode::Sync),
            &mut |addr, size| self.alloc.free(addr, size, ino),
        )?;
        InodeTable::new(self.live.as_ref(), &self.geo).write(ino, &DiskInode::default(), WriteMode::Sync)?;
        self.alloc.vfree(ino, false)?;
        self.flush()?;
        self.alloc.flush()?;
        info!(ino = ino.0, released = outcome.released_frags, "snapshot deleted");
        Ok(())
    }
}
