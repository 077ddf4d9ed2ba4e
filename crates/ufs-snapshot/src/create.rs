//! Snapshot creation.
//!
//! The slow part (indirect blocks, group copies) runs with the filesystem
//! live. Writes are then suspended just long enough to refresh the groups
//! that changed meanwhile, freeze the superblock, and hide files that are
//! unlinked but still open. Once the snapshot is installed and its hooks are
//! live, writes resume and the remaining accounting runs under the
//! coordination lock alone.

use crate::engine::{Registry, SnapshotEngine};
use crate::file::{SnapState, SnapshotFile, SnapshotInfo, encode_hints, is_settled, write_file_blocks};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};
use ufs_alloc::bitmap::isblock;
use ufs_block::WriteMode;
use ufs_error::{Result, UfsError};
use ufs_inode::{BlockPointers, InodeTable, SlotKind, Visit, clear_slot, ensure_path, set_slot, walk};
use ufs_ondisk::{CylinderGroup, DiskInode, live_error};
use ufs_types::{BLK_NOCOPY, BLK_SNAP, FSMAXSNAP, FragNumber, GroupNumber, InodeNumber, NDADDR, SF_SNAPSHOT, SnapSlot};

/// A snapshot under construction, before anyone else can see it.
struct Build {
    ino: InodeNumber,
    state: SnapState,
    /// Superblock and group copy targets, per group.
    targets: Vec<(FragNumber, FragNumber)>,
    /// Group maps as frozen into the snapshot; `None` when unreadable.
    frozen: Vec<Option<CylinderGroup>>,
    /// Every block taken so far, released if creation fails.
    allocated: Vec<FragNumber>,
}

/// Clears the in-progress marker however creation ends.
struct Creating<'a>(&'a SnapshotEngine);

impl Drop for Creating<'_> {
    fn drop(&mut self) {
        self.0.registry.lock().creating = false;
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

impl SnapshotEngine {
    /// Turn `ino`, an empty regular file, into a snapshot of the filesystem.
    ///
    /// `unlinked_open` lists inodes with no links that are still open; they
    /// are hidden from the snapshot. Must be called without holding
    /// [`SnapshotEngine::write_gate`].
    pub fn create(
        self: &Arc<Self>,
        ino: InodeNumber,
        unlinked_open: &dyn Fn() -> Vec<InodeNumber>,
    ) -> Result<SnapshotInfo> {
        {
            let mut reg = self.registry.lock();
            if reg.creating {
                return Err(UfsError::Busy);
            }
            if reg.snaps.len() >= FSMAXSNAP {
                return Err(UfsError::SnapshotLimit);
            }
            reg.creating = true;
        }
        let _creating = Creating(self);
        let raw_ino = u32::try_from(ino.0)
            .map_err(|_| UfsError::InvalidArgument(format!("inode {} out of range", ino.0)))?;

        let live_table = InodeTable::new(self.live.as_ref(), &self.geo);
        let mut inode = live_table.read(ino)?;
        if !inode.is_regular() || inode.is_snapshot() || inode.size != 0 || inode.blocks != 0 {
            return Err(UfsError::InvalidArgument(format!(
                "inode {} is not an empty regular file",
                ino.0
            )));
        }
        let now = now_secs();
        inode.flags |= SF_SNAPSHOT;
        inode.size = self.numblks() * u64::from(self.geo.bsize);
        inode.mtime = now;
        inode.ctime = now;

        let mut build = Build {
            ino,
            state: SnapState {
                inode,
                hints: Vec::new(),
                dirty: true,
            },
            targets: Vec::new(),
            frozen: Vec::new(),
            allocated: Vec::new(),
        };

        if let Err(err) = self.prepare(&mut build) {
            self.abort(&mut build);
            return Err(err);
        }

        let suspended = self.gate.write();
        debug!(ino = ino.0, "writes suspended");
        if let Err(err) = self.freeze(&mut build, unlinked_open) {
            drop(suspended);
            self.abort(&mut build);
            return Err(err);
        }

        let Build { state, frozen, .. } = build;
        let snap = Arc::new(SnapshotFile {
            ino,
            created: now,
            state: parking_lot::Mutex::new(state),
        });
        let reg = self.install(&snap, raw_ino);
        drop(suspended);
        debug!(ino = ino.0, "writes resumed");

        let info = match self.settle(&reg, &snap, &frozen) {
            Ok(info) => info,
            Err(err) => {
                warn!(ino = ino.0, error = %err, "snapshot installed with incomplete accounting");
                SnapshotInfo {
                    ino: ino.0,
                    created: now,
                    index: reg.snaps.len() - 1,
                    owned_blocks: 0,
                    frags: snap.state.lock().inode.blocks,
                }
            }
        };
        drop(reg);

        self.flush()?;
        self.alloc.flush()?;
        info!(
            ino = ino.0,
            index = info.index,
            owned_blocks = info.owned_blocks,
            frags = info.frags,
            "snapshot created"
        );
        Ok(info)
    }

    // ── Before suspension ───────────────────────────────────────────────────

    /// Allocate the indirect tree and the metadata copy targets, and take a
    /// first copy of every group.
    fn prepare(&self, b: &mut Build) -> Result<()> {
        let io = self.raw_indirect();
        let geo = self.geo;
        let frag = u64::from(geo.frag);
        let ino = b.ino;
        let allocated = &mut b.allocated;
        let mut take = || {
            let addr = self.alloc_block(ino)?;
            allocated.push(addr);
            Ok(addr)
        };

        let mut ptrs = BlockPointers::from_inode(&b.state.inode);
        let mut lbn = NDADDR as u64;
        while lbn < self.numblks() {
            let made = ensure_path(&io, &mut ptrs, lbn, &mut take)?;
            b.state.inode.blocks += made.len() as u64 * frag;
            lbn += geo.nindir();
        }

        for cg in (0..geo.ncg).map(GroupNumber) {
            let sb_copy = take()?;
            let cg_copy = take()?;
            set_slot(&io, &mut ptrs, geo.fragstoblks(geo.cgsblock(cg)), sb_copy.0)?;
            set_slot(&io, &mut ptrs, geo.fragstoblks(geo.cgtod(cg)), cg_copy.0)?;
            b.state.inode.blocks += 2 * frag;
            b.targets.push((sb_copy, cg_copy));
        }
        ptrs.store(&mut b.state.inode);

        for (cg, &(_, cg_copy)) in b.targets.iter().enumerate() {
            let cg = GroupNumber(u32::try_from(cg).map_err(|_| UfsError::invariant(0, "group index overflow"))?);
            b.frozen.push(self.freeze_group(cg, cg_copy)?);
        }

        // Older snapshots preserve this inode's table block on this write.
        InodeTable::new(self.live.as_ref(), &geo).write(ino, &b.state.inode, WriteMode::Sync)?;
        b.state.dirty = false;
        trace!(ino = ino.0, frags = b.state.inode.blocks, "snapshot prepared");
        Ok(())
    }

    /// Copy group `cg` into `target`; raw bytes when the maps are damaged.
    fn freeze_group(&self, cg: GroupNumber, target: FragNumber) -> Result<Option<CylinderGroup>> {
        let addr = self.geo.cgtod(cg);
        if let Some(group) = self.alloc.copy_group(cg)? {
            let bytes = group.to_block(&self.geo).map_err(|e| live_error(addr.0, e))?;
            self.raw.write(target, &bytes, WriteMode::Sync)?;
            return Ok(Some(group));
        }
        warn!(cg = cg.0, "damaged cylinder group copied verbatim into snapshot");
        let bytes = self.raw.read(addr, self.geo.bsize_usize())?;
        self.raw.write(target, bytes.as_slice(), WriteMode::Sync)?;
        Ok(None)
    }

    // ── Suspended ───────────────────────────────────────────────────────────

    fn freeze(&self, b: &mut Build, unlinked_open: &dyn Fn() -> Vec<InodeNumber>) -> Result<()> {
        let geo = self.geo;
        for (index, &(sb_copy, cg_copy)) in b.targets.iter().enumerate() {
            let cg = GroupNumber(u32::try_from(index).map_err(|_| UfsError::invariant(0, "group index overflow"))?);
            if self.alloc.group_changed(cg) {
                b.frozen[index] = self.freeze_group(cg, cg_copy)?;
            }
            let sb_bytes = if index == 0 {
                self.alloc.superblock().to_block().map_err(|e| live_error(0, e))?
            } else {
                self.raw.read(geo.cgsblock(cg), geo.bsize_usize())?.into_inner()
            };
            self.raw.write(sb_copy, &sb_bytes, WriteMode::Sync)?;
        }

        let ino = b.ino;
        let allocated = &mut b.allocated;
        let mut take = || {
            let addr = self.alloc_block(ino)?;
            allocated.push(addr);
            Ok(addr)
        };
        let table = InodeTable::new(self.raw.as_ref(), &geo);
        let mut hidden = 0_u32;
        for victim in unlinked_open() {
            if victim == ino {
                continue;
            }
            let inode = table.read(victim)?;
            if !inode.is_allocated() || inode.nlink != 0 || inode.is_snapshot() {
                continue;
            }
            self.expunge(&mut b.state, victim, &mut take)?;
            let blocks = self.file_blocks(&inode)?;
            self.mark(&mut b.state, &blocks, BLK_NOCOPY)?;
            hidden += 1;
        }
        self.expunge(&mut b.state, ino, &mut take)?;
        if hidden > 0 {
            debug!(ino = ino.0, hidden, "unlinked open files hidden from snapshot");
        }
        Ok(())
    }

    /// Publish the snapshot. The returned guard keeps the registry locked
    /// until the new snapshot's accounting is complete.
    fn install(self: &Arc<Self>, snap: &Arc<SnapshotFile>, raw_ino: u32) -> MutexGuard<'_, Registry> {
        let mut reg = self.registry.lock();
        let first = reg.snaps.is_empty();
        reg.snaps.push(Arc::clone(snap));
        reg.generation += 1;
        self.alloc.update_superblock(|sb| {
            if let Some(slot) = sb.snapinum.iter_mut().find(|s| **s == 0) {
                *slot = raw_ino;
            }
        });
        if first {
            self.install_hooks();
        }
        reg
    }

    /// Undo a creation that failed before install.
    fn abort(&self, b: &mut Build) {
        if let Err(err) = self.release(&b.allocated) {
            warn!(ino = b.ino.0, error = %err, "blocks leaked by failed snapshot creation");
        }
        let mut inode = b.state.inode;
        inode.flags &= !SF_SNAPSHOT;
        inode.size = 0;
        inode.blocks = 0;
        inode.db = [0; NDADDR];
        inode.ib = [0; ufs_types::NIADDR];
        if let Err(err) = InodeTable::new(self.live.as_ref(), &self.geo).write(b.ino, &inode, WriteMode::Sync) {
            warn!(ino = b.ino.0, error = %err, "failed to reset aborted snapshot inode");
        }
        warn!(ino = b.ino.0, released = b.allocated.len(), "snapshot creation aborted");
    }

    // ── After install ───────────────────────────────────────────────────────

    /// Hide older snapshots, skip blocks that were free at the freeze, and
    /// write the hint list.
    fn settle(
        &self,
        reg: &Registry,
        snap: &Arc<SnapshotFile>,
        frozen: &[Option<CylinderGroup>],
    ) -> Result<SnapshotInfo> {
        let io = self.raw_indirect();
        let mut take = || self.alloc_block(snap.ino);

        for older in reg.snaps.iter().filter(|s| s.ino != snap.ino) {
            let held = older.state.lock().addresses(&io)?;
            let mut st = snap.state.lock();
            self.mark(&mut st, &held, BLK_SNAP)?;
            self.expunge(&mut st, older.ino, &mut take)?;
        }

        let mut st = snap.state.lock();
        let own = st.addresses(&io)?;
        self.mark(&mut st, &own, BLK_SNAP)?;
        let uninit = self.uninitialized_inode_blocks(frozen);
        self.mark(&mut st, &uninit, BLK_NOCOPY)?;
        self.skip_free(&mut st, frozen)?;

        let bytes = encode_hints(self.geo.order, self.geo.bsize_usize(), &st.hints)?;
        let mut hint_blocks = Vec::new();
        let mut take_hint = || {
            let addr = self.alloc_block(snap.ino)?;
            hint_blocks.push(addr);
            Ok(addr)
        };
        write_file_blocks(
            self.raw.as_ref(),
            &io,
            &self.geo,
            &mut st.inode,
            self.numblks(),
            &bytes,
            &mut take_hint,
        )?;
        st.inode.size = (self.numblks() + (bytes.len() / self.geo.bsize_usize()) as u64) * u64::from(self.geo.bsize);
        st.dirty = true;
        self.mark(&mut st, &hint_blocks, BLK_SNAP)?;

        Ok(SnapshotInfo {
            ino: snap.ino.0,
            created: snap.created,
            index: reg.snaps.len() - 1,
            owned_blocks: st.owned_blocks(&io, self.numblks())?,
            frags: st.inode.blocks,
        })
    }

    /// Mark blocks free at the freeze as never needing a copy, and record
    /// the hint list of blocks the snapshot will never copy.
    fn skip_free(&self, st: &mut SnapState, frozen: &[Option<CylinderGroup>]) -> Result<()> {
        let io = self.raw_indirect();
        let numblks = self.numblks();
        let mut ptrs = BlockPointers::from_inode(&st.inode);
        let mut hints = Vec::new();
        let mut skipped = 0_u64;
        walk(&io, &mut ptrs, 0, &mut |slot| {
            let SlotKind::Data { lbn } = slot.kind else {
                return Ok(Visit::Keep);
            };
            if lbn >= numblks {
                return Ok(Visit::Keep);
            }
            if slot.value == 0 && self.was_free(frozen, lbn) {
                skipped += 1;
                return Ok(Visit::Replace(BLK_NOCOPY));
            }
            if is_settled(slot.value) {
                hints.push(lbn);
            }
            Ok(Visit::Keep)
        })?;
        if ptrs != BlockPointers::from_inode(&st.inode) {
            ptrs.store(&mut st.inode);
            st.dirty = true;
        }
        hints.sort_unstable();
        trace!(skipped, hints = hints.len(), "free blocks skipped");
        st.hints = hints;
        Ok(())
    }

    /// Inode-table blocks past each group's initialized prefix. The allocator
    /// fills them in lazily on the base device, so the snapshot must read
    /// them as empty inodes instead of sharing the live block.
    fn uninitialized_inode_blocks(&self, frozen: &[Option<CylinderGroup>]) -> Vec<FragNumber> {
        let inopb = self.geo.inopb();
        let mut out = Vec::new();
        for (cg, group) in (0_u32..).zip(frozen) {
            let Some(group) = group else { continue };
            let mut index = group.initediblk.next_multiple_of(inopb);
            while index < self.geo.ipg {
                out.push(self.geo.ino_to_fsba(self.geo.make_ino(GroupNumber(cg), index)));
                index += inopb;
            }
        }
        trace!(blocks = out.len(), "uninitialized inode blocks skipped");
        out
    }

    fn was_free(&self, frozen: &[Option<CylinderGroup>], lbn: u64) -> bool {
        let addr = self.geo.blkstofrags(lbn);
        let cg = self.geo.dtog(addr);
        let Some(Some(group)) = frozen.get(cg.0 as usize) else {
            return false;
        };
        isblock(&group.blksfree, self.geo.frag, self.geo.dtogd(addr) / self.geo.frag)
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    /// Make `victim` read as unallocated in the snapshot by zeroing it in
    /// the snapshot's copy of its inode table block.
    fn expunge(
        &self,
        st: &mut SnapState,
        victim: InodeNumber,
        take: &mut dyn FnMut() -> Result<FragNumber>,
    ) -> Result<()> {
        let io = self.raw_indirect();
        let block = self.geo.ino_to_fsba(victim);
        let lbn = self.geo.fragstoblks(block);
        let bsize = self.geo.bsize_usize();
        match SnapSlot::from_raw(st.slot(&io, lbn)?) {
            SnapSlot::Owned(copy) => {
                let mut buf = self.raw.read(copy, bsize)?.into_inner();
                clear_slot(&self.geo, &mut buf, victim)?;
                self.raw.write(copy, &buf, WriteMode::Sync)?;
            }
            SnapSlot::Unclaimed => {
                let mut buf = self.raw.read(block, bsize)?.into_inner();
                clear_slot(&self.geo, &mut buf, victim)?;
                let copy = take()?;
                self.raw.write(copy, &buf, WriteMode::Sync)?;
                st.own(&io, &self.geo, lbn, copy)?;
            }
            SnapSlot::NoCopy | SnapSlot::SnapOwned => {
                warn!(ino = victim.0, lbn, "inode table block not held by snapshot");
            }
        }
        trace!(ino = victim.0, lbn, "inode expunged from snapshot");
        Ok(())
    }

    /// Set every still-unclaimed block among `addrs` to `value`.
    fn mark(&self, st: &mut SnapState, addrs: &[FragNumber], value: u64) -> Result<()> {
        let io = self.raw_indirect();
        for &addr in addrs {
            let lbn = self.geo.fragstoblks(addr);
            if lbn < self.numblks() && st.slot(&io, lbn)? == 0 {
                st.set(&io, lbn, value)?;
            }
        }
        Ok(())
    }

    /// Full blocks held by a file, indirect blocks included.
    ///
    /// A fragment-sized last block is left out: the rest of that block may
    /// belong to other files, so it keeps the ordinary copy-on-write path.
    fn file_blocks(&self, inode: &DiskInode) -> Result<Vec<FragNumber>> {
        let io = self.raw_indirect();
        let mut ptrs = BlockPointers::from_inode(inode);
        let mut out = Vec::new();
        walk(&io, &mut ptrs, 0, &mut |slot| {
            if SnapSlot::is_real_address(slot.value) {
                let whole = match slot.kind {
                    SlotKind::Data { lbn } => self.geo.blksize(inode.size, lbn) == self.geo.bsize,
                    SlotKind::Indirect { .. } => true,
                };
                if whole {
                    out.push(FragNumber(slot.value));
                }
            }
            Ok(Visit::Keep)
        })?;
        Ok(out)
    }
}
