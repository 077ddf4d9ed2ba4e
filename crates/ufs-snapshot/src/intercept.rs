//! Copy-on-write and free interception.
//!
//! Both hooks resolve one filesystem block at a time under that block's
//! serialization lock. The decision of which snapshots need the block is
//! made against the registry, the copies are made with it released, and
//! the result is committed only if no snapshot came or went meanwhile.

use crate::engine::{Counters, SnapshotEngine};
use crate::file::SnapshotFile;
use crate::retry::with_generation_retry;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};
use ufs_alloc::FreeIntercept;
use ufs_block::{WriteIntercept, WriteMode};
use ufs_error::Result;
use ufs_types::{BLK_NOCOPY, BLK_SNAP, FragNumber, InodeNumber};

pub(crate) struct CowHook {
    pub engine: Weak<SnapshotEngine>,
}

impl WriteIntercept for CowHook {
    fn before_write(&self, addr: FragNumber, len: usize) -> Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        engine.copy_on_write(addr, len)
    }
}

pub(crate) struct FreeHook {
    pub engine: Weak<SnapshotEngine>,
}

impl FreeIntercept for FreeHook {
    fn claim_freed(&self, addr: FragNumber, size: u32, ino: InodeNumber) -> Result<bool> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(false);
        };
        engine.claim_freed(addr, size, ino)
    }
}

/// What a free means for each snapshot.
#[derive(Default)]
struct FreePlan {
    /// Snapshot-owned in these; the free makes it irrelevant to them.
    settle: Vec<Arc<SnapshotFile>>,
    /// Takes the whole block instead of it being freed.
    adopter: Option<Arc<SnapshotFile>>,
    /// Still need the contents; each gets a copy.
    copy_for: Vec<Arc<SnapshotFile>>,
}

impl SnapshotEngine {
    /// Preserve every block a write of `len` bytes at `addr` will touch.
    pub(crate) fn copy_on_write(&self, addr: FragNumber, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let frags = (len as u64).div_ceil(u64::from(self.geo.fsize));
        let first = self.geo.fragstoblks(addr);
        let last = self.geo.fragstoblks(FragNumber(addr.0 + frags - 1));
        for lbn in first..=last {
            self.copy_block(lbn)?;
        }
        Ok(())
    }

    /// Give each snapshot still sharing block `lbn` its own copy.
    pub(crate) fn copy_block(&self, lbn: u64) -> Result<()> {
        if lbn >= self.numblks() {
            return Ok(());
        }
        let _serial = self.cow_locks.lock(lbn);
        let io = self.raw_indirect();
        let copied = with_generation_retry(
            &self.registry,
            |reg| {
                let mut needy = Vec::new();
                for snap in &reg.snaps {
                    let st = snap.state.lock();
                    if !st.hinted(lbn) && st.slot(&io, lbn)? == 0 {
                        needy.push(Arc::clone(snap));
                    }
                }
                Ok(needy)
            },
            |needy| self.make_copies(lbn, needy),
            |_, needy, copies| {
                for (snap, copy) in needy.iter().zip(&copies) {
                    snap.state.lock().own(&io, &self.geo, lbn, *copy)?;
                    Counters::bump(&self.counters.copies);
                }
                Ok(copies.len())
            },
            |copies| self.release(&copies),
        )?;
        if copied > 0 {
            trace!(lbn, copied, "block preserved before write");
        }
        Ok(())
    }

    /// Read block `lbn` once and write it to a fresh block per snapshot.
    /// Copies are durable before this returns.
    fn make_copies(&self, lbn: u64, needy: &[Arc<SnapshotFile>]) -> Result<Vec<FragNumber>> {
        let Some(owner) = needy.first() else {
            return Ok(Vec::new());
        };
        let image = self.raw.read(self.geo.blkstofrags(lbn), self.geo.bsize_usize())?;
        Counters::bump(&self.counters.preimage_reads);
        let mut copies = Vec::with_capacity(needy.len());
        for _ in needy {
            let written = self
                .alloc_block(owner.ino)
                .and_then(|copy| self.raw.write(copy, image.as_slice(), WriteMode::Sync).map(|()| copy));
            match written {
                Ok(copy) => copies.push(copy),
                Err(err) => {
                    self.release(&copies)?;
                    return Err(err);
                }
            }
        }
        Ok(copies)
    }

    /// Decide the fate of `size` bytes at `addr` about to be freed by `ino`.
    ///
    /// A whole block still needed by a snapshot is handed to the first one
    /// that needs it and `true` is returned. Partial blocks are copied for
    /// every snapshot that needs them and freed normally.
    pub(crate) fn claim_freed(&self, addr: FragNumber, size: u32, ino: InodeNumber) -> Result<bool> {
        let lbn = self.geo.fragstoblks(addr);
        if lbn >= self.numblks() {
            return Ok(false);
        }
        let whole = size == self.geo.bsize;
        let _serial = self.cow_locks.lock(lbn);
        let io = self.raw_indirect();
        with_generation_retry(
            &self.registry,
            |reg| {
                let mut plan = FreePlan::default();
                for snap in &reg.snaps {
                    let slot = snap.state.lock().slot(&io, lbn)?;
                    match slot {
                        BLK_SNAP => plan.settle.push(Arc::clone(snap)),
                        0 if whole && plan.adopter.is_none() => plan.adopter = Some(Arc::clone(snap)),
                        0 => plan.copy_for.push(Arc::clone(snap)),
                        _ => {}
                    }
                }
                Ok(plan)
            },
            |plan| self.make_copies(lbn, &plan.copy_for),
            |_, plan, copies| {
                for snap in &plan.settle {
                    snap.state.lock().set(&io, lbn, BLK_NOCOPY)?;
                }
                for (snap, copy) in plan.copy_for.iter().zip(&copies) {
                    snap.state.lock().own(&io, &self.geo, lbn, *copy)?;
                    Counters::bump(&self.counters.copies);
                }
                let Some(adopter) = plan.adopter else {
                    return Ok(false);
                };
                adopter.state.lock().own(&io, &self.geo, lbn, addr)?;
                Counters::bump(&self.counters.adoptions);
                debug!(lbn, freed_by = ino.0, snapshot = adopter.ino.0, "freed block adopted");
                Ok(true)
            },
            |copies| self.release(&copies),
        )
    }
}
