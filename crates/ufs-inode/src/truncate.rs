//! Truncation and indirect-block reclamation.
//!
//! Pointers are cut first and the inode is persisted with them cut before any
//! block is freed, so a crash in between only leaks blocks. Discarded
//! subtrees are then released triple level first, each one leaves before
//! its indirect block, followed by direct blocks from the end, and finally
//! any fragments trimmed off a shortened last block.

use crate::pointers::{BlockPointers, IndirectIo, SlotKind, Visit, free_subtree, span, walk};
use tracing::{debug, trace};
use ufs_error::Result;
use ufs_ondisk::DiskInode;
use ufs_types::{FragNumber, NDADDR, SnapSlot};

/// What a truncation released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncateOutcome {
    /// Fragments returned, data and indirect blocks together.
    pub released_frags: u64,
    /// Fragments trimmed from a shortened last direct block.
    pub trimmed_frags: u64,
}

#[derive(Debug, Clone, Copy)]
enum Doomed {
    Subtree { addr: FragNumber, depth: u32 },
    Data { lbn: u64, addr: FragNumber, size: u32 },
}

/// Shrink `inode` to `length` bytes.
///
/// `persist` stores the inode (called once with the pointers cut, once with
/// the final block count). `free` releases `size` bytes at an address.
/// Growing a file only changes its size.
#[expect(clippy::cast_possible_truncation)]
pub fn truncate(
    io: &dyn IndirectIo,
    inode: &mut DiskInode,
    length: u64,
    persist: &mut dyn FnMut(&DiskInode) -> Result<()>,
    free: &mut dyn FnMut(FragNumber, u32) -> Result<()>,
) -> Result<TruncateOutcome> {
    let geo = *io.geometry();
    let old_size = inode.size;
    if length >= old_size {
        inode.size = length;
        persist(inode)?;
        return Ok(TruncateOutcome::default());
    }

    // First logical block that goes away entirely.
    let keep_blocks = geo.lblkno(length + u64::from(geo.bsize) - 1);
    let mut ptrs = BlockPointers::from_inode(inode);

    // A shortened last direct block keeps its address but loses fragments.
    let mut trim = None;
    if length > 0 && keep_blocks <= NDADDR as u64 {
        let last = keep_blocks - 1;
        let addr = ptrs.db[last as usize];
        let osize = geo.blksize(old_size, last);
        let nsize = geo.blksize(length, last);
        if SnapSlot::is_real_address(addr) && nsize < osize {
            let tail = FragNumber(addr + u64::from(nsize / geo.fsize));
            trim = Some((tail, osize - nsize));
        }
    }

    let mut doomed = Vec::new();
    walk(io, &mut ptrs, keep_blocks, &mut |slot| {
        match slot.kind {
            SlotKind::Data { lbn } => {
                if slot.value == 0 {
                    return Ok(Visit::Keep);
                }
                if SnapSlot::is_real_address(slot.value) {
                    doomed.push(Doomed::Data {
                        lbn,
                        addr: FragNumber(slot.value),
                        size: geo.blksize(old_size, lbn),
                    });
                }
                Ok(Visit::Replace(0))
            }
            SlotKind::Indirect { depth, first_lbn } => {
                if !SnapSlot::is_real_address(slot.value) {
                    return Ok(Visit::Prune);
                }
                if first_lbn >= keep_blocks {
                    doomed.push(Doomed::Subtree {
                        addr: FragNumber(slot.value),
                        depth,
                    });
                    return Ok(Visit::Replace(0));
                }
                // Partly kept: only worth descending if it reaches past the end.
                if first_lbn + span(&geo, depth) > keep_blocks {
                    Ok(Visit::Keep)
                } else {
                    Ok(Visit::Prune)
                }
            }
        }
    })?;

    ptrs.store(inode);
    inode.size = length;
    persist(inode)?;
    trace!(length, doomed = doomed.len(), "pointers cut");

    doomed.sort_by_key(|d| match *d {
        Doomed::Subtree { depth, .. } => (0, u64::from(u32::MAX - depth)),
        Doomed::Data { lbn, .. } => (1, u64::MAX - lbn),
    });

    let mut outcome = TruncateOutcome::default();
    for d in doomed {
        match d {
            Doomed::Subtree { addr, depth } => {
                outcome.released_frags += free_subtree(io, addr, depth, free)?;
            }
            Doomed::Data { addr, size, .. } => {
                free(addr, size)?;
                outcome.released_frags += u64::from(size / geo.fsize);
            }
        }
    }
    if let Some((tail, bytes)) = trim {
        free(tail, bytes)?;
        outcome.trimmed_frags = u64::from(bytes / geo.fsize);
    }

    let released = outcome.released_frags + outcome.trimmed_frags;
    inode.blocks = inode.blocks.saturating_sub(released);
    persist(inode)?;
    debug!(
        old_size,
        length,
        released_frags = outcome.released_frags,
        trimmed_frags = outcome.trimmed_frags,
        "truncated"
    );
    Ok(outcome)
}
