//! Logical-to-physical mapping for regular files, allocating on demand.
//!
//! Only the last block of a file shorter than [`NDADDR`] blocks may be a
//! fragment run. Growing such a block first tries to extend it in place and
//! otherwise moves it to a larger allocation, copying what it held.

use crate::pointers::{BlockPointers, DeviceIndirect, IndirectIo, ensure_path, leaf_of, lookup, set_slot};
use tracing::{debug, trace};
use ufs_alloc::{AllocHint, Allocator};
use ufs_block::{BlockDevice, WriteMode};
use ufs_error::Result;
use ufs_ondisk::{DiskInode, Geometry};
use ufs_types::{FragNumber, InodeNumber, NDADDR, SnapSlot};

/// What a file's blocks are read from and allocated through.
///
/// `dev` is the device ordinary file I/O goes to; when snapshots exist it
/// is the intercepting device so overwrites are copied first.
pub struct FileIo<'a> {
    pub alloc: &'a Allocator,
    pub dev: &'a dyn BlockDevice,
    /// May use the `minfree` reserve.
    pub privileged: bool,
}

impl<'a> FileIo<'a> {
    pub fn new(alloc: &'a Allocator, dev: &'a dyn BlockDevice) -> Self {
        Self {
            alloc,
            dev,
            privileged: false,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        self.alloc.geometry()
    }

    /// Indirect-block access for this file's pointer tree.
    #[must_use]
    pub fn indirect(&self) -> DeviceIndirect<'_> {
        DeviceIndirect::new(self.dev, self.alloc.geometry(), WriteMode::Async)
    }

    fn hint(&self, pref: Option<FragNumber>) -> AllocHint {
        AllocHint {
            pref,
            privileged: self.privileged,
        }
    }

    fn zero(&self, addr: FragNumber, bytes: u32) -> Result<()> {
        self.dev.write(addr, &vec![0_u8; bytes as usize], WriteMode::Async)
    }
}

/// Physical address of logical block `lbn`, or `None` for a hole.
///
/// Snapshot sentinels map to `None` as well.
pub fn bmap(io: &FileIo<'_>, inode: &DiskInode, lbn: u64) -> Result<Option<FragNumber>> {
    let raw = lookup(&io.indirect(), &BlockPointers::from_inode(inode), lbn)?;
    Ok(SnapSlot::is_real_address(raw).then_some(FragNumber(raw)))
}

/// Make sure logical block `lbn` of `ino` is backed by storage for the first
/// `end_in_block` bytes, and return its address.
///
/// Newly allocated space reads as zeros. `inode.blocks` is kept current; the
/// caller sets the size and persists the inode afterwards.
#[expect(clippy::cast_possible_truncation)]
pub fn balloc(
    io: &FileIo<'_>,
    ino: InodeNumber,
    inode: &mut DiskInode,
    lbn: u64,
    end_in_block: u32,
) -> Result<FragNumber> {
    let geo = *io.geometry();
    let bsize = u64::from(geo.bsize);
    let new_end = lbn * bsize + u64::from(end_in_block);

    // Writing past a fragment-sized last block: make it a full block first.
    if inode.size > 0 {
        let last = geo.lblkno(inode.size - 1);
        if last < NDADDR as u64 && last < lbn {
            let osize = geo.blksize(inode.size, last);
            if osize < geo.bsize && SnapSlot::is_real_address(inode.db[last as usize]) {
                realloc(io, ino, inode, last as usize, osize, geo.bsize)?;
                inode.size = (last + 1) * bsize;
            }
        }
    }

    if lbn < NDADDR as u64 {
        let i = lbn as usize;
        let nsize = geo.blksize(inode.size.max(new_end), lbn);
        let existing = inode.db[i];
        if SnapSlot::is_real_address(existing) {
            let osize = geo.blksize(inode.size, lbn);
            if osize >= nsize {
                return Ok(FragNumber(existing));
            }
            return realloc(io, ino, inode, i, osize, nsize);
        }
        let pref = io.alloc.blkpref(ino, lbn, i, &inode.db);
        let addr = io.alloc.alloc(ino, nsize, io.hint(pref))?;
        io.zero(addr, nsize)?;
        inode.db[i] = addr.0;
        inode.blocks += u64::from(nsize / geo.fsize);
        trace!(ino = ino.0, lbn, frag = addr.0, size = nsize, "direct block allocated");
        return Ok(addr);
    }

    let indirect = io.indirect();
    let mut ptrs = BlockPointers::from_inode(inode);
    let created = ensure_path(&indirect, &mut ptrs, lbn, &mut || {
        let pref = io.alloc.blkpref(ino, lbn, 0, &[]);
        io.alloc.alloc(ino, geo.bsize, io.hint(pref))
    })?;
    inode.blocks += created.len() as u64 * u64::from(geo.frag);
    ptrs.store(inode);

    let existing = lookup(&indirect, &ptrs, lbn)?;
    if SnapSlot::is_real_address(existing) {
        return Ok(FragNumber(existing));
    }
    let pref = match leaf_of(&indirect, &ptrs, lbn)? {
        Some((leaf, off)) => {
            let bap = indirect.read_indirect(leaf)?;
            io.alloc.blkpref(ino, lbn, off, bap.entries())
        }
        None => None,
    };
    let addr = io.alloc.alloc(ino, geo.bsize, io.hint(pref))?;
    io.zero(addr, geo.bsize)?;
    set_slot(&indirect, &mut ptrs, lbn, addr.0)?;
    ptrs.store(inode);
    inode.blocks += u64::from(geo.frag);
    trace!(ino = ino.0, lbn, frag = addr.0, indirects = created.len(), "indirect-mapped block allocated");
    Ok(addr)
}

/// Grow direct block `index` from `osize` to `nsize` bytes.
fn realloc(
    io: &FileIo<'_>,
    ino: InodeNumber,
    inode: &mut DiskInode,
    index: usize,
    osize: u32,
    nsize: u32,
) -> Result<FragNumber> {
    let geo = *io.geometry();
    let old = FragNumber(inode.db[index]);
    let grown = u64::from((nsize - osize) / geo.fsize);

    if io.alloc.extend_in_place(old, osize, nsize, io.privileged)? {
        io.zero(FragNumber(old.0 + u64::from(osize / geo.fsize)), nsize - osize)?;
        inode.blocks += grown;
        trace!(ino = ino.0, frag = old.0, osize, nsize, "fragment extended in place");
        return Ok(old);
    }

    let pref = io.alloc.blkpref(ino, index as u64, index, &inode.db);
    let new = io.alloc.alloc(ino, nsize, io.hint(pref))?;
    let mut data = io.dev.read(old, osize as usize)?.into_inner();
    data.resize(nsize as usize, 0);
    io.dev.write(new, &data, WriteMode::Async)?;
    inode.db[index] = new.0;
    inode.blocks += grown;
    io.alloc.free(old, osize, ino)?;
    debug!(ino = ino.0, from = old.0, to = new.0, osize, nsize, "fragment moved");
    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointers::tests::geo;
    use std::sync::Arc;
    use ufs_alloc::AllocPolicy;
    use ufs_block::{ByteBlockDevice, MemoryByteDevice, memory_device};
    use ufs_types::{GroupNumber, S_IFREG};

    fn setup() -> (Arc<ByteBlockDevice<MemoryByteDevice>>, Allocator) {
        let g = geo();
        let dev = Arc::new(memory_device(g.fsize, g.size).expect("device"));
        let policy = AllocPolicy {
            minfree_percent: 0,
            dirpref_seed: Some(3),
            ..AllocPolicy::default()
        };
        let sb = Allocator::format(&g, dev.as_ref(), &policy).expect("format");
        let alloc = Allocator::open(g, dev.clone(), sb, policy).expect("open");
        (dev, alloc)
    }

    #[test]
    fn sequential_blocks_follow_each_other() {
        let (dev, alloc) = setup();
        let io = FileIo::new(&alloc, dev.as_ref());
        let g = *alloc.geometry();
        let ino = g.make_ino(GroupNumber(1), 3);
        let mut inode = DiskInode::new(S_IFREG);

        let first = balloc(&io, ino, &mut inode, 0, g.bsize).expect("lbn 0");
        inode.size = 4096;
        let second = balloc(&io, ino, &mut inode, 1, g.bsize).expect("lbn 1");
        inode.size = 8192;
        assert_eq!(first, g.cgdmin(GroupNumber(1)));
        assert_eq!(second.0, first.0 + 8);
        assert_eq!(inode.blocks, 16);
        assert_eq!(bmap(&io, &inode, 1).expect("bmap"), Some(second));
        assert_eq!(bmap(&io, &inode, 2).expect("bmap"), None);
        // Already mapped: same answer, nothing new.
        assert_eq!(balloc(&io, ino, &mut inode, 1, 100).expect("again"), second);
        assert_eq!(inode.blocks, 16);
    }

    #[test]
    fn fragment_grows_in_place_when_room() {
        let (dev, alloc) = setup();
        let io = FileIo::new(&alloc, dev.as_ref());
        let g = *alloc.geometry();
        let ino = g.make_ino(GroupNumber(0), 5);
        let mut inode = DiskInode::new(S_IFREG);

        let addr = balloc(&io, ino, &mut inode, 0, 1000).expect("small");
        inode.size = 1000;
        assert_eq!(inode.blocks, 2);
        let again = balloc(&io, ino, &mut inode, 0, 3000).expect("grow");
        inode.size = 3000;
        assert_eq!(again, addr);
        assert_eq!(inode.blocks, 6);
        assert!(alloc.check().expect("check").is_clean());
    }

    #[test]
    fn blocked_fragment_moves_and_keeps_its_data() {
        let (dev, alloc) = setup();
        let io = FileIo::new(&alloc, dev.as_ref());
        let g = *alloc.geometry();
        let ino = g.make_ino(GroupNumber(0), 5);
        let mut inode = DiskInode::new(S_IFREG);

        let addr = balloc(&io, ino, &mut inode, 0, 1000).expect("small");
        inode.size = 1000;
        let pattern = vec![0xAB_u8; 1024];
        dev.write(addr, &pattern, WriteMode::Sync).expect("data");
        // Fill the rest of that block so the fragment cannot grow.
        let neighbour = alloc
            .alloc(
                ino,
                3072,
                AllocHint {
                    pref: Some(FragNumber(addr.0 + 2)),
                    privileged: false,
                },
            )
            .expect("neighbour");
        assert_eq!(neighbour.0, addr.0 + 2);

        let moved = balloc(&io, ino, &mut inode, 0, 3000).expect("grow");
        inode.size = 3000;
        assert_ne!(moved, addr);
        assert_eq!(inode.blocks, 6);
        let data = dev.read(moved, 3072).expect("read").into_inner();
        assert!(data[..1024].iter().all(|&b| b == 0xAB));
        assert!(data[1024..].iter().all(|&b| b == 0));
        assert!(alloc.check().expect("check").is_clean());
    }

    #[test]
    fn writing_past_a_fragment_promotes_it_to_a_full_block() {
        let (dev, alloc) = setup();
        let io = FileIo::new(&alloc, dev.as_ref());
        let g = *alloc.geometry();
        let ino = g.make_ino(GroupNumber(0), 6);
        let mut inode = DiskInode::new(S_IFREG);

        balloc(&io, ino, &mut inode, 0, 600).expect("small");
        inode.size = 600;
        assert_eq!(inode.blocks, 2);
        balloc(&io, ino, &mut inode, 1, 10).expect("next block");
        assert_eq!(inode.size, 4096);
        inode.size = 4096 + 10;
        // Block 0 is now full; block 1 is a 1-fragment tail.
        assert_eq!(inode.blocks, 8 + 1);
        assert_eq!(g.blksize(inode.size, 0), 4096);
    }

    #[test]
    fn indirect_blocks_are_allocated_on_demand() {
        let (dev, alloc) = setup();
        let io = FileIo::new(&alloc, dev.as_ref());
        let g = *alloc.geometry();
        let ino = g.make_ino(GroupNumber(2), 4);
        let mut inode = DiskInode::new(S_IFREG);
        inode.size = 12 * 4096;

        let addr = balloc(&io, ino, &mut inode, 12, g.bsize).expect("lbn 12");
        assert_ne!(inode.ib[0], 0);
        assert_eq!(inode.blocks, 16);
        assert_eq!(bmap(&io, &inode, 12).expect("bmap"), Some(addr));
        assert_eq!(bmap(&io, &inode, 13).expect("bmap"), None);

        let next = balloc(&io, ino, &mut inode, 13, g.bsize).expect("lbn 13");
        assert_eq!(next.0, addr.0 + 8);
        assert_eq!(inode.blocks, 24);
    }

    #[test]
    fn sentinels_read_as_holes() {
        let (dev, alloc) = setup();
        let io = FileIo::new(&alloc, dev.as_ref());
        let mut inode = DiskInode::new(S_IFREG);
        inode.db[0] = ufs_types::BLK_NOCOPY;
        inode.db[1] = ufs_types::BLK_SNAP;
        assert_eq!(bmap(&io, &inode, 0).expect("bmap"), None);
        assert_eq!(bmap(&io, &inode, 1).expect("bmap"), None);
    }
}
