//! Inode table I/O.
//!
//! Inodes are packed `inopb` to a block. Reading one inode reads its whole
//! table block; writing one is a read-modify-write under the block's buffer
//! lock so neighbouring inodes are never lost.

use tracing::trace;
use ufs_block::{BlockBuf, BlockDevice, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_ondisk::{DiskInode, Geometry, INODE_SIZE, live_error};
use ufs_types::InodeNumber;

/// Inode table access through one device.
pub struct InodeTable<'a> {
    dev: &'a dyn BlockDevice,
    geo: &'a Geometry,
}

impl<'a> InodeTable<'a> {
    pub fn new(dev: &'a dyn BlockDevice, geo: &'a Geometry) -> Self {
        Self { dev, geo }
    }

    fn check(&self, ino: InodeNumber) -> Result<()> {
        if self.geo.is_valid_ino(ino) {
            Ok(())
        } else {
            Err(UfsError::InvalidArgument(format!("inode {ino} out of range")))
        }
    }

    /// The table block holding `ino`.
    pub fn read_block(&self, ino: InodeNumber) -> Result<BlockBuf> {
        self.check(ino)?;
        self.dev.read(self.geo.ino_to_fsba(ino), self.geo.bsize_usize())
    }

    pub fn read(&self, ino: InodeNumber) -> Result<DiskInode> {
        let buf = self.read_block(ino)?;
        decode_slot(self.geo, buf.as_slice(), ino)
    }

    pub fn write(&self, ino: InodeNumber, inode: &DiskInode, mode: WriteMode) -> Result<()> {
        self.update(ino, mode, |slot| {
            *slot = *inode;
            Ok(())
        })
    }

    /// Read `ino`, let `edit` change it, and write it back, all under the
    /// table block's buffer lock.
    pub fn update<T>(
        &self,
        ino: InodeNumber,
        mode: WriteMode,
        edit: impl FnOnce(&mut DiskInode) -> Result<T>,
    ) -> Result<T> {
        self.check(ino)?;
        let addr = self.geo.ino_to_fsba(ino);
        let _guard = self.dev.buffer_locks().lock(addr.0);
        let mut buf = self.dev.read(addr, self.geo.bsize_usize())?;
        let mut inode = decode_slot(self.geo, buf.as_slice(), ino)?;
        let out = edit(&mut inode)?;
        encode_slot(self.geo, buf.as_mut_slice(), ino, &inode)?;
        self.dev.write(addr, buf.as_slice(), mode)?;
        trace!(ino = ino.0, size = inode.size, "inode written");
        Ok(out)
    }
}

fn slot_range(geo: &Geometry, ino: InodeNumber) -> std::ops::Range<usize> {
    let off = geo.ino_to_offset(ino);
    off..off + INODE_SIZE as usize
}

/// Decode inode `ino` from a copy of its table block.
pub fn decode_slot(geo: &Geometry, block: &[u8], ino: InodeNumber) -> Result<DiskInode> {
    let addr = geo.ino_to_fsba(ino).0;
    let bytes = block
        .get(slot_range(geo, ino))
        .ok_or_else(|| UfsError::corruption(addr, "inode slot past end of block"))?;
    DiskInode::parse(geo.order, bytes).map_err(|e| live_error(addr, e))
}

/// Encode `inode` into its slot in a copy of its table block.
pub fn encode_slot(geo: &Geometry, block: &mut [u8], ino: InodeNumber, inode: &DiskInode) -> Result<()> {
    let addr = geo.ino_to_fsba(ino).0;
    let bytes = block
        .get_mut(slot_range(geo, ino))
        .ok_or_else(|| UfsError::corruption(addr, "inode slot past end of block"))?;
    inode.write_to(geo.order, bytes).map_err(|e| live_error(addr, e))
}

/// Zero inode `ino` in a copy of its table block.
pub fn clear_slot(geo: &Geometry, block: &mut [u8], ino: InodeNumber) -> Result<()> {
    encode_slot(geo, block, ino, &DiskInode::default())
}
