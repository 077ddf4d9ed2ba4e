//! On-disk inode (256 bytes).

use serde::{Deserialize, Serialize};
use ufs_types::{ByteOrder, NDADDR, NIADDR, ParseError, S_IFDIR, S_IFMT, S_IFREG, SF_SNAPSHOT};

const OFF_MODE: usize = 0;
const OFF_NLINK: usize = 2;
const OFF_FLAGS: usize = 4;
const OFF_SIZE: usize = 8;
const OFF_BLOCKS: usize = 16;
const OFF_GEN: usize = 24;
const OFF_ATIME: usize = 32;
const OFF_MTIME: usize = 40;
const OFF_CTIME: usize = 48;
const OFF_DB: usize = 64;
const OFF_IB: usize = OFF_DB + NDADDR * 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInode {
    pub mode: u16,
    pub nlink: u16,
    pub flags: u32,
    pub size: u64,
    /// Fragments held, including indirect blocks.
    pub blocks: u64,
    pub generation: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub db: [u64; NDADDR],
    pub ib: [u64; NIADDR],
}

impl DiskInode {
    #[must_use]
    pub fn new(mode: u16) -> Self {
        Self {
            mode,
            nlink: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.flags & SF_SNAPSHOT != 0
    }

    /// An allocated inode has a non-zero mode.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.mode != 0
    }

    pub fn parse(order: ByteOrder, bytes: &[u8]) -> Result<Self, ParseError> {
        let mut db = [0_u64; NDADDR];
        for (i, slot) in db.iter_mut().enumerate() {
            *slot = order.read_u64(bytes, OFF_DB + i * 8)?;
        }
        let mut ib = [0_u64; NIADDR];
        for (i, slot) in ib.iter_mut().enumerate() {
            *slot = order.read_u64(bytes, OFF_IB + i * 8)?;
        }
        Ok(Self {
            mode: order.read_u16(bytes, OFF_MODE)?,
            nlink: order.read_u16(bytes, OFF_NLINK)?,
            flags: order.read_u32(bytes, OFF_FLAGS)?,
            size: order.read_u64(bytes, OFF_SIZE)?,
            blocks: order.read_u64(bytes, OFF_BLOCKS)?,
            generation: order.read_u32(bytes, OFF_GEN)?,
            atime: order.read_i64(bytes, OFF_ATIME)?,
            mtime: order.read_i64(bytes, OFF_MTIME)?,
            ctime: order.read_i64(bytes, OFF_CTIME)?,
            db,
            ib,
        })
    }

    /// Encode into the 256-byte slot `out`.
    pub fn write_to(&self, order: ByteOrder, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < 256 {
            return Err(ParseError::InsufficientData {
                needed: 256,
                offset: 0,
                actual: out.len(),
            });
        }
        out[..256].fill(0);
        order.write_u16(out, OFF_MODE, self.mode)?;
        order.write_u16(out, OFF_NLINK, self.nlink)?;
        order.write_u32(out, OFF_FLAGS, self.flags)?;
        order.write_u64(out, OFF_SIZE, self.size)?;
        order.write_u64(out, OFF_BLOCKS, self.blocks)?;
        order.write_u32(out, OFF_GEN, self.generation)?;
        order.write_i64(out, OFF_ATIME, self.atime)?;
        order.write_i64(out, OFF_MTIME, self.mtime)?;
        order.write_i64(out, OFF_CTIME, self.ctime)?;
        for (i, addr) in self.db.iter().enumerate() {
            order.write_u64(out, OFF_DB + i * 8, *addr)?;
        }
        for (i, addr) in self.ib.iter().enumerate() {
            order.write_u64(out, OFF_IB + i * 8, *addr)?;
        }
        Ok(())
    }
}
