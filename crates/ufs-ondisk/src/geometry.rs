//! Filesystem geometry and fragment/group arithmetic.
//!
//! Every group has the same layout, in fragments from the group base:
//! a superblock copy at `sblkno`, the cylinder-group block at `cblkno`, the
//! inode table at `iblkno`, then data from `dblkno` to the end of the group.
//! The last group may be shorter than `fpg`.

use crate::cg::CG_MAPS_OFFSET;
use crate::superblock::SB_CSUM_OFFSET;
use serde::{Deserialize, Serialize};
use ufs_error::{Result, UfsError};
use ufs_types::{ByteOrder, FragNumber, GroupNumber, InodeNumber, MAXFRAG, NDADDR, NIADDR};

/// Bytes per on-disk inode.
pub const INODE_SIZE: u32 = 256;
/// Bytes per summary entry (`ndir`, `nbfree`, `nifree`, `nffree`).
pub const CSUM_ENTRY_SIZE: usize = 16;

/// Geometry parameters as recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryParams {
    pub bsize: u32,
    pub fsize: u32,
    pub fpg: u32,
    pub ipg: u32,
    pub ncg: u32,
    /// Filesystem size in fragments.
    pub size: u64,
    pub order: ByteOrder,
}

/// Immutable per-mount geometry with derived layout offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub bsize: u32,
    pub fsize: u32,
    /// Fragments per block.
    pub frag: u32,
    pub fpg: u32,
    pub ipg: u32,
    pub ncg: u32,
    pub size: u64,
    pub inode_size: u32,
    pub sblkno: u32,
    pub cblkno: u32,
    pub iblkno: u32,
    pub dblkno: u32,
    pub order: ByteOrder,
}

fn invalid(msg: String) -> UfsError {
    UfsError::InvalidGeometry(msg)
}

impl Geometry {
    /// Validate `params` and derive the per-group layout.
    pub fn new(params: GeometryParams) -> Result<Self> {
        let GeometryParams {
            bsize,
            fsize,
            fpg,
            ipg,
            ncg,
            size,
            order,
        } = params;

        if !fsize.is_power_of_two() || fsize < 512 {
            return Err(invalid(format!("fsize={fsize} must be a power of two >= 512")));
        }
        if !bsize.is_power_of_two() || !(4096..=65536).contains(&bsize) {
            return Err(invalid(format!(
                "bsize={bsize} must be a power of two in 4096..=65536"
            )));
        }
        if bsize < fsize {
            return Err(invalid(format!("bsize={bsize} smaller than fsize={fsize}")));
        }
        let frag = bsize / fsize;
        if frag > MAXFRAG {
            return Err(invalid(format!(
                "bsize/fsize={frag} exceeds {MAXFRAG} fragments per block"
            )));
        }
        if ncg == 0 {
            return Err(invalid("ncg must be at least 1".to_owned()));
        }
        let inopb = bsize / INODE_SIZE;
        if ipg == 0 || ipg % inopb != 0 || ipg % 8 != 0 {
            return Err(invalid(format!(
                "ipg={ipg} must be a positive multiple of {inopb} and of 8"
            )));
        }
        if fpg % frag != 0 {
            return Err(invalid(format!("fpg={fpg} is not a multiple of frag={frag}")));
        }

        let sblkno = 0;
        let cblkno = frag;
        let iblkno = 2 * frag;
        let inode_blocks = ipg / inopb;
        let dblkno = iblkno + inode_blocks * frag;
        if fpg <= dblkno {
            return Err(invalid(format!(
                "fpg={fpg} leaves no data blocks after {dblkno} metadata fragments"
            )));
        }

        let max_size = u64::from(ncg) * u64::from(fpg);
        let last_base = u64::from(ncg - 1) * u64::from(fpg);
        if size > max_size || size < last_base + u64::from(dblkno) + u64::from(frag) {
            return Err(invalid(format!(
                "size={size} frags does not fit {ncg} groups of {fpg} frags"
            )));
        }
        if size % u64::from(frag) != 0 {
            return Err(invalid(format!("size={size} is not a multiple of frag={frag}")));
        }
        if u64::from(ncg) * u64::from(ipg) > u64::from(u32::MAX) {
            return Err(invalid("total inode count overflows u32".to_owned()));
        }

        let geo = Self {
            bsize,
            fsize,
            frag,
            fpg,
            ipg,
            ncg,
            size,
            inode_size: INODE_SIZE,
            sblkno,
            cblkno,
            iblkno,
            dblkno,
            order,
        };

        let sb_bytes = SB_CSUM_OFFSET + ncg as usize * CSUM_ENTRY_SIZE;
        if sb_bytes > bsize as usize {
            return Err(invalid(format!(
                "{ncg} group summaries do not fit a {bsize}-byte superblock"
            )));
        }
        let cg_bytes = CG_MAPS_OFFSET
            + geo.inosused_len()
            + geo.blksfree_len()
            + geo.clusterfree_len();
        if cg_bytes > bsize as usize {
            return Err(invalid(format!(
                "cylinder group maps need {cg_bytes} bytes, block holds {bsize}"
            )));
        }
        Ok(geo)
    }

    #[must_use]
    pub fn params(&self) -> GeometryParams {
        GeometryParams {
            bsize: self.bsize,
            fsize: self.fsize,
            fpg: self.fpg,
            ipg: self.ipg,
            ncg: self.ncg,
            size: self.size,
            order: self.order,
        }
    }

    // ── Sizes ───────────────────────────────────────────────────────────────

    /// Inodes per block.
    #[must_use]
    pub fn inopb(&self) -> u32 {
        self.bsize / self.inode_size
    }

    /// Block pointers per indirect block.
    #[must_use]
    pub fn nindir(&self) -> u64 {
        u64::from(self.bsize) / 8
    }

    #[must_use]
    pub fn bsize_usize(&self) -> usize {
        self.bsize as usize
    }

    /// Filesystem size in blocks.
    #[must_use]
    pub fn numblks(&self) -> u64 {
        self.size / u64::from(self.frag)
    }

    /// Total inode count.
    #[must_use]
    pub fn ninodes(&self) -> u64 {
        u64::from(self.ncg) * u64::from(self.ipg)
    }

    /// Fragments in group `cg` (the last group may be short).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn cg_frags(&self, cg: GroupNumber) -> u32 {
        let base = self.cgbase(cg).0;
        (self.size - base).min(u64::from(self.fpg)) as u32
    }

    /// Data blocks in group `cg` (excludes metadata).
    #[must_use]
    pub fn cg_data_blocks(&self, cg: GroupNumber) -> u32 {
        (self.cg_frags(cg) - self.dblkno) / self.frag
    }

    #[must_use]
    pub fn inosused_len(&self) -> usize {
        (self.ipg as usize).div_ceil(8)
    }

    #[must_use]
    pub fn blksfree_len(&self) -> usize {
        (self.fpg as usize).div_ceil(8)
    }

    #[must_use]
    pub fn clusterfree_len(&self) -> usize {
        ((self.fpg / self.frag) as usize).div_ceil(8)
    }

    /// Largest logical block number a file can map, plus one.
    #[must_use]
    pub fn max_lbn(&self) -> u64 {
        let n = self.nindir();
        let mut total = NDADDR as u64;
        let mut span = 1_u64;
        for _ in 0..NIADDR {
            span = span.saturating_mul(n);
            total = total.saturating_add(span);
        }
        total
    }

    // ── Group addresses ─────────────────────────────────────────────────────

    #[must_use]
    pub fn cgbase(&self, cg: GroupNumber) -> FragNumber {
        FragNumber(u64::from(cg.0) * u64::from(self.fpg))
    }

    /// Superblock copy of group `cg`.
    #[must_use]
    pub fn cgsblock(&self, cg: GroupNumber) -> FragNumber {
        FragNumber(self.cgbase(cg).0 + u64::from(self.sblkno))
    }

    /// Cylinder-group block of group `cg`.
    #[must_use]
    pub fn cgtod(&self, cg: GroupNumber) -> FragNumber {
        FragNumber(self.cgbase(cg).0 + u64::from(self.cblkno))
    }

    /// First inode-table fragment of group `cg`.
    #[must_use]
    pub fn cgimin(&self, cg: GroupNumber) -> FragNumber {
        FragNumber(self.cgbase(cg).0 + u64::from(self.iblkno))
    }

    /// First data fragment of group `cg`.
    #[must_use]
    pub fn cgdmin(&self, cg: GroupNumber) -> FragNumber {
        FragNumber(self.cgbase(cg).0 + u64::from(self.dblkno))
    }

    /// Group holding fragment `addr`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn dtog(&self, addr: FragNumber) -> GroupNumber {
        GroupNumber((addr.0 / u64::from(self.fpg)) as u32)
    }

    /// Offset of `addr` within its group.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn dtogd(&self, addr: FragNumber) -> u32 {
        (addr.0 % u64::from(self.fpg)) as u32
    }

    // ── Inode addresses ─────────────────────────────────────────────────────

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn ino_to_cg(&self, ino: InodeNumber) -> GroupNumber {
        GroupNumber((ino.0 / u64::from(self.ipg)) as u32)
    }

    /// Index of `ino` within its group.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn ino_index(&self, ino: InodeNumber) -> u32 {
        (ino.0 % u64::from(self.ipg)) as u32
    }

    #[must_use]
    pub fn make_ino(&self, cg: GroupNumber, index: u32) -> InodeNumber {
        InodeNumber(u64::from(cg.0) * u64::from(self.ipg) + u64::from(index))
    }

    /// Fragment address of the inode-table block holding `ino`.
    #[must_use]
    pub fn ino_to_fsba(&self, ino: InodeNumber) -> FragNumber {
        let cg = self.ino_to_cg(ino);
        let block = self.ino_index(ino) / self.inopb();
        FragNumber(self.cgimin(cg).0 + u64::from(block) * u64::from(self.frag))
    }

    /// Byte offset of `ino` within its inode-table block.
    #[must_use]
    pub fn ino_to_offset(&self, ino: InodeNumber) -> usize {
        ((self.ino_index(ino) % self.inopb()) * self.inode_size) as usize
    }

    #[must_use]
    pub fn is_valid_ino(&self, ino: InodeNumber) -> bool {
        ino.0 < self.ninodes()
    }

    // ── Fragment arithmetic ─────────────────────────────────────────────────

    /// Round `addr` down to its block boundary.
    #[must_use]
    pub fn blknum(&self, addr: FragNumber) -> FragNumber {
        FragNumber(addr.0 - addr.0 % u64::from(self.frag))
    }

    /// Fragment offset of `addr` within its block.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn fragnum(&self, addr: FragNumber) -> u32 {
        (addr.0 % u64::from(self.frag)) as u32
    }

    /// Whole fragments in `bytes` (truncating).
    #[must_use]
    pub fn numfrags(&self, bytes: u64) -> u64 {
        bytes / u64::from(self.fsize)
    }

    #[must_use]
    pub fn fragroundup(&self, bytes: u64) -> u64 {
        ufs_types::roundup(bytes, u64::from(self.fsize))
    }

    #[must_use]
    pub fn blkroundup(&self, bytes: u64) -> u64 {
        ufs_types::roundup(bytes, u64::from(self.bsize))
    }

    /// Logical block holding byte `offset`.
    #[must_use]
    pub fn lblkno(&self, offset: u64) -> u64 {
        offset / u64::from(self.bsize)
    }

    /// Byte offset within its block.
    #[must_use]
    pub fn blkoff(&self, offset: u64) -> u64 {
        offset % u64::from(self.bsize)
    }

    /// Block index of a block-aligned fragment address.
    #[must_use]
    pub fn fragstoblks(&self, addr: FragNumber) -> u64 {
        addr.0 / u64::from(self.frag)
    }

    #[must_use]
    pub fn blkstofrags(&self, block: u64) -> FragNumber {
        FragNumber(block * u64::from(self.frag))
    }

    /// Allocated size of logical block `lbn` in a file of `file_size` bytes.
    ///
    /// Only the last block of a file shorter than `NDADDR` blocks may be a
    /// partial (fragment-sized) allocation.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blksize(&self, file_size: u64, lbn: u64) -> u32 {
        if lbn >= NDADDR as u64 || file_size >= (lbn + 1) * u64::from(self.bsize) {
            self.bsize
        } else {
            self.fragroundup(self.blkoff(file_size)) as u32
        }
    }

    /// Whether `addr..addr+frags` is a legal data range on this filesystem.
    #[must_use]
    pub fn is_data_range(&self, addr: FragNumber, frags: u64) -> bool {
        if frags == 0 || addr.0.saturating_add(frags) > self.size {
            return false;
        }
        let cg = self.dtog(addr);
        let off = self.dtogd(addr);
        off >= self.dblkno && u64::from(off) + frags <= u64::from(self.cg_frags(cg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4 groups of 104 blocks: 4 metadata blocks and 100 data blocks each.
    fn small() -> Geometry {
        Geometry::new(GeometryParams {
            bsize: 4096,
            fsize: 512,
            fpg: 104 * 8,
            ipg: 32,
            ncg: 4,
            size: 4 * 104 * 8,
            order: ByteOrder::Little,
        })
        .expect("geometry")
    }

    #[test]
    fn layout_offsets() {
        let g = small();
        assert_eq!(g.frag, 8);
        assert_eq!(g.inopb(), 16);
        assert_eq!(g.cblkno, 8);
        assert_eq!(g.iblkno, 16);
        assert_eq!(g.dblkno, 32);
        assert_eq!(g.cg_data_blocks(GroupNumber(0)), 100);
        assert_eq!(g.cgdmin(GroupNumber(1)), FragNumber(832 + 32));
        assert_eq!(g.nindir(), 512);
        assert_eq!(g.numblks(), 416);
    }

    #[test]
    fn inode_addressing() {
        let g = small();
        let ino = InodeNumber(32 + 17);
        assert_eq!(g.ino_to_cg(ino), GroupNumber(1));
        assert_eq!(g.ino_index(ino), 17);
        assert_eq!(g.ino_to_fsba(ino), FragNumber(832 + 16 + 8));
        assert_eq!(g.ino_to_offset(ino), 256);
        assert_eq!(g.make_ino(GroupNumber(1), 17), ino);
    }

    #[test]
    fn blksize_of_partial_tail() {
        let g = small();
        assert_eq!(g.blksize(5000, 0), 4096);
        assert_eq!(g.blksize(5000, 1), 1024);
        assert_eq!(g.blksize(4096 * 20 + 1, 19), 4096);
    }

    #[test]
    fn short_last_group() {
        let g = Geometry::new(GeometryParams {
            size: 3 * 104 * 8 + 40 * 8,
            ..small().params()
        })
        .expect("geometry");
        assert_eq!(g.cg_frags(GroupNumber(3)), 320);
        assert_eq!(g.cg_data_blocks(GroupNumber(3)), 36);
        assert!(!g.is_data_range(FragNumber(3 * 832 + 320), 8));
    }

    #[test]
    fn rejects_bad_parameters() {
        let base = small().params();
        assert!(Geometry::new(GeometryParams { fsize: 256, ..base }).is_err());
        assert!(Geometry::new(GeometryParams { bsize: 8192, ..base }).is_err());
        assert!(Geometry::new(GeometryParams { ipg: 20, ..base }).is_err());
        assert!(Geometry::new(GeometryParams { ncg: 0, ..base }).is_err());
        assert!(Geometry::new(GeometryParams { fpg: 32, ..base }).is_err());
        assert!(
            Geometry::new(GeometryParams {
                size: base.size + 8,
                ..base
            })
            .is_err()
        );
    }

    #[test]
    fn data_range_excludes_metadata() {
        let g = small();
        assert!(!g.is_data_range(FragNumber(0), 1));
        assert!(!g.is_data_range(FragNumber(31), 1));
        assert!(g.is_data_range(FragNumber(32), 8));
        assert!(!g.is_data_range(FragNumber(828), 8));
    }
}
