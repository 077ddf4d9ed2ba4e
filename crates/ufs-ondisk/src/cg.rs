//! Cylinder-group block encode/decode.
//!
//! Header fields up to [`CG_MAPS_OFFSET`], then three maps back to back:
//! inode-used (bit set = in use), fragment-free (bit set = free) and
//! cluster-free (one bit per block, set = whole block free).

use crate::geometry::Geometry;
use crate::superblock::Csum;
use serde::{Deserialize, Serialize};
use ufs_types::{
    ByteOrder, CG_MAGIC, CLUSTERSUM_LEN, GroupNumber, MAXFRAG, ParseError, ensure_slice,
    ensure_slice_mut,
};

/// Start of the bitmaps within the group block.
pub const CG_MAPS_OFFSET: usize = 0xA0;

const OFF_CGX: usize = 0x04;
const OFF_NDBLK: usize = 0x08;
const OFF_NIBLK: usize = 0x0C;
const OFF_CS: usize = 0x10;
const OFF_ROTOR: usize = 0x20;
const OFF_FROTOR: usize = 0x24;
const OFF_IROTOR: usize = 0x28;
const OFF_INITEDIBLK: usize = 0x2C;
const OFF_TIME: usize = 0x30;
const OFF_FRSUM: usize = 0x38;
const OFF_NCLUSTERBLKS: usize = 0x58;
const OFF_CLUSTERSUM: usize = 0x5C;

/// In-memory image of one cylinder group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CylinderGroup {
    pub cgx: u32,
    /// Fragments in this group.
    pub ndblk: u32,
    /// Inodes in this group.
    pub niblk: u32,
    pub cs: Csum,
    /// Last block-allocation position (fragment offset in group).
    pub rotor: u32,
    /// Last fragment-allocation position.
    pub frotor: u32,
    /// Last inode-allocation position.
    pub irotor: u32,
    /// Inodes whose on-disk slots have been zero-initialized.
    pub initediblk: u32,
    pub time: i64,
    /// Count of free runs of exactly `i` fragments inside partially used blocks.
    pub frsum: [u32; MAXFRAG as usize],
    pub nclusterblks: u32,
    /// Count of free block clusters of length `i` (last bucket is `>=`).
    pub clustersum: [u32; CLUSTERSUM_LEN],
    pub inosused: Vec<u8>,
    pub blksfree: Vec<u8>,
    pub clusterfree: Vec<u8>,
}

impl CylinderGroup {
    /// Empty group `cg` for `geo`: everything allocated, counters zero.
    #[must_use]
    pub fn empty(geo: &Geometry, cg: GroupNumber) -> Self {
        let ndblk = geo.cg_frags(cg);
        Self {
            cgx: cg.0,
            ndblk,
            niblk: geo.ipg,
            cs: Csum::default(),
            rotor: 0,
            frotor: 0,
            irotor: 0,
            initediblk: 0,
            time: 0,
            frsum: [0; MAXFRAG as usize],
            nclusterblks: ndblk / geo.frag,
            clustersum: [0; CLUSTERSUM_LEN],
            inosused: vec![0; geo.inosused_len()],
            blksfree: vec![0; geo.blksfree_len()],
            clusterfree: vec![0; geo.clusterfree_len()],
        }
    }

    /// Whether `bytes` starts with a cylinder-group magic in `order`.
    #[must_use]
    pub fn has_magic(order: ByteOrder, bytes: &[u8]) -> bool {
        order.read_u32(bytes, 0).is_ok_and(|m| m == CG_MAGIC)
    }

    /// Decode group block `bytes`.
    pub fn parse(geo: &Geometry, bytes: &[u8]) -> Result<Self, ParseError> {
        let order = geo.order;
        let magic = order.read_u32(bytes, 0)?;
        if magic != CG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(CG_MAGIC),
                actual: u64::from(magic),
            });
        }

        let mut frsum = [0_u32; MAXFRAG as usize];
        for (i, slot) in frsum.iter_mut().enumerate() {
            *slot = order.read_u32(bytes, OFF_FRSUM + i * 4)?;
        }
        let mut clustersum = [0_u32; CLUSTERSUM_LEN];
        for (i, slot) in clustersum.iter_mut().enumerate() {
            *slot = order.read_u32(bytes, OFF_CLUSTERSUM + i * 4)?;
        }

        let ino_off = CG_MAPS_OFFSET;
        let blk_off = ino_off + geo.inosused_len();
        let clu_off = blk_off + geo.blksfree_len();

        let cg = Self {
            cgx: order.read_u32(bytes, OFF_CGX)?,
            ndblk: order.read_u32(bytes, OFF_NDBLK)?,
            niblk: order.read_u32(bytes, OFF_NIBLK)?,
            cs: Csum::parse(order, bytes, OFF_CS)?,
            rotor: order.read_u32(bytes, OFF_ROTOR)?,
            frotor: order.read_u32(bytes, OFF_FROTOR)?,
            irotor: order.read_u32(bytes, OFF_IROTOR)?,
            initediblk: order.read_u32(bytes, OFF_INITEDIBLK)?,
            time: order.read_i64(bytes, OFF_TIME)?,
            frsum,
            nclusterblks: order.read_u32(bytes, OFF_NCLUSTERBLKS)?,
            clustersum,
            inosused: ensure_slice(bytes, ino_off, geo.inosused_len())?.to_vec(),
            blksfree: ensure_slice(bytes, blk_off, geo.blksfree_len())?.to_vec(),
            clusterfree: ensure_slice(bytes, clu_off, geo.clusterfree_len())?.to_vec(),
        };

        if cg.ndblk > geo.fpg {
            return Err(ParseError::InvalidField {
                field: "cg_ndblk",
                reason: "exceeds fragments per group",
            });
        }
        if cg.niblk != geo.ipg || cg.initediblk > geo.ipg {
            return Err(ParseError::InvalidField {
                field: "cg_niblk",
                reason: "inode count disagrees with superblock",
            });
        }
        Ok(cg)
    }

    /// Encode into `out` (one block, zero-filled first).
    pub fn write_to(&self, geo: &Geometry, out: &mut [u8]) -> Result<(), ParseError> {
        let order = geo.order;
        out.fill(0);
        order.write_u32(out, 0, CG_MAGIC)?;
        order.write_u32(out, OFF_CGX, self.cgx)?;
        order.write_u32(out, OFF_NDBLK, self.ndblk)?;
        order.write_u32(out, OFF_NIBLK, self.niblk)?;
        self.cs.write(order, out, OFF_CS)?;
        order.write_u32(out, OFF_ROTOR, self.rotor)?;
        order.write_u32(out, OFF_FROTOR, self.frotor)?;
        order.write_u32(out, OFF_IROTOR, self.irotor)?;
        order.write_u32(out, OFF_INITEDIBLK, self.initediblk)?;
        order.write_i64(out, OFF_TIME, self.time)?;
        for (i, v) in self.frsum.iter().enumerate() {
            order.write_u32(out, OFF_FRSUM + i * 4, *v)?;
        }
        order.write_u32(out, OFF_NCLUSTERBLKS, self.nclusterblks)?;
        for (i, v) in self.clustersum.iter().enumerate() {
            order.write_u32(out, OFF_CLUSTERSUM + i * 4, *v)?;
        }

        let ino_off = CG_MAPS_OFFSET;
        let blk_off = ino_off + self.inosused.len();
        let clu_off = blk_off + self.blksfree.len();
        ensure_slice_mut(out, ino_off, self.inosused.len())?.copy_from_slice(&self.inosused);
        ensure_slice_mut(out, blk_off, self.blksfree.len())?.copy_from_slice(&self.blksfree);
        ensure_slice_mut(out, clu_off, self.clusterfree.len())?
            .copy_from_slice(&self.clusterfree);
        Ok(())
    }

    pub fn to_block(&self, geo: &Geometry) -> Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; geo.bsize_usize()];
        self.write_to(geo, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryParams;

    fn geo(order: ByteOrder) -> Geometry {
        Geometry::new(GeometryParams {
            bsize: 4096,
            fsize: 512,
            fpg: 832,
            ipg: 32,
            ncg: 4,
            size: 4 * 832,
            order,
        })
        .expect("geometry")
    }

    #[test]
    fn encoded_group_decodes_identically_in_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let g = geo(order);
            let mut cg = CylinderGroup::empty(&g, GroupNumber(2));
            cg.cs.nbfree = 99;
            cg.cs.nffree = 3;
            cg.frsum[3] = 1;
            cg.clustersum[16] = 6;
            cg.rotor = 40;
            cg.initediblk = 16;
            cg.blksfree[5] = 0xF0;
            cg.inosused[0] = 0b111;
            cg.clusterfree[12] = 0x0F;

            let block = cg.to_block(&g).expect("encode");
            assert!(CylinderGroup::has_magic(order, &block));
            assert_eq!(CylinderGroup::parse(&g, &block).expect("decode"), cg);
        }
    }

    #[test]
    fn wrong_magic_is_reported() {
        let g = geo(ByteOrder::Little);
        let block = vec![0_u8; 4096];
        assert!(matches!(
            CylinderGroup::parse(&g, &block),
            Err(ParseError::InvalidMagic { .. })
        ));
        assert!(!CylinderGroup::has_magic(ByteOrder::Little, &block));
    }

    #[test]
    fn inode_count_mismatch_is_rejected() {
        let g = geo(ByteOrder::Little);
        let mut cg = CylinderGroup::empty(&g, GroupNumber(0));
        cg.niblk = 64;
        let block = cg.to_block(&g).expect("encode");
        assert!(matches!(
            CylinderGroup::parse(&g, &block),
            Err(ParseError::InvalidField { field: "cg_niblk", .. })
        ));
    }
}
