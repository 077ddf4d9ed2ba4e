//! Superblock encode/decode.
//!
//! One block at fragment 0 of every group; group 0's copy is authoritative.
//! The byte order of the whole image is taken from the magic field.

use crate::geometry::{CSUM_ENTRY_SIZE, Geometry, GeometryParams};
use serde::{Deserialize, Serialize};
use ufs_error::{Result, UfsError};
use ufs_types::{ByteOrder, FS_MAGIC, FSMAXSNAP, ParseError, read_fixed};

/// Offset of the per-group summary array.
pub const SB_CSUM_OFFSET: usize = 0xD0;

/// Set while the filesystem is mounted read-write.
pub const FS_UNCLEAN: u32 = 0x01;

const OFF_BSIZE: usize = 0x04;
const OFF_FSIZE: usize = 0x08;
const OFF_FRAG: usize = 0x0C;
const OFF_FPG: usize = 0x10;
const OFF_IPG: usize = 0x14;
const OFF_NCG: usize = 0x18;
const OFF_INODE_SIZE: usize = 0x1C;
const OFF_SIZE: usize = 0x20;
const OFF_SBLKNO: usize = 0x28;
const OFF_CBLKNO: usize = 0x2C;
const OFF_IBLKNO: usize = 0x30;
const OFF_DBLKNO: usize = 0x34;
const OFF_MAXCONTIG: usize = 0x38;
const OFF_MAXBPG: usize = 0x3C;
const OFF_MINFREE: usize = 0x40;
const OFF_AVGFILESIZE: usize = 0x44;
const OFF_AVGFPDIR: usize = 0x48;
const OFF_FLAGS: usize = 0x4C;
const OFF_TIME: usize = 0x50;
const OFF_CSTOTAL: usize = 0x58;
const OFF_CGROTOR: usize = 0x78;
const OFF_SNAPINUM: usize = 0x7C;

/// Per-group summary counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Csum {
    pub ndir: u32,
    pub nbfree: u32,
    pub nifree: u32,
    pub nffree: u32,
}

impl Csum {
    pub fn parse(order: ByteOrder, bytes: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            ndir: order.read_u32(bytes, offset)?,
            nbfree: order.read_u32(bytes, offset + 4)?,
            nifree: order.read_u32(bytes, offset + 8)?,
            nffree: order.read_u32(bytes, offset + 12)?,
        })
    }

    pub fn write(&self, order: ByteOrder, out: &mut [u8], offset: usize) -> std::result::Result<(), ParseError> {
        order.write_u32(out, offset, self.ndir)?;
        order.write_u32(out, offset + 4, self.nbfree)?;
        order.write_u32(out, offset + 8, self.nifree)?;
        order.write_u32(out, offset + 12, self.nffree)
    }
}

/// Filesystem-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsumTotal {
    pub ndir: u64,
    pub nbfree: u64,
    pub nifree: u64,
    pub nffree: u64,
}

impl CsumTotal {
    /// Sum of the per-group entries.
    #[must_use]
    pub fn from_groups(groups: &[Csum]) -> Self {
        groups.iter().fold(Self::default(), |mut acc, cs| {
            acc.ndir += u64::from(cs.ndir);
            acc.nbfree += u64::from(cs.nbfree);
            acc.nifree += u64::from(cs.nifree);
            acc.nffree += u64::from(cs.nffree);
            acc
        })
    }
}

/// Decoded superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub params: GeometryParams,
    pub frag: u32,
    pub inode_size: u32,
    pub sblkno: u32,
    pub cblkno: u32,
    pub iblkno: u32,
    pub dblkno: u32,
    pub maxcontig: u32,
    pub maxbpg: u32,
    pub minfree: u32,
    pub avgfilesize: u32,
    pub avgfpdir: u32,
    pub flags: u32,
    pub time: i64,
    pub cstotal: CsumTotal,
    pub cgrotor: u32,
    /// Inode numbers of live snapshots; `0` marks an empty slot.
    pub snapinum: [u32; FSMAXSNAP],
    pub csum: Vec<Csum>,
}

impl Superblock {
    /// Fresh superblock for `geo` with zeroed counters.
    #[must_use]
    pub fn new(geo: &Geometry) -> Self {
        Self {
            params: geo.params(),
            frag: geo.frag,
            inode_size: geo.inode_size,
            sblkno: geo.sblkno,
            cblkno: geo.cblkno,
            iblkno: geo.iblkno,
            dblkno: geo.dblkno,
            maxcontig: 1,
            maxbpg: 0,
            minfree: 0,
            avgfilesize: 0,
            avgfpdir: 0,
            flags: 0,
            time: 0,
            cstotal: CsumTotal::default(),
            cgrotor: 0,
            snapinum: [0; FSMAXSNAP],
            csum: vec![Csum::default(); geo.ncg as usize],
        }
    }

    /// Decode a superblock; the byte order comes from the magic field.
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let raw = read_fixed::<4>(bytes, 0)?;
        let Some(order) = ByteOrder::detect(raw, FS_MAGIC) else {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(FS_MAGIC),
                actual: u64::from(u32::from_le_bytes(raw)),
            });
        };

        let ncg = order.read_u32(bytes, OFF_NCG)?;
        let params = GeometryParams {
            bsize: order.read_u32(bytes, OFF_BSIZE)?,
            fsize: order.read_u32(bytes, OFF_FSIZE)?,
            fpg: order.read_u32(bytes, OFF_FPG)?,
            ipg: order.read_u32(bytes, OFF_IPG)?,
            ncg,
            size: order.read_u64(bytes, OFF_SIZE)?,
            order,
        };

        let mut snapinum = [0_u32; FSMAXSNAP];
        for (i, slot) in snapinum.iter_mut().enumerate() {
            *slot = order.read_u32(bytes, OFF_SNAPINUM + i * 4)?;
        }

        let ncg_usize = usize::try_from(ncg).map_err(|_| ParseError::IntegerConversion { field: "ncg" })?;
        let needed = ncg_usize
            .checked_mul(CSUM_ENTRY_SIZE)
            .and_then(|n| n.checked_add(SB_CSUM_OFFSET))
            .ok_or(ParseError::IntegerConversion { field: "ncg" })?;
        if needed > bytes.len() {
            return Err(ParseError::InvalidField {
                field: "ncg",
                reason: "summary array exceeds superblock",
            });
        }
        let csum = (0..ncg_usize)
            .map(|i| Csum::parse(order, bytes, SB_CSUM_OFFSET + i * CSUM_ENTRY_SIZE))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            params,
            frag: order.read_u32(bytes, OFF_FRAG)?,
            inode_size: order.read_u32(bytes, OFF_INODE_SIZE)?,
            sblkno: order.read_u32(bytes, OFF_SBLKNO)?,
            cblkno: order.read_u32(bytes, OFF_CBLKNO)?,
            iblkno: order.read_u32(bytes, OFF_IBLKNO)?,
            dblkno: order.read_u32(bytes, OFF_DBLKNO)?,
            maxcontig: order.read_u32(bytes, OFF_MAXCONTIG)?,
            maxbpg: order.read_u32(bytes, OFF_MAXBPG)?,
            minfree: order.read_u32(bytes, OFF_MINFREE)?,
            avgfilesize: order.read_u32(bytes, OFF_AVGFILESIZE)?,
            avgfpdir: order.read_u32(bytes, OFF_AVGFPDIR)?,
            flags: order.read_u32(bytes, OFF_FLAGS)?,
            time: order.read_i64(bytes, OFF_TIME)?,
            cstotal: CsumTotal {
                ndir: order.read_u64(bytes, OFF_CSTOTAL)?,
                nbfree: order.read_u64(bytes, OFF_CSTOTAL + 8)?,
                nifree: order.read_u64(bytes, OFF_CSTOTAL + 16)?,
                nffree: order.read_u64(bytes, OFF_CSTOTAL + 24)?,
            },
            cgrotor: order.read_u32(bytes, OFF_CGROTOR)?,
            snapinum,
            csum,
        })
    }

    /// Encode into `out` (one block, zero-filled first).
    pub fn write_to(&self, out: &mut [u8]) -> std::result::Result<(), ParseError> {
        let order = self.params.order;
        out.fill(0);
        order.write_u32(out, 0, FS_MAGIC)?;
        order.write_u32(out, OFF_BSIZE, self.params.bsize)?;
        order.write_u32(out, OFF_FSIZE, self.params.fsize)?;
        order.write_u32(out, OFF_FRAG, self.frag)?;
        order.write_u32(out, OFF_FPG, self.params.fpg)?;
        order.write_u32(out, OFF_IPG, self.params.ipg)?;
        order.write_u32(out, OFF_NCG, self.params.ncg)?;
        order.write_u32(out, OFF_INODE_SIZE, self.inode_size)?;
        order.write_u64(out, OFF_SIZE, self.params.size)?;
        order.write_u32(out, OFF_SBLKNO, self.sblkno)?;
        order.write_u32(out, OFF_CBLKNO, self.cblkno)?;
        order.write_u32(out, OFF_IBLKNO, self.iblkno)?;
        order.write_u32(out, OFF_DBLKNO, self.dblkno)?;
        order.write_u32(out, OFF_MAXCONTIG, self.maxcontig)?;
        order.write_u32(out, OFF_MAXBPG, self.maxbpg)?;
        order.write_u32(out, OFF_MINFREE, self.minfree)?;
        order.write_u32(out, OFF_AVGFILESIZE, self.avgfilesize)?;
        order.write_u32(out, OFF_AVGFPDIR, self.avgfpdir)?;
        order.write_u32(out, OFF_FLAGS, self.flags)?;
        order.write_i64(out, OFF_TIME, self.time)?;
        order.write_u64(out, OFF_CSTOTAL, self.cstotal.ndir)?;
        order.write_u64(out, OFF_CSTOTAL + 8, self.cstotal.nbfree)?;
        order.write_u64(out, OFF_CSTOTAL + 16, self.cstotal.nifree)?;
        order.write_u64(out, OFF_CSTOTAL + 24, self.cstotal.nffree)?;
        order.write_u32(out, OFF_CGROTOR, self.cgrotor)?;
        for (i, ino) in self.snapinum.iter().enumerate() {
            order.write_u32(out, OFF_SNAPINUM + i * 4, *ino)?;
        }
        for (i, cs) in self.csum.iter().enumerate() {
            cs.write(order, out, SB_CSUM_OFFSET + i * CSUM_ENTRY_SIZE)?;
        }
        Ok(())
    }

    /// Encode into a fresh block-sized buffer.
    pub fn to_block(&self) -> std::result::Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; self.params.bsize as usize];
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Validate the recorded geometry and check the stored layout agrees
    /// with the derived one.
    pub fn geometry(&self) -> Result<Geometry> {
        let geo = Geometry::new(self.params)?;
        let stored = (
            self.frag,
            self.inode_size,
            self.sblkno,
            self.cblkno,
            self.iblkno,
            self.dblkno,
        );
        let derived = (
            geo.frag,
            geo.inode_size,
            geo.sblkno,
            geo.cblkno,
            geo.iblkno,
            geo.dblkno,
        );
        if stored != derived {
            return Err(UfsError::InvalidGeometry(format!(
                "stored layout {stored:?} disagrees with derived {derived:?}"
            )));
        }
        Ok(geo)
    }

    /// Live snapshot inode numbers in table order.
    pub fn snapshots(&self) -> impl Iterator<Item = u32> + '_ {
        self.snapinum.iter().copied().take_while(|ino| *ino != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn populated(order: ByteOrder) -> Superblock {
        let mut sb = Superblock::new(&geo(order));
        sb.maxcontig = 16;
        sb.maxbpg = 2048;
        sb.minfree = 8;
        sb.time = 1_700_000_000;
        sb.snapinum[0] = 5;
        sb.snapinum[1] = 40;
        for (i, cs) in sb.csum.iter_mut().enumerate() {
            cs.nbfree = 100 - u32::try_from(i).expect("small");
            cs.nifree = 32;
        }
        sb.cstotal = CsumTotal::from_groups(&sb.csum);
        sb
    }

    #[test]
    fn both_byte_orders_decode_to_the_same_value() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let sb = populated(order);
            let block = sb.to_block().expect("encode");
            let back = Superblock::parse(&block).expect("decode");
            assert_eq!(back, sb);
            assert_eq!(back.params.order, order);
            assert_eq!(back.geometry().expect("geometry"), geo(order));
        }
    }

    #[test]
    fn big_endian_magic_is_byte_swapped() {
        let block = populated(ByteOrder::Big).to_block().expect("encode");
        assert_eq!(&block[0..4], &FS_MAGIC.to_be_bytes());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut block = populated(ByteOrder::Little).to_block().expect("encode");
        block[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&block),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn inconsistent_layout_is_rejected() {
        let mut sb = populated(ByteOrder::Little);
        sb.dblkno += 8;
        assert!(matches!(sb.geometry(), Err(UfsError::InvalidGeometry(_))));
    }

    #[test]
    fn snapshot_table_stops_at_first_empty_slot() {
        let sb = populated(ByteOrder::Little);
        assert_eq!(sb.snapshots().collect::<Vec<_>>(), vec![5, 40]);
        assert_eq!(sb.cstotal.nbfree, 100 + 99 + 98 + 97);
    }
}
