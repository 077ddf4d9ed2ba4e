#![forbid(unsafe_code)]
//! Shared vocabulary for the UFS allocator and snapshot crates.
//!
//! Unit-carrying address newtypes, the two supported on-disk byte orders,
//! bounds-checked field readers/writers, and the sentinel values that a
//! snapshot stores in its block-pointer list.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Superblock magic number.
pub const FS_MAGIC: u32 = 0x1954_0119;
/// Cylinder-group header magic number.
pub const CG_MAGIC: u32 = 0x0009_0255;

/// Direct block pointers per inode.
pub const NDADDR: usize = 12;
/// Indirect block pointers per inode (single, double, triple).
pub const NIADDR: usize = 3;
/// Largest supported fragments-per-block ratio.
pub const MAXFRAG: u32 = 8;
/// Maximum number of live snapshots per mount.
pub const FSMAXSNAP: usize = 20;
/// Length of the per-group free-cluster histogram (index 0 unused).
pub const CLUSTERSUM_LEN: usize = 17;

/// Snapshot slot value: block was free at snapshot time, no copy is needed.
pub const BLK_NOCOPY: u64 = 1;
/// Snapshot slot value: block is claimed by a snapshot file itself.
pub const BLK_SNAP: u64 = 2;

/// Inode flag marking a snapshot file.
pub const SF_SNAPSHOT: u32 = 0x0020_0000;

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;

/// Disk address in fragment units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragNumber(pub u64);

/// Cylinder group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Inode number (group * inodes_per_group + index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Logical block index within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u64);

impl FragNumber {
    /// Address `0` is a hole in a block-pointer list.
    pub const HOLE: Self = Self(0);

    #[must_use]
    pub fn is_hole(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn checked_add(self, frags: u64) -> Option<Self> {
        self.0.checked_add(frags).map(Self)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

impl fmt::Display for FragNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Snapshot slot sentinels ─────────────────────────────────────────────────

/// Decoded value of one slot in a snapshot's block-pointer list.
///
/// On disk a slot is a plain `u64`: `0` is unclaimed, [`BLK_NOCOPY`] and
/// [`BLK_SNAP`] are sentinels, anything else is a real fragment address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapSlot {
    /// Still needs a copy on first write.
    Unclaimed,
    /// Free at snapshot time; the snapshot does not preserve it.
    NoCopy,
    /// Held by a snapshot file (this one or a sibling); never copied.
    SnapOwned,
    /// The snapshot's own block for this position.
    Owned(FragNumber),
}

impl SnapSlot {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => Self::Unclaimed,
            BLK_NOCOPY => Self::NoCopy,
            BLK_SNAP => Self::SnapOwned,
            addr => Self::Owned(FragNumber(addr)),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u64 {
        match self {
            Self::Unclaimed => 0,
            Self::NoCopy => BLK_NOCOPY,
            Self::SnapOwned => BLK_SNAP,
            Self::Owned(addr) => addr.0,
        }
    }

    /// Whether a raw block-pointer value names a real disk address.
    #[must_use]
    pub fn is_real_address(raw: u64) -> bool {
        raw > BLK_SNAP
    }
}

// ── Byte order ──────────────────────────────────────────────────────────────

/// On-disk byte order, chosen at mount time from the superblock magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    /// Detect the byte order of a 4-byte magic field.
    #[must_use]
    pub fn detect(raw: [u8; 4], magic: u32) -> Option<Self> {
        if u32::from_le_bytes(raw) == magic {
            Some(Self::Little)
        } else if u32::from_be_bytes(raw) == magic {
            Some(Self::Big)
        } else {
            None
        }
    }

    #[inline]
    pub fn read_u16(self, data: &[u8], offset: usize) -> Result<u16, ParseError> {
        let bytes = read_fixed::<2>(data, offset)?;
        Ok(match self {
            Self::Little => u16::from_le_bytes(bytes),
            Self::Big => u16::from_be_bytes(bytes),
        })
    }

    #[inline]
    pub fn read_u32(self, data: &[u8], offset: usize) -> Result<u32, ParseError> {
        let bytes = read_fixed::<4>(data, offset)?;
        Ok(match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        })
    }

    #[inline]
    pub fn read_u64(self, data: &[u8], offset: usize) -> Result<u64, ParseError> {
        let bytes = read_fixed::<8>(data, offset)?;
        Ok(match self {
            Self::Little => u64::from_le_bytes(bytes),
            Self::Big => u64::from_be_bytes(bytes),
        })
    }

    #[inline]
    pub fn read_i64(self, data: &[u8], offset: usize) -> Result<i64, ParseError> {
        let bytes = read_fixed::<8>(data, offset)?;
        Ok(match self {
            Self::Little => i64::from_le_bytes(bytes),
            Self::Big => i64::from_be_bytes(bytes),
        })
    }

    #[inline]
    pub fn write_u16(self, data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 2)?.copy_from_slice(&bytes);
        Ok(())
    }

    #[inline]
    pub fn write_u32(self, data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 4)?.copy_from_slice(&bytes);
        Ok(())
    }

    #[inline]
    pub fn write_u64(self, data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 8)?.copy_from_slice(&bytes);
        Ok(())
    }

    #[inline]
    pub fn write_i64(self, data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 8)?.copy_from_slice(&bytes);
        Ok(())
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Round `value` up to a multiple of `align` (`align` > 0).
#[must_use]
pub fn roundup(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}
