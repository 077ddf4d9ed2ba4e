#![forbid(unsafe_code)]
//! On-disk format for the UFS-style filesystem.
//!
//! Pure encode/decode, no I/O: geometry arithmetic, the superblock with its
//! per-group summary array, cylinder-group blocks with their bitmaps and
//! histograms, and 256-byte inodes. Both byte orders are supported; the
//! superblock magic decides which one an image uses.

pub mod cg;
pub mod geometry;
pub mod inode;
pub mod superblock;

pub use cg::{CG_MAPS_OFFSET, CylinderGroup};
pub use geometry::{CSUM_ENTRY_SIZE, Geometry, GeometryParams, INODE_SIZE};
pub use inode::DiskInode;
pub use superblock::{Csum, CsumTotal, FS_UNCLEAN, SB_CSUM_OFFSET, Superblock};

use ufs_error::UfsError;
use ufs_types::ParseError;

/// Convert a parse failure seen while mounting (before anything is live).
///
/// A wrong magic means "not this filesystem" rather than damage.
#[must_use]
pub fn mount_error(err: ParseError) -> UfsError {
    match err {
        ParseError::InvalidMagic { .. } => UfsError::Format(err.to_string()),
        ParseError::InvalidField { field, reason } => {
            UfsError::InvalidGeometry(format!("{field}: {reason}"))
        }
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            UfsError::Parse(err.to_string())
        }
    }
}

/// Convert a parse failure on live metadata at fragment `block`.
#[must_use]
pub fn live_error(block: u64, err: ParseError) -> UfsError {
    UfsError::Corruption {
        block,
        detail: err.to_string(),
    }
}
