#![forbid(unsafe_code)]
//! Public API facade.
//!
//! Re-exports the mounted-filesystem API from `ufs-core` together with the
//! device and address types a caller needs to use it. The CLI depends on
//! this crate only.

pub use ufs_block::{BlockDevice, ByteBlockDevice, FileByteDevice, MemoryByteDevice, memory_device};
pub use ufs_core::*;
pub use ufs_error::{Result, UfsError};
pub use ufs_ondisk::{Csum, CsumTotal, DiskInode, FS_UNCLEAN, Geometry, Superblock};
pub use ufs_types::{ByteOrder, FragNumber, GroupNumber, InodeNumber};
