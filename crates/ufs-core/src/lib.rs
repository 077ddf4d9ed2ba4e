#![forbid(unsafe_code)]
//! A mounted UFS/FFS filesystem.
//!
//! [`Filesystem`] ties the allocator, the inode table, and the snapshot
//! engine to one block device. It formats and mounts images, runs the
//! inode lifecycle (create, open, close, unlink), moves file data, and
//! creates and deletes snapshots.
//!
//! Every mutation holds the snapshot engine's write gate for its duration,
//! so snapshot creation sees a quiescent filesystem. An internal
//! inconsistency reported by any layer flips the mount to read-only.

mod file;
mod fs;
mod open;
mod options;
mod snapshot;

pub use fs::{Filesystem, FsStats};
pub use options::{FormatOptions, MountOptions};
pub use ufs_alloc::{AllocPolicy, CheckReport};
pub use ufs_inode::TruncateOutcome;
pub use ufs_snapshot::{CowStats, SnapshotInfo};
