#![forbid(unsafe_code)]
//! Point-in-time snapshots of a mounted filesystem.
//!
//! A snapshot is an ordinary inode whose logical blocks mirror the whole
//! filesystem. Slots start out unclaimed, meaning the snapshot still shares
//! the live block. Two hooks keep that true as the filesystem changes:
//!
//! - the **write hook** on the live device copies a block into every
//!   snapshot still sharing it before the overwrite lands;
//! - the **free hook** on the allocator hands a freed whole block to the
//!   first snapshot that needs it instead of returning it to the free pool.
//!
//! Blocks free when the snapshot was taken are marked as never needing a
//! copy, as are blocks held by the snapshot files themselves.
//!
//! ## Concurrency
//!
//! One coordination lock guards the snapshot list and its generation
//! counter. Hooks decide under it, copy without it, and commit only if the
//! generation has not moved ([`with_generation_retry`]). Per-block locks
//! serialize hooks acting on the same filesystem block. Lock order is write
//! gate, then coordination lock, then a snapshot's own state.

mod create;
mod engine;
mod file;
mod intercept;
mod retry;

pub use engine::{CowStats, LiveDevice, SnapshotEngine};
pub use file::{SnapshotInfo, decode_hints, encode_hints, is_settled, is_snapshot};
pub use retry::{Generation, MAX_ATTEMPTS, with_generation_retry};
