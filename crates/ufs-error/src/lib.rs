#![forbid(unsafe_code)]
//! Error types for the UFS allocator and snapshot stack.
//!
//! # Error Taxonomy
//!
//! Two layers:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ufs-types` | Byte-level layout violations |
//! | Runtime | `UfsError` | `ufs-error` (this crate) | Everything returned by allocator, snapshot and filesystem APIs |
//!
//! `ufs-error` does not depend on `ufs-types`. `ufs-ondisk` owns the
//! `ParseError` → `UfsError` conversion because it sees both types and knows
//! which block was being decoded.
//!
//! ## Recovery policy
//!
//! | Kind | Variant | Handling |
//! |------|---------|----------|
//! | Exhaustion | `NoSpace` | Normal result; caller reports it |
//! | Corruption | `Corruption` | The allocator skips the group and keeps going |
//! | I/O failure | `Io` | Propagated; aborts the current operation |
//! | Invariant violation | `InvariantViolation` | Propagated; [`UfsError::is_fatal`] is true |
//!
//! ## errno mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `InvariantViolation` | `EIO` |
//! | `Format` / `Parse` / `InvalidGeometry` / `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |
//! | `SnapshotLimit` | `ENOSPC` |
//! | `Busy` | `EBUSY` |
//! | `NotSnapshot` | `EINVAL` |

use thiserror::Error;

/// Unified error type for every operation in the stack.
#[derive(Debug, Error)]
pub enum UfsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is damaged at a known fragment address (bad magic,
    /// truncated structure, out-of-range field).
    #[error("corrupt metadata at fragment {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not a filesystem this build understands.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Geometry parameters are inconsistent or out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No free fragment, block, or inode satisfies the request.
    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    /// An internal consistency rule was broken (double free, freeing an
    /// inode that is not in use, link-count underflow).
    ///
    /// Callers may choose to degrade the mount to read-only on this error.
    #[error("invariant violated at {block}: {detail}")]
    InvariantViolation { block: u64, detail: String },

    #[error("read-only filesystem")]
    ReadOnly,

    /// The mount already carries the maximum number of snapshots.
    #[error("snapshot limit reached")]
    SnapshotLimit,

    /// Lock contention that the caller should retry from the outside.
    #[error("resource busy")]
    Busy,

    /// The inode named is not a snapshot file.
    #[error("inode {0} is not a snapshot")]
    NotSnapshot(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl UfsError {
    /// Map this error to exactly one POSIX errno.
    ///
    /// Exhaustive: adding a variant without an arm is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::InvariantViolation { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_)
            | Self::NotSnapshot(_) => libc::EINVAL,
            Self::NoSpace | Self::SnapshotLimit => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
            Self::Busy => libc::EBUSY,
        }
    }

    /// Whether the error means in-memory state can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }

    /// Convenience constructor for invariant violations.
    #[must_use]
    pub fn invariant(block: u64, detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            block,
            detail: detail.into(),
        }
    }

    /// Convenience constructor for corruption at a known address.
    #[must_use]
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `UfsError`.
pub type Result<T> = std::result::Result<T, UfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(UfsError, libc::c_int)> = vec![
            (UfsError::Io(std::io::Error::other("test")), libc::EIO),
            (UfsError::corruption(0, "test"), libc::EIO),
            (UfsError::Format("test".into()), libc::EINVAL),
            (UfsError::Parse("test".into()), libc::EINVAL),
            (UfsError::InvalidGeometry("frag=3".into()), libc::EINVAL),
            (UfsError::NoSpace, libc::ENOSPC),
            (UfsError::NotFound("test".into()), libc::ENOENT),
            (UfsError::invariant(9, "freeing free block"), libc::EIO),
            (UfsError::ReadOnly, libc::EROFS),
            (UfsError::SnapshotLimit, libc::ENOSPC),
            (UfsError::Busy, libc::EBUSY),
            (UfsError::NotSnapshot(5), libc::EINVAL),
            (UfsError::InvalidArgument("size".into()), libc::EINVAL),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(UfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn only_invariant_violations_are_fatal() {
        assert!(UfsError::invariant(1, "x").is_fatal());
        assert!(!UfsError::corruption(1, "x").is_fatal());
        assert!(!UfsError::NoSpace.is_fatal());
        assert!(!UfsError::Io(std::io::Error::other("disk")).is_fatal());
    }

    #[test]
    fn display_formatting() {
        let err = UfsError::corruption(42, "bad cg magic");
        assert_eq!(err.to_string(), "corrupt metadata at fragment 42: bad cg magic");

        let inv = UfsError::invariant(208, "freeing free block");
        assert_eq!(inv.to_string(), "invariant violated at 208: freeing free block");

        assert_eq!(UfsError::ReadOnly.to_string(), "read-only filesystem");
        assert_eq!(UfsError::NotSnapshot(7).to_string(), "inode 7 is not a snapshot");
    }
}
