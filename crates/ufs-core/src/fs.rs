//! Format, mount, and whole-filesystem operations.

use crate::open::OpenInodes;
use crate::options::{FormatOptions, MountOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use ufs_alloc::{AllocPolicy, Allocator, CheckReport};
use ufs_block::{BlockDevice, BufferLocks, InterceptDevice, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_inode::InodeTable;
use ufs_ondisk::{Csum, CsumTotal, DiskInode, FS_UNCLEAN, Geometry, Superblock, mount_error};
use ufs_snapshot::{CowStats, LiveDevice, SnapshotEngine};
use ufs_types::{GroupNumber, InodeNumber, S_IFDIR};

/// Largest superblock this crate reads before it knows the block size.
const SBLOCK_READ: u64 = 65_536;

/// Point-in-time usage figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub geometry: Geometry,
    pub totals: CsumTotal,
    /// Free space in fragments, whole blocks included.
    pub free_frags: u64,
    pub snapshots: usize,
    pub cow: CowStats,
    pub read_only: bool,
}

/// A mounted filesystem.
///
/// Owns the allocator, the snapshot engine, and the two views of the
/// device: `raw` for metadata the snapshots never need preserved, and
/// `live` for everything else, where copy-on-write engages once a snapshot
/// exists.
pub struct Filesystem {
    pub(crate) geo: Geometry,
    pub(crate) raw: Arc<dyn BlockDevice>,
    pub(crate) live: Arc<LiveDevice>,
    pub(crate) alloc: Arc<Allocator>,
    pub(crate) snapshots: Arc<SnapshotEngine>,
    pub(crate) open: OpenInodes,
    /// Held by inode number across every read-modify-write of a file's
    /// inode and pointer tree. Taken after the snapshot write gate.
    pub(crate) inode_locks: BufferLocks,
    read_only: AtomicBool,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("geo", &self.geo)
            .field("read_only", &self.is_read_only())
            .field("snapshots", &self.snapshots)
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

impl Filesystem {
    // ── Format and mount ────────────────────────────────────────────────────

    /// Lay out a new filesystem on `dev` with an empty root directory.
    pub fn format(dev: Arc<dyn BlockDevice>, opts: &FormatOptions) -> Result<Superblock> {
        let geo = opts.geometry(dev.frag_size(), dev.frag_count())?;
        let sb = Allocator::format(&geo, dev.as_ref(), &opts.policy)?;
        let alloc = Allocator::open(geo, Arc::clone(&dev), sb, opts.policy.clone())?;
        alloc.claim_inode(InodeNumber::ROOT, true)?;
        let now = now_secs();
        let root = DiskInode {
            nlink: 2,
            generation: alloc.next_generation(),
            atime: now,
            mtime: now,
            ctime: now,
            ..DiskInode::new(S_IFDIR)
        };
        InodeTable::new(dev.as_ref(), &geo).write(InodeNumber::ROOT, &root, WriteMode::Sync)?;
        alloc.update_superblock(|sb| sb.time = now);
        alloc.flush()?;
        dev.sync()?;
        let sb = alloc.superblock();
        info!(
            ncg = geo.ncg,
            size = geo.size,
            nbfree = sb.cstotal.nbfree,
            nifree = sb.cstotal.nifree,
            "filesystem created"
        );
        Ok(sb)
    }

    /// Read the superblock at the start of `dev`, byte order taken from its
    /// magic number.
    pub fn read_superblock(dev: &dyn BlockDevice) -> Result<Superblock> {
        let avail = dev.frag_count().saturating_mul(u64::from(dev.frag_size()));
        let len = usize::try_from(avail.min(SBLOCK_READ))
            .map_err(|_| UfsError::Format("superblock read length".to_owned()))?;
        let buf = dev.read(ufs_types::FragNumber(0), len)?;
        Superblock::parse(buf.as_slice()).map_err(mount_error)
    }

    /// Attach to the filesystem on `dev` and reload its snapshots.
    pub fn mount(dev: Arc<dyn BlockDevice>, opts: &MountOptions) -> Result<Self> {
        let sb = Self::read_superblock(dev.as_ref())?;
        let geo = sb.geometry()?;
        if dev.frag_size() != geo.fsize || dev.frag_count() < geo.size {
            return Err(UfsError::InvalidGeometry(format!(
                "device of {} x {} bytes cannot hold {} fragments of {}",
                dev.frag_count(),
                dev.frag_size(),
                geo.size,
                geo.fsize
            )));
        }
        if sb.flags & FS_UNCLEAN != 0 {
            warn!("filesystem was not cleanly unmounted; run check");
        }
        let policy = opts.policy.clone().unwrap_or_else(|| AllocPolicy::from_superblock(&sb));
        let alloc = Arc::new(Allocator::open(geo, Arc::clone(&dev), sb, policy)?);
        let live: Arc<LiveDevice> = Arc::new(InterceptDevice::new(Arc::clone(&dev)));
        let snapshots = SnapshotEngine::new(Arc::clone(&alloc), Arc::clone(&live));
        let loaded = snapshots.load()?;

        let fs = Self {
            geo,
            raw: dev,
            live,
            alloc,
            snapshots,
            open: OpenInodes::default(),
            inode_locks: BufferLocks::new(),
            read_only: AtomicBool::new(opts.read_only),
        };
        if !opts.read_only {
            fs.alloc.update_superblock(|sb| sb.flags |= FS_UNCLEAN);
            fs.alloc.flush()?;
        }
        info!(
            ncg = geo.ncg,
            read_only = opts.read_only,
            snapshots = loaded,
            "filesystem mounted"
        );
        Ok(fs)
    }

    /// Flush everything and mark the filesystem clean.
    pub fn unmount(self) -> Result<()> {
        if !self.is_read_only() {
            self.alloc.update_superblock(|sb| {
                sb.flags &= !FS_UNCLEAN;
                sb.time = now_secs();
            });
            self.sync()?;
        }
        info!("filesystem unmounted");
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    #[must_use]
    pub fn snapshot_engine(&self) -> &Arc<SnapshotEngine> {
        &self.snapshots
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(UfsError::ReadOnly);
        }
        Ok(())
    }

    /// Pass `result` through, dropping to read-only on an internal
    /// invariant violation.
    pub(crate) fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() && !self.read_only.swap(true, Ordering::AcqRel) {
                error!(error = %err, "internal inconsistency; filesystem is now read-only");
            }
        }
        result
    }

    // ── Whole-filesystem operations ─────────────────────────────────────────

    /// Write back snapshot inodes, the superblock, and the device.
    pub fn sync(&self) -> Result<()> {
        self.snapshots.flush()?;
        self.alloc.flush()?;
        self.raw.sync()
    }

    /// Recount every group against its header and the summary. Read-only.
    pub fn check(&self) -> Result<CheckReport> {
        let report = self.alloc.check()?;
        if report.is_clean() {
            info!(groups = report.groups_checked, "check clean");
        } else {
            warn!(
                groups = report.groups_checked,
                unreadable = report.unreadable_groups.len(),
                problems = report.problems.len(),
                "check found problems"
            );
        }
        Ok(report)
    }

    #[must_use]
    pub fn stats(&self) -> FsStats {
        let totals = self.alloc.total();
        FsStats {
            geometry: self.geo,
            totals,
            free_frags: totals.nbfree * u64::from(self.geo.frag) + totals.nffree,
            snapshots: self.snapshots.count(),
            cow: self.snapshots.stats(),
            read_only: self.is_read_only(),
        }
    }

    /// Summary counters of every cylinder group, in group order.
    #[must_use]
    pub fn group_summaries(&self) -> Vec<Csum> {
        (0..self.geo.ncg)
            .map(GroupNumber)
            .filter_map(|cg| self.alloc.group_summary(cg))
            .collect()
    }
}
