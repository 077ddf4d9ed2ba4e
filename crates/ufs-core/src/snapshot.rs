//! Snapshot operations on a mounted filesystem.

use crate::fs::{Filesystem, now_secs};
use tracing::{info, warn};
use ufs_block::WriteMode;
use ufs_error::{Result, UfsError};
use ufs_inode::InodeTable;
use ufs_ondisk::DiskInode;
use ufs_snapshot::SnapshotInfo;
use ufs_types::{InodeNumber, S_IFREG};

impl Filesystem {
    /// Take a snapshot of the whole filesystem in a fresh inode.
    pub fn snapshot_create(&self) -> Result<SnapshotInfo> {
        self.writable()?;
        let ino = {
            let _writes = self.snapshots.write_gate();
            let ino = self.guard(self.alloc.valloc(InodeNumber::ROOT, S_IFREG))?;
            let now = now_secs();
            let inode = DiskInode {
                generation: self.alloc.next_generation(),
                atime: now,
                mtime: now,
                ctime: now,
                ..DiskInode::new(S_IFREG)
            };
            if let Err(err) = InodeTable::new(self.live.as_ref(), &self.geo).write(ino, &inode, WriteMode::Sync) {
                self.alloc.vfree(ino, false)?;
                return Err(err);
            }
            ino
        };

        match self.snapshots.create(ino, &|| self.unlinked_open()) {
            Ok(info) => {
                self.sync()?;
                Ok(info)
            }
            Err(err) => {
                warn!(ino = ino.0, error = %err, "snapshot creation failed");
                let _writes = self.snapshots.write_gate();
                InodeTable::new(self.live.as_ref(), &self.geo).write(ino, &DiskInode::default(), WriteMode::Sync)?;
                self.alloc.vfree(ino, false)?;
                self.guard(Err(err))
            }
        }
    }

    /// Delete snapshot `ino`, returning every block it holds.
    pub fn snapshot_delete(&self, ino: InodeNumber) -> Result<()> {
        self.writable()?;
        self.guard(self.snapshots.delete(ino))?;
        self.sync()?;
        info!(ino = ino.0, "snapshot removed");
        Ok(())
    }

    /// Live snapshots, oldest first.
    pub fn snapshot_list(&self) -> Result<Vec<SnapshotInfo>> {
        self.snapshots.list()
    }

    /// Filesystem block `lbn` as snapshot `ino` preserved it.
    pub fn snapshot_read(&self, ino: InodeNumber, lbn: u64) -> Result<Vec<u8>> {
        if !self.snapshots.is_snapshot(ino) {
            return Err(UfsError::NotSnapshot(ino.0));
        }
        self.snapshots.read_block(ino, lbn)
    }
}
