//! Inode lifecycle and file data paths.
//!
//! Every mutation holds the snapshot write gate and goes through the live
//! device, so copy-on-write sees it. Changes to one file are serialized by
//! its inode lock, always taken after the gate. Snapshot inodes are
//! read-only here.

use crate::fs::{Filesystem, now_secs};
use tracing::{debug, trace};
use ufs_block::{BlockDevice, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_inode::{DeviceIndirect, FileIo, InodeTable, TruncateOutcome, balloc, bmap, truncate};
use ufs_ondisk::DiskInode;
use ufs_types::{InodeNumber, S_IFDIR, S_IFREG};

impl Filesystem {
    fn live_table(&self) -> InodeTable<'_> {
        InodeTable::new(self.live.as_ref(), &self.geo)
    }

    /// Read an allocated inode.
    pub fn stat(&self, ino: InodeNumber) -> Result<DiskInode> {
        let inode = self.live_table().read(ino)?;
        if !inode.is_allocated() {
            return Err(UfsError::NotFound(format!("inode {ino}")));
        }
        Ok(inode)
    }

    /// An allocated regular file that is not a snapshot.
    fn plain_file(&self, ino: InodeNumber) -> Result<DiskInode> {
        let inode = self.stat(ino)?;
        if inode.is_snapshot() {
            return Err(UfsError::InvalidArgument(format!("inode {ino} is a snapshot")));
        }
        if !inode.is_regular() {
            return Err(UfsError::InvalidArgument(format!("inode {ino} is not a regular file")));
        }
        Ok(inode)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Allocate an empty regular file near `parent`.
    pub fn create_file(&self, parent: InodeNumber) -> Result<InodeNumber> {
        self.make_inode(parent, S_IFREG)
    }

    /// Allocate an empty directory, placed by the directory spreading policy.
    pub fn create_dir(&self, parent: InodeNumber) -> Result<InodeNumber> {
        self.make_inode(parent, S_IFDIR)
    }

    fn make_inode(&self, parent: InodeNumber, mode: u16) -> Result<InodeNumber> {
        self.writable()?;
        let writes = self.snapshots.write_gate();
        let ino = self.guard(self.alloc.valloc(parent, mode))?;
        let now = now_secs();
        let inode = DiskInode {
            nlink: if mode == S_IFDIR { 2 } else { 1 },
            generation: self.alloc.next_generation(),
            atime: now,
            mtime: now,
            ctime: now,
            ..DiskInode::new(mode)
        };
        if let Err(err) = self.live_table().write(ino, &inode, WriteMode::Sync) {
            self.alloc.vfree(ino, mode == S_IFDIR)?;
            return Err(err);
        }
        drop(writes);
        self.snapshots.flush()?;
        debug!(ino = ino.0, parent = parent.0, mode, "inode created");
        Ok(ino)
    }

    /// Take a reference on `ino`, keeping its storage alive past unlink.
    pub fn open(&self, ino: InodeNumber) -> Result<()> {
        self.stat(ino)?;
        let count = self.open.acquire(ino);
        trace!(ino = ino.0, count, "opened");
        Ok(())
    }

    /// Drop a reference; the last close of an unlinked inode frees it.
    pub fn close(&self, ino: InodeNumber) -> Result<()> {
        let left = self
            .open
            .release(ino)
            .ok_or_else(|| UfsError::InvalidArgument(format!("inode {ino} is not open")))?;
        if left > 0 {
            return Ok(());
        }
        let inode = self.live_table().read(ino)?;
        if inode.is_allocated() && inode.nlink == 0 {
            self.reclaim(ino)?;
        }
        Ok(())
    }

    /// Inodes with no links that are still open.
    #[must_use]
    pub fn unlinked_open(&self) -> Vec<InodeNumber> {
        let table = self.live_table();
        self.open
            .inodes()
            .into_iter()
            .filter(|&ino| table.read(ino).is_ok_and(|inode| inode.is_allocated() && inode.nlink == 0))
            .collect()
    }

    /// Remove one link. Storage is released once the inode is neither
    /// linked nor open. Unlinking a snapshot deletes it.
    pub fn unlink(&self, ino: InodeNumber) -> Result<()> {
        self.writable()?;
        let inode = self.stat(ino)?;
        if inode.is_snapshot() {
            return self.snapshot_delete(ino);
        }
        let table_block = self.geo.ino_to_fsba(ino).0;
        let inode = {
            let _writes = self.snapshots.write_gate();
            let _inode = self.inode_locks.lock(ino.0);
            self.guard(self.live_table().update(ino, WriteMode::Sync, |inode| {
                if inode.nlink == 0 {
                    return Err(UfsError::invariant(
                        table_block,
                        format!("link count underflow on inode {ino}"),
                    ));
                }
                inode.nlink -= 1;
                inode.ctime = now_secs();
                Ok(*inode)
            }))?
        };
        self.snapshots.flush()?;
        if inode.nlink == 0 && !self.open.is_open(ino) {
            self.reclaim(ino)?;
        }
        Ok(())
    }

    /// Free every block of `ino` and the inode itself, unless it was
    /// relinked, reopened, or already reclaimed.
    fn reclaim(&self, ino: InodeNumber) -> Result<()> {
        {
            let _writes = self.snapshots.write_gate();
            let _inode = self.inode_locks.lock(ino.0);
            let mut inode = self.live_table().read(ino)?;
            if !inode.is_allocated() || inode.nlink > 0 || self.open.is_open(ino) {
                return Ok(());
            }
            let is_dir = inode.is_dir();
            if inode.size > 0 {
                self.truncate_locked(ino, &mut inode, 0)?;
            }
            self.live_table().write(ino, &DiskInode::default(), WriteMode::Sync)?;
            self.guard(self.alloc.vfree(ino, is_dir))?;
        }
        self.snapshots.flush()?;
        debug!(ino = ino.0, "inode reclaimed");
        Ok(())
    }

    // ── Data ────────────────────────────────────────────────────────────────

    /// Write `data` at byte `offset`, allocating as needed. Returns the
    /// bytes written.
    #[expect(clippy::cast_possible_truncation)]
    pub fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<usize> {
        self.writable()?;
        let written = {
            let _writes = self.snapshots.write_gate();
            let _inode = self.inode_locks.lock(ino.0);
            let mut inode = self.plain_file(ino)?;
            let io = FileIo::new(&self.alloc, self.live.as_ref());
            let bsize = u64::from(self.geo.bsize);
            let mut done = 0_usize;
            let result: Result<()> = (|| {
                while done < data.len() {
                    let pos = offset + done as u64;
                    let lbn = self.geo.lblkno(pos);
                    let start = (pos % bsize) as usize;
                    let n = (data.len() - done).min(self.geo.bsize_usize() - start);
                    let end = (start + n) as u32;

                    let addr = balloc(&io, ino, &mut inode, lbn, end)?;
                    let new_size = inode.size.max(pos + n as u64);
                    let span = self.geo.blksize(new_size, lbn) as usize;
                    let chunk = &data[done..done + n];
                    if start == 0 && n == span {
                        self.live.write(addr, chunk, WriteMode::Async)?;
                    } else {
                        let mut block = self.live.read(addr, span)?.into_inner();
                        block[start..start + n].copy_from_slice(chunk);
                        self.live.write(addr, &block, WriteMode::Async)?;
                    }
                    inode.size = new_size;
                    done += n;
                }
                Ok(())
            })();
            // Blocks allocated before a failure stay recorded in the inode.
            inode.mtime = now_secs();
            self.live_table().write(ino, &inode, WriteMode::Delayed)?;
            self.guard(result)?;
            done
        };
        self.snapshots.flush()?;
        trace!(ino = ino.0, offset, written, "write");
        Ok(written)
    }

    /// Read up to `len` bytes at `offset`; holes read as zeros.
    #[expect(clippy::cast_possible_truncation)]
    pub fn read(&self, ino: InodeNumber, offset: u64, len: usize) -> Result<Vec<u8>> {
        let inode = self.stat(ino)?;
        if offset >= inode.size {
            return Ok(Vec::new());
        }
        let end = inode.size.min(offset + len as u64);
        let io = FileIo::new(&self.alloc, self.live.as_ref());
        let bsize = u64::from(self.geo.bsize);
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let lbn = self.geo.lblkno(pos);
            let start = (pos % bsize) as usize;
            let n = ((end - pos) as usize).min(self.geo.bsize_usize() - start);
            match bmap(&io, &inode, lbn)? {
                Some(addr) => {
                    let span = self.geo.blksize(inode.size, lbn) as usize;
                    let block = self.live.read(addr, span)?;
                    out.extend_from_slice(&block.as_slice()[start..start + n]);
                }
                None => out.resize(out.len() + n, 0),
            }
            pos += n as u64;
        }
        Ok(out)
    }

    /// Set the size of `ino` to `length`, releasing storage past it.
    pub fn truncate(&self, ino: InodeNumber, length: u64) -> Result<TruncateOutcome> {
        self.writable()?;
        let outcome = {
            let _writes = self.snapshots.write_gate();
            let _inode = self.inode_locks.lock(ino.0);
            let mut inode = self.plain_file(ino)?;
            self.truncate_locked(ino, &mut inode, length)?
        };
        self.snapshots.flush()?;
        Ok(outcome)
    }

    /// The caller holds the write gate and the inode lock of `ino`.
    fn truncate_locked(&self, ino: InodeNumber, inode: &mut DiskInode, length: u64) -> Result<TruncateOutcome> {
        let table = self.live_table();
        inode.mtime = now_secs();
        if length > inode.size {
            // Growing backs the new last byte so a fragment-sized block
            // never sits before the end of file.
            let files = FileIo::new(&self.alloc, self.live.as_ref());
            let last = length - 1;
            let end = u32::try_from(self.geo.blkoff(last) + 1)
                .map_err(|_| UfsError::InvalidArgument(format!("length {length}")))?;
            if let Err(err) = balloc(&files, ino, inode, self.geo.lblkno(last), end) {
                table.write(ino, inode, WriteMode::Delayed)?;
                return self.guard(Err(err));
            }
        }
        let io = DeviceIndirect::new(self.live.as_ref(), &self.geo, WriteMode::Async);
        let outcome = self.guard(truncate(
            &io,
            inode,
            length,
            &mut |cut| table.write(ino, cut, WriteMode::Sync),
            &mut |addr, size| self.alloc.free(addr, size, ino),
        ))?;
        self.zero_tail(inode)?;
        Ok(outcome)
    }

    /// Clear the bytes past the end of file in its last block so a later
    /// extension reads zeros there.
    #[expect(clippy::cast_possible_truncation)]
    fn zero_tail(&self, inode: &DiskInode) -> Result<()> {
        let within = self.geo.blkoff(inode.size);
        if within == 0 {
            return Ok(());
        }
        let lbn = self.geo.lblkno(inode.size);
        let io = FileIo::new(&self.alloc, self.live.as_ref());
        let Some(addr) = bmap(&io, inode, lbn)? else {
            return Ok(());
        };
        let span = self.geo.blksize(inode.size, lbn) as usize;
        let mut block = self.live.read(addr, span)?.into_inner();
        if block[within as usize..].iter().all(|&b| b == 0) {
            return Ok(());
        }
        block[within as usize..].fill(0);
        self.live.write(addr, &block, WriteMode::Async)
    }
}
