//! One snapshot file.
//!
//! A snapshot is a regular inode flagged [`SF_SNAPSHOT`] whose logical block
//! `n` stands for filesystem block `n`. Each slot below `numblks` holds a
//! [`SnapSlot`] in raw form. Past `numblks` the file stores its hint list:
//! a block count followed by the sorted logical blocks the snapshot owns or
//! that belong to a snapshot, all as 64-bit words.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ufs_block::{BlockDevice, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_inode::{BlockPointers, DeviceIndirect, SlotKind, Visit, lookup, set_slot, walk};
use ufs_ondisk::{DiskInode, Geometry};
use ufs_types::{BLK_SNAP, ByteOrder, FragNumber, InodeNumber, SF_SNAPSHOT, SnapSlot};

/// Listing entry for one live snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub ino: u64,
    /// Creation time, seconds since the epoch.
    pub created: i64,
    /// Position in creation order, oldest first.
    pub index: usize,
    /// Blocks holding preserved copies of live data.
    pub owned_blocks: u64,
    /// Fragments the snapshot file holds, indirect blocks included.
    pub frags: u64,
}

pub(crate) struct SnapState {
    pub inode: DiskInode,
    /// Sorted logical blocks this snapshot never copies.
    pub hints: Vec<u64>,
    /// `inode` differs from the on-disk copy.
    pub dirty: bool,
}

pub(crate) struct SnapshotFile {
    pub ino: InodeNumber,
    pub created: i64,
    pub state: Mutex<SnapState>,
}

impl SnapshotFile {
    pub fn new(ino: InodeNumber, inode: DiskInode, hints: Vec<u64>) -> Self {
        Self {
            ino,
            created: inode.ctime,
            state: Mutex::new(SnapState {
                inode,
                hints,
                dirty: false,
            }),
        }
    }
}

impl SnapState {
    #[must_use]
    pub fn hinted(&self, lbn: u64) -> bool {
        self.hints.binary_search(&lbn).is_ok()
    }

    /// Raw slot for `lbn`.
    pub fn slot(&self, io: &DeviceIndirect<'_>, lbn: u64) -> Result<u64> {
        lookup(io, &BlockPointers::from_inode(&self.inode), lbn)
    }

    /// Store a raw slot for `lbn`; the indirect path must exist.
    pub fn set(&mut self, io: &DeviceIndirect<'_>, lbn: u64, value: u64) -> Result<u64> {
        let mut ptrs = BlockPointers::from_inode(&self.inode);
        let old = set_slot(io, &mut ptrs, lbn, value)?;
        if ptrs != BlockPointers::from_inode(&self.inode) {
            ptrs.store(&mut self.inode);
            self.dirty = true;
        }
        Ok(old)
    }

    /// Record `lbn` as an owned copy at `addr`.
    pub fn own(&mut self, io: &DeviceIndirect<'_>, geo: &Geometry, lbn: u64, addr: FragNumber) -> Result<()> {
        self.set(io, lbn, addr.0)?;
        self.inode.blocks += u64::from(geo.frag);
        self.dirty = true;
        Ok(())
    }

    /// Every real address held by the snapshot file: indirect blocks,
    /// preserved copies and hint blocks.
    pub fn addresses(&self, io: &DeviceIndirect<'_>) -> Result<Vec<FragNumber>> {
        let mut ptrs = BlockPointers::from_inode(&self.inode);
        let mut out = Vec::new();
        walk(io, &mut ptrs, 0, &mut |slot| {
            if SnapSlot::is_real_address(slot.value) {
                out.push(FragNumber(slot.value));
            }
            Ok(Visit::Keep)
        })?;
        Ok(out)
    }

    /// Slots below `numblks` that hold a preserved copy.
    pub fn owned_blocks(&self, io: &DeviceIndirect<'_>, numblks: u64) -> Result<u64> {
        let mut ptrs = BlockPointers::from_inode(&self.inode);
        let mut owned = 0;
        walk(io, &mut ptrs, 0, &mut |slot| {
            Ok(match slot.kind {
                SlotKind::Data { lbn } if lbn < numblks => {
                    if SnapSlot::is_real_address(slot.value) {
                        owned += 1;
                    }
                    Visit::Keep
                }
                SlotKind::Data { .. } => Visit::Keep,
                SlotKind::Indirect { first_lbn, .. } if first_lbn >= numblks => Visit::Prune,
                SlotKind::Indirect { .. } => Visit::Keep,
            })
        })?;
        Ok(owned)
    }
}

/// Whether an inode is a live snapshot file.
#[must_use]
pub fn is_snapshot(inode: &DiskInode) -> bool {
    inode.is_allocated() && inode.flags & SF_SNAPSHOT != 0
}

/// Whether a raw slot keeps the block out of copy-on-write for good.
#[must_use]
pub fn is_settled(raw: u64) -> bool {
    raw == BLK_SNAP || SnapSlot::is_real_address(raw)
}

// ── Hint list ───────────────────────────────────────────────────────────────

/// Encode `hints` as whole blocks.
pub fn encode_hints(order: ByteOrder, bsize: usize, hints: &[u64]) -> Result<Vec<u8>> {
    let words = hints.len() + 1;
    let mut out = vec![0_u8; (words * 8).div_ceil(bsize) * bsize];
    let bad = |e: ufs_types::ParseError| UfsError::Format(e.to_string());
    order.write_u64(&mut out, 0, hints.len() as u64).map_err(bad)?;
    for (i, lbn) in hints.iter().enumerate() {
        order.write_u64(&mut out, (i + 1) * 8, *lbn).map_err(bad)?;
    }
    Ok(out)
}

/// Decode a hint list from the start of `bytes`; `block` is used for
/// error reporting.
pub fn decode_hints(order: ByteOrder, bytes: &[u8], block: u64) -> Result<Vec<u64>> {
    let bad = |e: ufs_types::ParseError| UfsError::corruption(block, e.to_string());
    let count = order.read_u64(bytes, 0).map_err(bad)?;
    let count = usize::try_from(count)
        .ok()
        .filter(|n| (n + 1) * 8 <= bytes.len())
        .ok_or_else(|| UfsError::corruption(block, format!("hint count {count} overruns the list")))?;
    let hints = (1..=count)
        .map(|i| order.read_u64(bytes, i * 8).map_err(bad))
        .collect::<Result<Vec<_>>>()?;
    if hints.windows(2).any(|w| w[0] >= w[1]) {
        return Err(UfsError::corruption(block, "hint list is not sorted"));
    }
    Ok(hints)
}

/// Read `len` bytes of snapshot file content starting at logical block
/// `first`, following the file's own pointers.
pub(crate) fn read_file_blocks(
    raw: &dyn BlockDevice,
    io: &DeviceIndirect<'_>,
    geo: &Geometry,
    inode: &DiskInode,
    first: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let ptrs = BlockPointers::from_inode(inode);
    let mut out = Vec::with_capacity(len);
    let mut lbn = first;
    while out.len() < len {
        let slot = lookup(io, &ptrs, lbn)?;
        if SnapSlot::is_real_address(slot) {
            out.extend_from_slice(raw.read(FragNumber(slot), geo.bsize_usize())?.as_slice());
        } else {
            return Err(UfsError::corruption(
                0,
                format!("snapshot hint block {lbn} is not allocated"),
            ));
        }
        lbn += 1;
    }
    Ok(out)
}

/// Write whole blocks of snapshot content at logical block `first` onwards,
/// allocating through `alloc_block` where needed. Returns the fragments
/// added to the file.
pub(crate) fn write_file_blocks(
    raw: &dyn BlockDevice,
    io: &DeviceIndirect<'_>,
    geo: &Geometry,
    inode: &mut DiskInode,
    first: u64,
    bytes: &[u8],
    alloc_block: &mut dyn FnMut() -> Result<FragNumber>,
) -> Result<u64> {
    let mut ptrs = BlockPointers::from_inode(inode);
    let mut added = 0;
    for (i, chunk) in bytes.chunks(geo.bsize_usize()).enumerate() {
        let lbn = first + i as u64;
        added += ufs_inode::ensure_path(io, &mut ptrs, lbn, alloc_block)?.len() as u64 * u64::from(geo.frag);
        let addr = match lookup(io, &ptrs, lbn)? {
            raw_slot if SnapSlot::is_real_address(raw_slot) => FragNumber(raw_slot),
            _ => {
                let fresh = alloc_block()?;
                set_slot(io, &mut ptrs, lbn, fresh.0)?;
                added += u64::from(geo.frag);
                fresh
            }
        };
        raw.write(addr, chunk, WriteMode::Sync)?;
    }
    ptrs.store(inode);
    inode.blocks += added;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_survive_encoding_and_pad_to_blocks() {
        let hints = vec![0, 1, 9, 40, 411];
        let bytes = encode_hints(ByteOrder::Big, 4096, &hints).expect("encode");
        assert_eq!(bytes.len(), 4096);
        assert_eq!(decode_hints(ByteOrder::Big, &bytes, 7).expect("decode"), hints);

        let many: Vec<u64> = (0..600).collect();
        let bytes = encode_hints(ByteOrder::Little, 4096, &many).expect("encode");
        assert_eq!(bytes.len(), 8192);
        assert_eq!(decode_hints(ByteOrder::Little, &bytes, 7).expect("decode"), many);
    }

    #[test]
    fn damaged_hint_lists_are_corruption() {
        let mut bytes = encode_hints(ByteOrder::Little, 4096, &[3, 5]).expect("encode");
        bytes[0] = 0xFF;
        assert!(matches!(
            decode_hints(ByteOrder::Little, &bytes, 7),
            Err(UfsError::Corruption { block: 7, .. })
        ));

        let unsorted = encode_hints(ByteOrder::Little, 4096, &[5, 3]).expect("encode");
        assert!(decode_hints(ByteOrder::Little, &unsorted, 7).is_err());
    }

    #[test]
    fn settled_slots() {
        assert!(!is_settled(0));
        assert!(!is_settled(ufs_types::BLK_NOCOPY));
        assert!(is_settled(BLK_SNAP));
        assert!(is_settled(4096));
    }
}
