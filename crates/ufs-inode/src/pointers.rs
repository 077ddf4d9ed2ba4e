//! Block-pointer trees.
//!
//! An inode holds [`NDADDR`] direct pointers and [`NIADDR`] indirect roots
//! (single, double, triple). Indirect blocks are arrays of `nindir` 64-bit
//! pointers. Slot value `0` is a hole; snapshot trees additionally store the
//! sentinels from [`ufs_types::SnapSlot`] in data slots.
//!
//! Everything that traverses a tree goes through [`walk`], which hands each
//! slot to a visitor that may keep it, replace it, or prune below it.

use tracing::trace;
use ufs_block::{BlockDevice, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_ondisk::{DiskInode, Geometry, live_error};
use ufs_types::{ByteOrder, FragNumber, NDADDR, NIADDR, ParseError, SnapSlot};

/// The pointer part of an inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockPointers {
    pub db: [u64; NDADDR],
    pub ib: [u64; NIADDR],
}

impl BlockPointers {
    #[must_use]
    pub fn from_inode(inode: &DiskInode) -> Self {
        Self {
            db: inode.db,
            ib: inode.ib,
        }
    }

    pub fn store(&self, inode: &mut DiskInode) {
        inode.db = self.db;
        inode.ib = self.ib;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.db.iter().chain(&self.ib).all(|&p| p == 0)
    }
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// Where the pointer for one logical block lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPath {
    Direct(usize),
    /// `root` indexes the inode's indirect roots (`0` = single); `offsets[i]`
    /// is the slot taken in the indirect block at level `i` below the root.
    Indirect { root: usize, offsets: Vec<usize> },
}

/// Data blocks below one pointer with `depth` indirect levels.
#[must_use]
pub fn span(geo: &Geometry, depth: u32) -> u64 {
    geo.nindir().saturating_pow(depth)
}

/// First logical block mapped through indirect root `root`.
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn root_first_lbn(geo: &Geometry, root: usize) -> u64 {
    (1..=root as u32).fold(NDADDR as u64, |acc, depth| acc.saturating_add(span(geo, depth)))
}

/// Resolve logical block `lbn` to its pointer path.
#[expect(clippy::cast_possible_truncation)]
pub fn block_path(geo: &Geometry, lbn: u64) -> Result<BlockPath> {
    if lbn < NDADDR as u64 {
        return Ok(BlockPath::Direct(lbn as usize));
    }
    let nindir = geo.nindir();
    let mut rel = lbn - NDADDR as u64;
    for root in 0..NIADDR {
        let depth = root as u32 + 1;
        let covered = span(geo, depth);
        if rel < covered {
            let mut offsets = vec![0; depth as usize];
            let mut rest = rel;
            for slot in offsets.iter_mut().rev() {
                *slot = (rest % nindir) as usize;
                rest /= nindir;
            }
            return Ok(BlockPath::Indirect { root, offsets });
        }
        rel -= covered;
    }
    Err(UfsError::InvalidArgument(format!(
        "logical block {lbn} beyond the triple-indirect range"
    )))
}

// ── Indirect blocks ─────────────────────────────────────────────────────────

/// Decoded indirect block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectBlock {
    entries: Vec<u64>,
}

impl IndirectBlock {
    #[must_use]
    pub fn zeroed(nindir: usize) -> Self {
        Self {
            entries: vec![0; nindir],
        }
    }

    pub fn parse(order: ByteOrder, bytes: &[u8], nindir: usize) -> std::result::Result<Self, ParseError> {
        let entries = (0..nindir)
            .map(|i| order.read_u64(bytes, i * 8))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn encode(&self, order: ByteOrder) -> std::result::Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; self.entries.len() * 8];
        for (i, entry) in self.entries.iter().enumerate() {
            order.write_u64(&mut out, i * 8, *entry)?;
        }
        Ok(out)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        self.entries.get(index).copied().unwrap_or(0)
    }

    /// Store `value` at `index`, returning what was there.
    pub fn set(&mut self, index: usize, value: u64) -> Result<u64> {
        let slot = self.entries.get_mut(index).ok_or_else(|| {
            UfsError::InvalidArgument(format!("indirect slot {index} out of range"))
        })?;
        Ok(std::mem::replace(slot, value))
    }

    #[must_use]
    pub fn entries(&self) -> &[u64] {
        &self.entries
    }
}

/// Storage for indirect blocks.
pub trait IndirectIo {
    fn geometry(&self) -> &Geometry;

    fn read_indirect(&self, addr: FragNumber) -> Result<IndirectBlock>;

    fn write_indirect(&self, addr: FragNumber, block: &IndirectBlock) -> Result<()>;

    /// Read-modify-write one indirect block. `edit` returns whether it changed
    /// anything; unchanged blocks are not written.
    fn update_indirect(
        &self,
        addr: FragNumber,
        edit: &mut dyn FnMut(&mut IndirectBlock) -> Result<bool>,
    ) -> Result<()> {
        let mut block = self.read_indirect(addr)?;
        if edit(&mut block)? {
            self.write_indirect(addr, &block)?;
        }
        Ok(())
    }
}

/// Indirect blocks stored on a [`BlockDevice`].
///
/// Updates hold the device's buffer lock for the block.
pub struct DeviceIndirect<'a> {
    dev: &'a dyn BlockDevice,
    geo: &'a Geometry,
    mode: WriteMode,
}

impl<'a> DeviceIndirect<'a> {
    pub fn new(dev: &'a dyn BlockDevice, geo: &'a Geometry, mode: WriteMode) -> Self {
        Self { dev, geo, mode }
    }
}

impl IndirectIo for DeviceIndirect<'_> {
    fn geometry(&self) -> &Geometry {
        self.geo
    }

    #[expect(clippy::cast_possible_truncation)]
    fn read_indirect(&self, addr: FragNumber) -> Result<IndirectBlock> {
        let buf = self.dev.read(addr, self.geo.bsize_usize())?;
        IndirectBlock::parse(self.geo.order, buf.as_slice(), self.geo.nindir() as usize)
            .map_err(|e| live_error(addr.0, e))
    }

    fn write_indirect(&self, addr: FragNumber, block: &IndirectBlock) -> Result<()> {
        let bytes = block.encode(self.geo.order).map_err(|e| live_error(addr.0, e))?;
        self.dev.write(addr, &bytes, self.mode)
    }

    fn update_indirect(
        &self,
        addr: FragNumber,
        edit: &mut dyn FnMut(&mut IndirectBlock) -> Result<bool>,
    ) -> Result<()> {
        let _guard = self.dev.buffer_locks().lock(addr.0);
        let mut block = self.read_indirect(addr)?;
        if edit(&mut block)? {
            self.write_indirect(addr, &block)?;
        }
        Ok(())
    }
}

// ── Lookup and update ───────────────────────────────────────────────────────

/// The indirect block holding the pointer for `lbn` and the slot within it,
/// or `None` for direct blocks and paths through a hole.
pub fn leaf_of(io: &dyn IndirectIo, ptrs: &BlockPointers, lbn: u64) -> Result<Option<(FragNumber, usize)>> {
    let BlockPath::Indirect { root, offsets } = block_path(io.geometry(), lbn)? else {
        return Ok(None);
    };
    let mut addr = ptrs.ib[root];
    let Some((&last, upper)) = offsets.split_last() else {
        return Ok(None);
    };
    for &off in upper {
        if !SnapSlot::is_real_address(addr) {
            return Ok(None);
        }
        addr = io.read_indirect(FragNumber(addr))?.get(off);
    }
    if !SnapSlot::is_real_address(addr) {
        return Ok(None);
    }
    Ok(Some((FragNumber(addr), last)))
}

/// Raw slot value for `lbn`; `0` when the path runs through a hole.
pub fn lookup(io: &dyn IndirectIo, ptrs: &BlockPointers, lbn: u64) -> Result<u64> {
    if let BlockPath::Direct(i) = block_path(io.geometry(), lbn)? {
        return Ok(ptrs.db[i]);
    }
    match leaf_of(io, ptrs, lbn)? {
        Some((leaf, off)) => Ok(io.read_indirect(leaf)?.get(off)),
        None => Ok(0),
    }
}

/// Store `value` in the slot for `lbn` and return the previous value.
///
/// Every indirect block on the path must already exist.
pub fn set_slot(io: &dyn IndirectIo, ptrs: &mut BlockPointers, lbn: u64, value: u64) -> Result<u64> {
    if let BlockPath::Direct(i) = block_path(io.geometry(), lbn)? {
        return Ok(std::mem::replace(&mut ptrs.db[i], value));
    }
    let Some((leaf, off)) = leaf_of(io, ptrs, lbn)? else {
        return Err(UfsError::invariant(
            0,
            format!("no indirect block maps logical block {lbn}"),
        ));
    };
    let mut old = 0;
    io.update_indirect(leaf, &mut |block| {
        old = block.set(off, value)?;
        Ok(old != value)
    })?;
    Ok(old)
}

/// Create every missing indirect block on the path to `lbn`, top down.
///
/// Each new block is written zeroed before the pointer to it is stored.
/// Returns the addresses allocated.
#[expect(clippy::cast_possible_truncation)]
pub fn ensure_path(
    io: &dyn IndirectIo,
    ptrs: &mut BlockPointers,
    lbn: u64,
    alloc: &mut dyn FnMut() -> Result<FragNumber>,
) -> Result<Vec<FragNumber>> {
    let BlockPath::Indirect { root, offsets } = block_path(io.geometry(), lbn)? else {
        return Ok(Vec::new());
    };
    let nindir = io.geometry().nindir() as usize;
    let mut created = Vec::new();

    let mut addr = ptrs.ib[root];
    if addr == 0 {
        let fresh = alloc()?;
        io.write_indirect(fresh, &IndirectBlock::zeroed(nindir))?;
        ptrs.ib[root] = fresh.0;
        created.push(fresh);
        addr = fresh.0;
    }
    for &off in &offsets[..offsets.len() - 1] {
        let parent = FragNumber(addr);
        let child = io.read_indirect(parent)?.get(off);
        if child != 0 {
            addr = child;
            continue;
        }
        let fresh = alloc()?;
        io.write_indirect(fresh, &IndirectBlock::zeroed(nindir))?;
        io.update_indirect(parent, &mut |block| {
            block.set(off, fresh.0)?;
            Ok(true)
        })?;
        created.push(fresh);
        addr = fresh.0;
    }
    if !created.is_empty() {
        trace!(lbn, created = created.len(), "indirect path allocated");
    }
    Ok(created)
}

// ── Traversal ───────────────────────────────────────────────────────────────

/// What a slot handed to a [`walk`] visitor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Data block `lbn`.
    Data { lbn: u64 },
    /// Indirect block with `depth` levels of pointers (1 = its entries are
    /// data pointers) mapping logical blocks from `first_lbn`.
    Indirect { depth: u32, first_lbn: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub kind: SlotKind,
    pub value: u64,
}

/// Visitor decision for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Leave the slot; descend into it if it is a real indirect block.
    Keep,
    /// Overwrite the slot and do not descend.
    Replace(u64),
    /// Leave the slot and do not descend.
    Prune,
}

/// Visit every slot mapping logical blocks `from_lbn..`, parents before
/// children. Indirect blocks whose slots were replaced are written back
/// through [`IndirectIo::update_indirect`]; `ptrs` is updated in memory.
///
/// Returns the number of slots replaced.
#[expect(clippy::cast_possible_truncation)]
pub fn walk(
    io: &dyn IndirectIo,
    ptrs: &mut BlockPointers,
    from_lbn: u64,
    visitor: &mut dyn FnMut(Slot) -> Result<Visit>,
) -> Result<u64> {
    let geo = *io.geometry();
    let mut replaced = 0;

    for (lbn, slot) in ptrs.db.iter_mut().enumerate().skip(from_lbn.min(NDADDR as u64) as usize) {
        let kind = SlotKind::Data { lbn: lbn as u64 };
        if let Visit::Replace(value) = visitor(Slot { kind, value: *slot })? {
            *slot = value;
            replaced += 1;
        }
    }

    for root in 0..NIADDR {
        let depth = root as u32 + 1;
        let first_lbn = root_first_lbn(&geo, root);
        if first_lbn.saturating_add(span(&geo, depth)) <= from_lbn {
            continue;
        }
        let kind = SlotKind::Indirect { depth, first_lbn };
        match visitor(Slot {
            kind,
            value: ptrs.ib[root],
        })? {
            Visit::Replace(value) => {
                ptrs.ib[root] = value;
                replaced += 1;
            }
            Visit::Keep if SnapSlot::is_real_address(ptrs.ib[root]) => {
                let addr = FragNumber(ptrs.ib[root]);
                replaced += walk_indirect(io, addr, depth, first_lbn, from_lbn, visitor)?;
            }
            Visit::Keep | Visit::Prune => {}
        }
    }
    Ok(replaced)
}

fn walk_indirect(
    io: &dyn IndirectIo,
    addr: FragNumber,
    depth: u32,
    first_lbn: u64,
    from_lbn: u64,
    visitor: &mut dyn FnMut(Slot) -> Result<Visit>,
) -> Result<u64> {
    let geo = *io.geometry();
    let block = io.read_indirect(addr)?;
    let child_span = span(&geo, depth - 1);
    let mut edits = Vec::new();
    let mut replaced = 0;

    for (i, &value) in block.entries().iter().enumerate() {
        let child_first = first_lbn + i as u64 * child_span;
        if child_first + child_span <= from_lbn {
            continue;
        }
        let kind = if depth == 1 {
            SlotKind::Data { lbn: child_first }
        } else {
            SlotKind::Indirect {
                depth: depth - 1,
                first_lbn: child_first,
            }
        };
        match visitor(Slot { kind, value })? {
            Visit::Replace(new) => edits.push((i, new)),
            Visit::Keep if depth > 1 && SnapSlot::is_real_address(value) => {
                replaced += walk_indirect(io, FragNumber(value), depth - 1, child_first, from_lbn, visitor)?;
            }
            Visit::Keep | Visit::Prune => {}
        }
    }

    if !edits.is_empty() {
        io.update_indirect(addr, &mut |blk| {
            for &(i, value) in &edits {
                blk.set(i, value)?;
            }
            Ok(true)
        })?;
        replaced += edits.len() as u64;
    }
    Ok(replaced)
}

/// Free the indirect block at `addr` (with `depth` levels below it) and
/// everything it points to, children before parents. Sentinel entries are
/// skipped. Returns the fragments released.
pub fn free_subtree(
    io: &dyn IndirectIo,
    addr: FragNumber,
    depth: u32,
    free: &mut dyn FnMut(FragNumber, u32) -> Result<()>,
) -> Result<u64> {
    let geo = *io.geometry();
    let block = io.read_indirect(addr)?;
    let mut released = 0;
    for &entry in block.entries().iter().rev() {
        if !SnapSlot::is_real_address(entry) {
            continue;
        }
        if depth > 1 {
            released += free_subtree(io, FragNumber(entry), depth - 1, free)?;
        } else {
            free(FragNumber(entry), geo.bsize)?;
            released += u64::from(geo.frag);
        }
    }
    free(addr, geo.bsize)?;
    Ok(released + u64::from(geo.frag))
}
