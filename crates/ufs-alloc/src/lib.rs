#![forbid(unsafe_code)]
//! Block, fragment and inode allocation over cylinder groups.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit and free-run operations ([`bitmap`]).
//! 2. **Group**: one group's allocate/extend/free with incremental fragment
//!    and cluster histograms ([`group::CgView`]).
//! 3. **Policy**: the three-tier group search shared by every allocation
//!    kind, directory spreading, sequential block preference ([`policy`]).
//! 4. **Allocator**: per-group locks, lazy group loading, write-back, and
//!    the filesystem-wide summary ([`Allocator`]).
//!
//! Lock order is group lock, then summary lock, then the generation RNG.
//! A group block is written back before its lock is released.

pub mod bitmap;
pub mod group;
pub mod policy;

pub use group::{
    CgView, CsDelta, GroupCount, InodePick, MAX_CONTIGSUM, init_group, rebuild_cluster_summary,
    recount,
};
pub use policy::{AllocPolicy, AllocStrategy, SummaryView, dirpref, hashalloc};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use ufs_block::{BlockDevice, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_ondisk::{Csum, CsumTotal, CylinderGroup, DiskInode, Geometry, INODE_SIZE, Superblock, live_error};
use ufs_types::{FragNumber, GroupNumber, InodeNumber, NDADDR, S_IFDIR, S_IFMT, SnapSlot};

/// Inodes below this number are never handed out.
pub const FIRST_USER_INODE: u64 = InodeNumber::ROOT.0;

/// Consulted before a block returns to the free pool.
///
/// Snapshots install one so they can adopt blocks they still need.
pub trait FreeIntercept: Send + Sync {
    /// Return `true` when the fragments at `addr` were taken over and must
    /// not be freed.
    fn claim_freed(&self, addr: FragNumber, size: u32, ino: InodeNumber) -> Result<bool>;
}

/// Caller context for a block allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocHint {
    /// Preferred fragment address, usually from [`Allocator::blkpref`].
    pub pref: Option<FragNumber>,
    /// May dip into the `minfree` reserve.
    pub privileged: bool,
}

/// Result of [`Allocator::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub groups_checked: u32,
    pub unreadable_groups: Vec<u32>,
    pub problems: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unreadable_groups.is_empty() && self.problems.is_empty()
    }
}

enum GroupState {
    Unloaded,
    Loaded(CylinderGroup),
    /// Failed to parse on the last attempt; retried on next use.
    Corrupt,
}

struct GroupSlot {
    state: GroupState,
    /// Mutated since the last [`Allocator::copy_group`].
    changed: bool,
}

struct Summary {
    sb: Superblock,
    contigdirs: Vec<u8>,
    dirty: bool,
}

/// Group `cg`'s summary entry and the totals with `delta` applied, or
/// `None` when nothing moves.
fn fold(sum: &Summary, cg: GroupNumber, delta: CsDelta, block: u64) -> Result<Option<(Csum, CsumTotal)>> {
    if delta.is_zero() {
        return Ok(None);
    }
    let mut cs = sum.sb.csum[cg.0 as usize];
    let mut total = sum.sb.cstotal;
    delta.apply(&mut cs, block)?;
    delta.apply_total(&mut total, block)?;
    Ok(Some((cs, total)))
}

/// Allocator for one mounted filesystem.
pub struct Allocator {
    geo: Geometry,
    dev: Arc<dyn BlockDevice>,
    policy: AllocPolicy,
    contigsumsize: u32,
    /// Data fragments on the filesystem.
    dsize: u64,
    summary: Mutex<Summary>,
    groups: Vec<Mutex<GroupSlot>>,
    rng: Mutex<StdRng>,
    free_hook: RwLock<Option<Arc<dyn FreeIntercept>>>,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("geo", &self.geo)
            .field("policy", &self.policy)
            .field("dsize", &self.dsize)
            .finish_non_exhaustive()
    }
}

fn write_mode(policy: &AllocPolicy) -> WriteMode {
    if policy.sync_commit {
        WriteMode::Sync
    } else {
        WriteMode::Delayed
    }
}

impl Allocator {
    /// Lay out every cylinder group on `dev` and return the matching
    /// superblock (also written to every group's superblock slot).
    ///
    /// Inodes below [`FIRST_USER_INODE`] are reserved.
    pub fn format(geo: &Geometry, dev: &dyn BlockDevice, policy: &AllocPolicy) -> Result<Superblock> {
        let contigsumsize = policy.maxcontig.min(MAX_CONTIGSUM);
        let mut sb = Superblock::new(geo);
        policy.record(&mut sb);

        for cg in (0..geo.ncg).map(GroupNumber) {
            let mut group = init_group(geo, cg, contigsumsize);
            if cg.0 == 0 {
                let mut view = CgView::new(geo, &mut group, contigsumsize);
                for index in 0..u32::try_from(FIRST_USER_INODE).unwrap_or(2) {
                    view.claim_inode(&InodePick { index, init: None }, false)?;
                }
            }
            sb.csum[cg.0 as usize] = group.cs;
            let addr = geo.cgtod(cg);
            let block = group.to_block(geo).map_err(|e| live_error(addr.0, e))?;
            dev.write(addr, &block, WriteMode::Sync)?;
        }
        sb.cstotal = CsumTotal::from_groups(&sb.csum);

        let block = sb.to_block().map_err(|e| live_error(0, e))?;
        for cg in (0..geo.ncg).map(GroupNumber) {
            dev.write(geo.cgsblock(cg), &block, WriteMode::Sync)?;
        }
        info!(
            ncg = geo.ncg,
            bsize = geo.bsize,
            fsize = geo.fsize,
            nbfree = sb.cstotal.nbfree,
            "formatted cylinder groups"
        );
        Ok(sb)
    }

    /// Attach to a mounted filesystem. Groups are read on first use.
    pub fn open(
        geo: Geometry,
        dev: Arc<dyn BlockDevice>,
        sb: Superblock,
        policy: AllocPolicy,
    ) -> Result<Self> {
        if sb.csum.len() != geo.ncg as usize {
            return Err(UfsError::InvalidGeometry(format!(
                "superblock has {} group summaries for {} groups",
                sb.csum.len(),
                geo.ncg
            )));
        }
        let dsize = (0..geo.ncg)
            .map(|cg| u64::from(geo.cg_frags(GroupNumber(cg)) - geo.dblkno))
            .sum();
        let rng = match policy.dirpref_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let groups = (0..geo.ncg)
            .map(|_| {
                Mutex::new(GroupSlot {
                    state: GroupState::Unloaded,
                    changed: false,
                })
            })
            .collect();
        Ok(Self {
            geo,
            dev,
            contigsumsize: sb.maxcontig.min(MAX_CONTIGSUM),
            dsize,
            summary: Mutex::new(Summary {
                contigdirs: vec![0; geo.ncg as usize],
                sb,
                dirty: false,
            }),
            groups,
            rng: Mutex::new(rng),
            free_hook: RwLock::new(None),
            policy,
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[must_use]
    pub fn policy(&self) -> &AllocPolicy {
        &self.policy
    }

    /// The raw device cylinder groups are written to.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    #[must_use]
    pub fn data_frags(&self) -> u64 {
        self.dsize
    }

    // ── Group access ────────────────────────────────────────────────────────

    fn slot(&self, cg: GroupNumber) -> Result<&Mutex<GroupSlot>> {
        self.groups
            .get(cg.0 as usize)
            .ok_or_else(|| UfsError::InvalidArgument(format!("group {cg} out of range")))
    }

    /// Load group `cg` into `slot`; `None` when its block is damaged.
    fn load<'a>(&self, slot: &'a mut GroupSlot, cg: GroupNumber) -> Result<Option<&'a mut CylinderGroup>> {
        if !matches!(slot.state, GroupState::Loaded(_)) {
            let addr = self.geo.cgtod(cg);
            let buf = self.dev.read(addr, self.geo.bsize_usize())?;
            slot.state = match CylinderGroup::parse(&self.geo, buf.as_slice()) {
                Ok(parsed) if parsed.cgx == cg.0 => GroupState::Loaded(parsed),
                Ok(parsed) => {
                    warn!(group = cg.0, found = parsed.cgx, "cylinder group index mismatch; treating as full");
                    GroupState::Corrupt
                }
                Err(err) => {
                    warn!(group = cg.0, block = addr.0, error = %err, "bad cylinder group; treating as full");
                    GroupState::Corrupt
                }
            };
        }
        match &mut slot.state {
            GroupState::Loaded(group) => Ok(Some(group)),
            GroupState::Unloaded | GroupState::Corrupt => Ok(None),
        }
    }

    fn write_group(&self, group: &CylinderGroup) -> Result<()> {
        let addr = self.geo.cgtod(GroupNumber(group.cgx));
        let block = group.to_block(&self.geo).map_err(|e| live_error(addr.0, e))?;
        self.dev.write(addr, &block, write_mode(&self.policy))
    }

    /// Run `op` on group `cg` under its lock, write the group back, and fold
    /// the counter change into the summary.
    ///
    /// `Ok(None)` means the group could not help: the op declined, or the
    /// group block is damaged or inconsistent.
    fn mutate_group<T>(
        &self,
        cg: GroupNumber,
        op: impl FnOnce(&mut CgView<'_>) -> Result<Option<(T, CsDelta)>>,
    ) -> Result<Option<T>> {
        let mut slot = self.slot(cg)?.lock();
        let Some(group) = self.load(&mut slot, cg)? else {
            return Ok(None);
        };
        let mut view = CgView::new(&self.geo, group, self.contigsumsize);
        let outcome = match op(&mut view) {
            Ok(outcome) => outcome,
            Err(err @ UfsError::Corruption { .. }) => {
                warn!(group = cg.0, error = %err, "inconsistent cylinder group; skipping");
                slot.state = GroupState::Unloaded;
                return Ok(None);
            }
            Err(err) => {
                if err.is_fatal() {
                    error!(group = cg.0, error = %err, "allocator invariant violated");
                }
                // The op may have stopped halfway; reread the group next time.
                slot.state = GroupState::Unloaded;
                return Err(err);
            }
        };
        let Some((value, delta)) = outcome else {
            return Ok(None);
        };
        // The header and its summary entry change together under the group
        // lock.
        let mut sum = self.summary.lock();
        let folded = match fold(&sum, cg, delta, self.geo.cgtod(cg).0) {
            Ok(folded) => folded,
            Err(err) => {
                error!(group = cg.0, error = %err, "summary counters out of step with group");
                slot.state = GroupState::Unloaded;
                return Err(err);
            }
        };
        if let Err(err) = self.write_group(group) {
            // Drop the unwritten image so the next use rereads the disk.
            slot.state = GroupState::Unloaded;
            return Err(err);
        }
        if let Some((cs, total)) = folded {
            sum.sb.csum[cg.0 as usize] = cs;
            sum.sb.cstotal = total;
            sum.dirty = true;
        }
        drop(sum);
        slot.changed = true;
        drop(slot);
        Ok(Some(value))
    }

    fn frags_for(&self, size: u32) -> Result<u32> {
        if size == 0 || size > self.geo.bsize || size % self.geo.fsize != 0 {
            return Err(UfsError::InvalidArgument(format!(
                "allocation size {size} is not a multiple of {} up to {}",
                self.geo.fsize, self.geo.bsize
            )));
        }
        Ok(size / self.geo.fsize)
    }

    /// Free fragments beyond the reserve (negative once inside it).
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub fn freespace(&self, reserve_percent: u32) -> i64 {
        let total = self.summary.lock().sb.cstotal;
        let free = total.nbfree * u64::from(self.geo.frag) + total.nffree;
        free as i64 - (self.dsize * u64::from(reserve_percent) / 100) as i64
    }

    fn check_reserve(&self, frags: u32, privileged: bool) -> Result<()> {
        if !privileged && self.freespace(self.policy.minfree_percent) < i64::from(frags) {
            warn!(frags, "allocation refused: free-space reserve reached");
            return Err(UfsError::NoSpace);
        }
        Ok(())
    }

    // ── Blocks and fragments ────────────────────────────────────────────────

    /// Allocate `size` bytes (a multiple of the fragment size, at most one
    /// block) for inode `ino`.
    pub fn alloc(&self, ino: InodeNumber, size: u32, hint: AllocHint) -> Result<FragNumber> {
        let frags = self.frags_for(size)?;
        self.check_reserve(frags, hint.privileged)?;

        let pref = hint.pref.filter(|p| p.0 < self.geo.size);
        let start = pref.map_or_else(|| self.geo.ino_to_cg(ino), |p| self.geo.dtog(p));
        let strategy = if frags == self.geo.frag {
            AllocStrategy::Block
        } else {
            AllocStrategy::Fragment { frags }
        };
        let found = hashalloc(self.geo.ncg, start, |cg, first| {
            self.try_group(strategy, cg, if first { pref.map(|p| p.0) } else { None })
        })?;
        match found {
            Some(addr) => {
                debug!(ino = ino.0, frag = addr, frags, "allocated");
                Ok(FragNumber(addr))
            }
            None => {
                warn!(ino = ino.0, size, "filesystem full");
                Err(UfsError::NoSpace)
            }
        }
    }

    /// Try to satisfy `strategy` from group `cg`.
    ///
    /// `pref` is a fragment address for block strategies and an inode number
    /// for inode allocation; it is ignored unless it lies in `cg`. Returns the
    /// address or inode number claimed.
    pub fn try_group(&self, strategy: AllocStrategy, cg: GroupNumber, pref: Option<u64>) -> Result<Option<u64>> {
        let base = self.geo.cgbase(cg).0;
        match strategy {
            AllocStrategy::Block | AllocStrategy::Fragment { .. } => {
                let rel = pref
                    .map(FragNumber)
                    .filter(|p| self.geo.dtog(*p) == cg)
                    .map(|p| self.geo.dtogd(p));
                let found = self.mutate_group(cg, |view| match strategy {
                    AllocStrategy::Fragment { frags } => view.alloc(rel, frags),
                    _ => view.alloc_block(rel),
                })?;
                Ok(found.map(|bno| base + u64::from(bno)))
            }
            AllocStrategy::Inode { is_dir } => {
                let rel = pref
                    .map(InodeNumber)
                    .filter(|i| self.geo.is_valid_ino(*i) && self.geo.ino_to_cg(*i) == cg)
                    .map(|i| self.geo.ino_index(i));
                let found = self.mutate_group(cg, |view| {
                    let Some(pick) = view.pick_inode(rel) else {
                        return Ok(None);
                    };
                    if let Some(range) = &pick.init {
                        self.init_inode_blocks(cg, range)?;
                    }
                    let delta = view.claim_inode(&pick, is_dir)?;
                    Ok(Some((pick.index, delta)))
                })?;
                Ok(found.map(|index| self.geo.make_ino(cg, index).0))
            }
        }
    }

    /// Grow the allocation at `addr` from `osize` to `nsize` bytes without
    /// moving it. `false` when the following fragments are taken or the
    /// block boundary would be crossed.
    pub fn extend_in_place(&self, addr: FragNumber, osize: u32, nsize: u32, privileged: bool) -> Result<bool> {
        let ofrags = self.frags_for(osize)?;
        let nfrags = self.frags_for(nsize)?;
        if !self.geo.is_data_range(addr, u64::from(ofrags)) {
            return Err(UfsError::invariant(addr.0, "extending a non-data address"));
        }
        self.check_reserve(nfrags.saturating_sub(ofrags), privileged)?;
        let cg = self.geo.dtog(addr);
        let bprev = self.geo.dtogd(addr);
        let done = self.mutate_group(cg, |view| {
            Ok(view.extend(bprev, ofrags, nfrags)?.map(|delta| ((), delta)))
        })?;
        trace!(frag = addr.0, ofrags, nfrags, extended = done.is_some(), "extend in place");
        Ok(done.is_some())
    }

    /// Release `size` bytes at `addr`, giving a registered
    /// [`FreeIntercept`] first refusal.
    pub fn free(&self, addr: FragNumber, size: u32, ino: InodeNumber) -> Result<()> {
        let frags = self.frags_for(size)?;
        if !self.geo.is_data_range(addr, u64::from(frags)) {
            error!(frag = addr.0, size, ino = ino.0, "free of non-data address");
            return Err(UfsError::invariant(addr.0, format!("bad free of {size} bytes")));
        }
        let hook = self.free_hook.read().clone();
        if let Some(hook) = hook {
            if hook.claim_freed(addr, size, ino)? {
                debug!(frag = addr.0, size, ino = ino.0, "free claimed by snapshot");
                return Ok(());
            }
        }
        self.free_bypass(addr, size)
    }

    /// Release `size` bytes at `addr` straight to the bitmaps.
    pub fn free_bypass(&self, addr: FragNumber, size: u32) -> Result<()> {
        let frags = self.frags_for(size)?;
        let cg = self.geo.dtog(addr);
        let bno = self.geo.dtogd(addr);
        let done = self.mutate_group(cg, |view| Ok(Some(((), view.free(bno, frags)?))))?;
        if done.is_none() {
            return Err(UfsError::corruption(
                self.geo.cgtod(cg).0,
                "cannot free into an unreadable cylinder group",
            ));
        }
        trace!(frag = addr.0, frags, "freed");
        Ok(())
    }

    // ── Inodes ──────────────────────────────────────────────────────────────

    /// Allocate an inode of type `mode` for a new entry under `parent`.
    pub fn valloc(&self, parent: InodeNumber, mode: u16) -> Result<InodeNumber> {
        let is_dir = mode & S_IFMT == S_IFDIR;
        let (start, pref) = if is_dir {
            let cg = self.dirpref(parent);
            (cg, self.geo.make_ino(cg, 0))
        } else {
            (self.geo.ino_to_cg(parent), parent)
        };
        let strategy = AllocStrategy::Inode { is_dir };
        let found = hashalloc(self.geo.ncg, start, |cg, first| {
            self.try_group(strategy, cg, first.then_some(pref.0))
        })?;
        let Some(ino) = found.map(InodeNumber) else {
            warn!(parent = parent.0, "out of inodes");
            return Err(UfsError::NoSpace);
        };

        let cg = self.geo.ino_to_cg(ino).0 as usize;
        let mut sum = self.summary.lock();
        let contig = &mut sum.contigdirs[cg];
        if is_dir {
            *contig = contig.saturating_add(1);
        } else {
            *contig = contig.saturating_sub(1);
        }
        drop(sum);
        debug!(ino = ino.0, parent = parent.0, is_dir, "allocated inode");
        Ok(ino)
    }

    /// Mark a specific inode in use (format-time root and similar).
    pub fn claim_inode(&self, ino: InodeNumber, is_dir: bool) -> Result<()> {
        if !self.geo.is_valid_ino(ino) {
            return Err(UfsError::InvalidArgument(format!("inode {ino} out of range")));
        }
        let cg = self.geo.ino_to_cg(ino);
        let index = self.geo.ino_index(ino);
        let done = self.mutate_group(cg, |view| {
            let Some(pick) = view.pick_inode(Some(index)).filter(|p| p.index == index) else {
                return Err(UfsError::invariant(
                    self.geo.ino_to_fsba(ino).0,
                    format!("inode {ino} already in use"),
                ));
            };
            if let Some(range) = &pick.init {
                self.init_inode_blocks(cg, range)?;
            }
            Ok(Some(((), view.claim_inode(&pick, is_dir)?)))
        })?;
        done.ok_or_else(|| UfsError::corruption(self.geo.cgtod(cg).0, "cylinder group unreadable"))
    }

    /// Release inode `ino`.
    pub fn vfree(&self, ino: InodeNumber, is_dir: bool) -> Result<()> {
        if !self.geo.is_valid_ino(ino) || ino.0 < FIRST_USER_INODE {
            return Err(UfsError::invariant(0, format!("freeing reserved or invalid inode {ino}")));
        }
        let cg = self.geo.ino_to_cg(ino);
        let index = self.geo.ino_index(ino);
        let done = self.mutate_group(cg, |view| Ok(Some(((), view.free_inode(index, is_dir)?))))?;
        done.ok_or_else(|| UfsError::corruption(self.geo.cgtod(cg).0, "cylinder group unreadable"))?;
        debug!(ino = ino.0, is_dir, "freed inode");
        Ok(())
    }

    /// Zero the on-disk slots of inode indexes `range` in group `cg`, each
    /// with a fresh random generation.
    fn init_inode_blocks(&self, cg: GroupNumber, range: &Range<u32>) -> Result<()> {
        let inopb = self.geo.inopb();
        let mut index = range.start - range.start % inopb;
        while index < range.end {
            let addr = self.geo.ino_to_fsba(self.geo.make_ino(cg, index));
            let mut block = vec![0_u8; self.geo.bsize_usize()];
            {
                let mut rng = self.rng.lock();
                for slot in block.chunks_exact_mut(INODE_SIZE as usize) {
                    let inode = DiskInode {
                        generation: rng.random(),
                        ..DiskInode::default()
                    };
                    inode.write_to(self.geo.order, slot).map_err(|e| live_error(addr.0, e))?;
                }
            }
            self.dev.write(addr, &block, WriteMode::Async)?;
            index += inopb;
        }
        trace!(group = cg.0, start = range.start, end = range.end, "initialized inode blocks");
        Ok(())
    }

    /// A fresh inode generation number.
    pub fn next_generation(&self) -> u32 {
        self.rng.lock().random()
    }

    // ── Placement ───────────────────────────────────────────────────────────

    /// Group for a new directory under `parent`.
    pub fn dirpref(&self, parent: InodeNumber) -> GroupNumber {
        let sum = self.summary.lock();
        let is_root = parent == InodeNumber::ROOT;
        let random_start = if is_root { self.rng.lock().random() } else { 0 };
        let view = SummaryView {
            total: &sum.sb.cstotal,
            csum: &sum.sb.csum,
            contigdirs: &sum.contigdirs,
        };
        dirpref(
            &self.geo,
            &self.policy,
            &view,
            self.geo.ino_to_cg(parent),
            is_root,
            random_start,
        )
    }

    /// Preferred address for logical block `lbn` of `ino`, where `bap` is
    /// the pointer array holding slot `indx` for that block.
    ///
    /// Continues right after the previous block; at the start of a file,
    /// and every `maxbpg` blocks after that, moves to a group with at least
    /// average free space.
    #[expect(clippy::cast_possible_truncation)]
    pub fn blkpref(&self, ino: InodeNumber, lbn: u64, indx: usize, bap: &[u64]) -> Option<FragNumber> {
        let prev = indx
            .checked_sub(1)
            .and_then(|i| bap.get(i))
            .copied()
            .filter(|&raw| SnapSlot::is_real_address(raw));
        let maxbpg = self.policy.effective_maxbpg(&self.geo);

        match prev {
            Some(prev) if indx % maxbpg as usize != 0 => {
                Some(FragNumber(prev + u64::from(self.geo.frag)))
            }
            _ => {
                let home = self.geo.ino_to_cg(ino);
                if lbn < NDADDR as u64 + self.geo.nindir() {
                    return Some(self.geo.cgdmin(home));
                }
                let ncg = self.geo.ncg;
                let startcg = match prev {
                    Some(prev) => (self.geo.dtog(FragNumber(prev)).0 + 1) % ncg,
                    None => {
                        let hop = lbn / u64::from(maxbpg);
                        ((u64::from(home.0) + hop) % u64::from(ncg)) as u32
                    }
                };

                let mut sum = self.summary.lock();
                let avgbfree = sum.sb.cstotal.nbfree / u64::from(ncg);
                for cg in (startcg..ncg).chain(0..=startcg) {
                    if u64::from(sum.sb.csum[cg as usize].nbfree) >= avgbfree {
                        sum.sb.cgrotor = cg;
                        return Some(self.geo.cgdmin(GroupNumber(cg)));
                    }
                }
                None
            }
        }
    }

    // ── Summary and snapshots ───────────────────────────────────────────────

    #[must_use]
    pub fn total(&self) -> CsumTotal {
        self.summary.lock().sb.cstotal
    }

    #[must_use]
    pub fn group_summary(&self, cg: GroupNumber) -> Option<Csum> {
        self.summary.lock().sb.csum.get(cg.0 as usize).copied()
    }

    /// A copy of the in-memory superblock, summary included.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.summary.lock().sb.clone()
    }

    /// Edit the in-memory superblock; persisted by [`Allocator::flush`].
    pub fn update_superblock<T>(&self, f: impl FnOnce(&mut Superblock) -> T) -> T {
        let mut sum = self.summary.lock();
        sum.dirty = true;
        f(&mut sum.sb)
    }

    /// Write the superblock if it changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let mut sum = self.summary.lock();
        if !sum.dirty {
            return Ok(());
        }
        let block = sum.sb.to_block().map_err(|e| live_error(0, e))?;
        self.dev.write(self.geo.cgsblock(GroupNumber(0)), &block, WriteMode::Sync)?;
        sum.dirty = false;
        trace!(nbfree = sum.sb.cstotal.nbfree, "superblock written");
        Ok(())
    }

    /// Whether group `cg` changed since it was last copied.
    #[must_use]
    pub fn group_changed(&self, cg: GroupNumber) -> bool {
        self.groups
            .get(cg.0 as usize)
            .is_some_and(|slot| slot.lock().changed)
    }

    /// Copy of group `cg`, clearing its changed marker; `None` when damaged.
    pub fn copy_group(&self, cg: GroupNumber) -> Result<Option<CylinderGroup>> {
        let mut slot = self.slot(cg)?.lock();
        let copy = self.load(&mut slot, cg)?.cloned();
        if copy.is_some() {
            slot.changed = false;
        }
        Ok(copy)
    }

    pub fn set_free_hook(&self, hook: Arc<dyn FreeIntercept>) {
        *self.free_hook.write() = Some(hook);
    }

    /// Remove the free hook; `true` if one was installed.
    pub fn clear_free_hook(&self) -> bool {
        self.free_hook.write().take().is_some()
    }

    #[must_use]
    pub fn has_free_hook(&self) -> bool {
        self.free_hook.read().is_some()
    }

    // ── Consistency ─────────────────────────────────────────────────────────

    /// Recount every group's maps and compare against the group headers,
    /// the summary array, and the totals. Nothing is modified.
    ///
    /// Each group is compared with its summary entry while its lock is held,
    /// so the check is meaningful on a live filesystem.
    pub fn check(&self) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        for cg in (0..self.geo.ncg).map(GroupNumber) {
            let mut slot = self.slot(cg)?.lock();
            report.groups_checked += 1;
            let Some(group) = self.load(&mut slot, cg)? else {
                report.unreadable_groups.push(cg.0);
                continue;
            };
            let count = recount(&self.geo, group, self.contigsumsize)?;
            let cs = group.cs;
            for (what, counted, stored) in [
                ("nbfree", count.nbfree, cs.nbfree),
                ("nffree", count.nffree, cs.nffree),
                ("nifree", count.nifree, cs.nifree),
            ] {
                if counted != stored {
                    report
                        .problems
                        .push(format!("group {cg}: {what} maps={counted} header={stored}"));
                }
            }
            if count.frsum != group.frsum {
                report.problems.push(format!("group {cg}: fragment histogram mismatch"));
            }
            if count.clustersum != group.clustersum {
                report.problems.push(format!("group {cg}: cluster histogram mismatch"));
            }
            let entry = self.summary.lock().sb.csum[cg.0 as usize];
            if cs != entry {
                report
                    .problems
                    .push(format!("group {cg}: header {cs:?} != summary {entry:?}"));
            }
            drop(slot);
        }

        let sum = self.summary.lock();
        let recomputed = CsumTotal::from_groups(&sum.sb.csum);
        if recomputed != sum.sb.cstotal {
            report.problems.push(format!(
                "totals {:?} != sum of groups {recomputed:?}",
                sum.sb.cstotal
            ));
        }
        drop(sum);

        if !report.is_clean() {
            warn!(problems = report.problems.len(), unreadable = report.unreadable_groups.len(), "check found inconsistencies");
        }
        Ok(report)
    }
}
