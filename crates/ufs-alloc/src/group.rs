//! Operations on one loaded cylinder group.
//!
//! [`CgView`] borrows a group image mutably and performs the bitmap and
//! histogram updates for one allocation or free. It does no I/O; the caller
//! holds the group lock, writes the block back, and folds the returned
//! [`CsDelta`] into the filesystem summary.
//!
//! All positions here are group-relative: fragment offsets from the group
//! base, block indexes (`offset / frag`), and inode indexes within the group.

use crate::bitmap::{
    blkmap, bump, clrbit, clrblock, count_set, find_clear_bit, find_run, fragacct, isblock,
    isfreeblock_clear, isset, setbit, setblock,
};
use std::ops::Range;
use ufs_error::{Result, UfsError};
use ufs_ondisk::{Csum, CsumTotal, CylinderGroup, Geometry};
use ufs_types::{CLUSTERSUM_LEN, GroupNumber, MAXFRAG};

/// Longest cluster length the histogram distinguishes.
#[expect(clippy::cast_possible_truncation)]
pub const MAX_CONTIGSUM: u32 = (CLUSTERSUM_LEN - 1) as u32;

/// Signed change to a group's summary counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsDelta {
    pub ndir: i64,
    pub nbfree: i64,
    pub nifree: i64,
    pub nffree: i64,
}

fn adjust_u32(value: u32, delta: i64, what: &str, block: u64) -> Result<u32> {
    u32::try_from(i64::from(value) + delta).map_err(|_| {
        UfsError::invariant(block, format!("{what} counter out of range: {value} {delta:+}"))
    })
}

fn adjust_u64(value: u64, delta: i64, what: &str, block: u64) -> Result<u64> {
    value.checked_add_signed(delta).ok_or_else(|| {
        UfsError::invariant(block, format!("{what} total out of range: {value} {delta:+}"))
    })
}

impl CsDelta {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            ndir: self.ndir + other.ndir,
            nbfree: self.nbfree + other.nbfree,
            nifree: self.nifree + other.nifree,
            nffree: self.nffree + other.nffree,
        }
    }

    /// Apply to one group's counters; nothing changes on underflow.
    pub fn apply(&self, cs: &mut Csum, block: u64) -> Result<()> {
        let next = Csum {
            ndir: adjust_u32(cs.ndir, self.ndir, "ndir", block)?,
            nbfree: adjust_u32(cs.nbfree, self.nbfree, "nbfree", block)?,
            nifree: adjust_u32(cs.nifree, self.nifree, "nifree", block)?,
            nffree: adjust_u32(cs.nffree, self.nffree, "nffree", block)?,
        };
        *cs = next;
        Ok(())
    }

    pub fn apply_total(&self, total: &mut CsumTotal, block: u64) -> Result<()> {
        let next = CsumTotal {
            ndir: adjust_u64(total.ndir, self.ndir, "ndir", block)?,
            nbfree: adjust_u64(total.nbfree, self.nbfree, "nbfree", block)?,
            nifree: adjust_u64(total.nifree, self.nifree, "nifree", block)?,
            nffree: adjust_u64(total.nffree, self.nffree, "nffree", block)?,
        };
        *total = next;
        Ok(())
    }
}

/// An inode chosen by [`CgView::pick_inode`] but not yet marked in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodePick {
    pub index: u32,
    /// Inode indexes whose on-disk slots must be zeroed before use.
    pub init: Option<Range<u32>>,
}

/// Mutable view of one cylinder group.
pub struct CgView<'a> {
    geo: &'a Geometry,
    cg: &'a mut CylinderGroup,
    contigsumsize: u32,
}

impl<'a> CgView<'a> {
    pub fn new(geo: &'a Geometry, cg: &'a mut CylinderGroup, contigsumsize: u32) -> Self {
        Self {
            geo,
            cg,
            contigsumsize: contigsumsize.min(MAX_CONTIGSUM),
        }
    }

    #[must_use]
    pub fn group(&self) -> GroupNumber {
        GroupNumber(self.cg.cgx)
    }

    #[must_use]
    pub fn cs(&self) -> Csum {
        self.cg.cs
    }

    fn abs(&self, bno: u32) -> u64 {
        self.geo.cgbase(self.group()).0 + u64::from(bno)
    }

    fn account(&mut self, delta: CsDelta) -> Result<CsDelta> {
        let block = self.geo.cgtod(self.group()).0;
        delta.apply(&mut self.cg.cs, block)?;
        Ok(delta)
    }

    // ── Blocks and fragments ────────────────────────────────────────────────

    /// Allocate `frags` fragments (a full block when `frags == frag`).
    ///
    /// Reuses the smallest existing free run that fits; otherwise breaks a
    /// full block and returns the remainder to the fragment pool.
    pub fn alloc(&mut self, pref: Option<u32>, frags: u32) -> Result<Option<(u32, CsDelta)>> {
        let frag = self.geo.frag;
        if frags == 0 || frags > frag {
            return Err(UfsError::InvalidArgument(format!(
                "fragment count {frags} outside 1..={frag}"
            )));
        }
        if frags == frag {
            return self.alloc_block(pref);
        }

        let allocsiz = (frags..frag).find(|&n| self.cg.frsum[n as usize] != 0);
        let Some(allocsiz) = allocsiz else {
            // No run long enough: break a full block.
            let Some((bno, mut delta)) = self.alloc_block(pref)? else {
                return Ok(None);
            };
            for i in frags..frag {
                setbit(&mut self.cg.blksfree, bno + i);
            }
            let rest = frag - frags;
            self.cg.frsum[rest as usize] += 1;
            delta = delta.merge(self.account(CsDelta {
                nffree: i64::from(rest),
                ..CsDelta::default()
            })?);
            return Ok(Some((bno, delta)));
        };

        let bno = self.mapsearch(pref, allocsiz)?;
        for i in 0..frags {
            clrbit(&mut self.cg.blksfree, bno + i);
        }
        self.cg.frsum[allocsiz as usize] -= 1;
        if frags != allocsiz {
            self.cg.frsum[(allocsiz - frags) as usize] += 1;
        }
        let delta = self.account(CsDelta {
            nffree: -i64::from(frags),
            ..CsDelta::default()
        })?;
        Ok(Some((bno, delta)))
    }

    /// Allocate one full block, at `pref` when that block is free.
    pub fn alloc_block(&mut self, pref: Option<u32>) -> Result<Option<(u32, CsDelta)>> {
        if self.cg.cs.nbfree == 0 {
            return Ok(None);
        }
        let frag = self.geo.frag;
        let bno = match pref {
            Some(p) if p < self.cg.ndblk => {
                let p = p - p % frag;
                if isblock(&self.cg.blksfree, frag, p / frag) {
                    p
                } else {
                    let found = self.mapsearch(Some(p), frag)?;
                    self.cg.rotor = found;
                    found
                }
            }
            _ => {
                let found = self.mapsearch(Some(self.cg.rotor), frag)?;
                self.cg.rotor = found;
                found
            }
        };
        let blkno = bno / frag;
        clrblock(&mut self.cg.blksfree, frag, blkno);
        self.cluster_acct(blkno, -1)?;
        let delta = self.account(CsDelta {
            nbfree: -1,
            ..CsDelta::default()
        })?;
        Ok(Some((bno, delta)))
    }

    /// Locate a maximal free run of exactly `allocsiz` fragments.
    ///
    /// The histograms promised one, so failing to find it means the group
    /// block is inconsistent.
    fn mapsearch(&mut self, pref: Option<u32>, allocsiz: u32) -> Result<u32> {
        let start_frag = pref.unwrap_or(self.cg.frotor).min(self.cg.ndblk);
        let found = find_run(
            &self.cg.blksfree,
            self.cg.ndblk,
            self.geo.frag,
            allocsiz,
            start_frag / 8,
        );
        let Some((bno, byte)) = found else {
            return Err(UfsError::corruption(
                self.geo.cgtod(self.group()).0,
                format!("summary promised a free run of {allocsiz} fragments, map has none"),
            ));
        };
        self.cg.frotor = byte * 8;
        Ok(bno)
    }

    /// Grow the allocation at `bprev` from `ofrags` to `nfrags` fragments
    /// without moving it. Fails when the block boundary would be crossed or a
    /// needed fragment is taken.
    pub fn extend(&mut self, bprev: u32, ofrags: u32, nfrags: u32) -> Result<Option<CsDelta>> {
        let frag = self.geo.frag;
        if nfrags <= ofrags || ofrags == 0 {
            return Err(UfsError::InvalidArgument(format!(
                "cannot extend {ofrags} fragments to {nfrags}"
            )));
        }
        let bbase = bprev % frag;
        if bbase + nfrags > frag {
            return Ok(None);
        }
        if self.cg.cs.nffree < nfrags - ofrags {
            return Ok(None);
        }
        if (ofrags..nfrags).any(|i| !isset(&self.cg.blksfree, bprev + i)) {
            return Ok(None);
        }

        // Length of the free run that starts right after the old allocation.
        let mut end = nfrags;
        while end < frag - bbase && isset(&self.cg.blksfree, bprev + end) {
            end += 1;
        }
        let cgtod = self.geo.cgtod(self.group()).0;
        bump(&mut self.cg.frsum, end - ofrags, -1, cgtod)?;
        if end != nfrags {
            self.cg.frsum[(end - nfrags) as usize] += 1;
        }
        for i in ofrags..nfrags {
            clrbit(&mut self.cg.blksfree, bprev + i);
        }
        let delta = self.account(CsDelta {
            nffree: -i64::from(nfrags - ofrags),
            ..CsDelta::default()
        })?;
        Ok(Some(delta))
    }

    /// Return `frags` fragments at `bno` to the free pool.
    ///
    /// Freeing anything that is already free is an invariant violation and
    /// leaves the group untouched.
    pub fn free(&mut self, bno: u32, frags: u32) -> Result<CsDelta> {
        let frag = self.geo.frag;
        let block = self.abs(bno);
        if frags == 0
            || frags > frag
            || bno < self.geo.dblkno
            || bno + frags > self.cg.ndblk
            || bno % frag + frags > frag
        {
            return Err(UfsError::invariant(
                block,
                format!("bad free of {frags} fragments"),
            ));
        }

        if frags == frag {
            if bno % frag != 0 || !isfreeblock_clear(&self.cg.blksfree, frag, bno / frag) {
                return Err(UfsError::invariant(block, "freeing free block"));
            }
            setblock(&mut self.cg.blksfree, frag, bno / frag);
            self.cluster_acct(bno / frag, 1)?;
            return self.account(CsDelta {
                nbfree: 1,
                ..CsDelta::default()
            });
        }

        if (0..frags).any(|i| isset(&self.cg.blksfree, bno + i)) {
            return Err(UfsError::invariant(block, "freeing free fragment"));
        }
        let blkno = bno / frag;
        fragacct(frag, blkmap(&self.cg.blksfree, frag, blkno), &mut self.cg.frsum, -1, block)?;
        for i in 0..frags {
            setbit(&mut self.cg.blksfree, bno + i);
        }
        fragacct(frag, blkmap(&self.cg.blksfree, frag, blkno), &mut self.cg.frsum, 1, block)?;

        let mut delta = CsDelta {
            nffree: i64::from(frags),
            ..CsDelta::default()
        };
        if isblock(&self.cg.blksfree, frag, blkno) {
            // The block is whole again.
            delta.nffree -= i64::from(frag);
            delta.nbfree += 1;
            self.cluster_acct(blkno, 1)?;
        }
        self.account(delta)
    }

    /// Update the cluster map and histogram for block `blkno` becoming free
    /// (`cnt > 0`) or allocated (`cnt < 0`).
    fn cluster_acct(&mut self, blkno: u32, cnt: i32) -> Result<()> {
        if self.contigsumsize == 0 {
            return Ok(());
        }
        if cnt > 0 {
            setbit(&mut self.cg.clusterfree, blkno);
        } else {
            clrbit(&mut self.cg.clusterfree, blkno);
        }
        let nblks = self.cg.nclusterblks;
        let cap = self.contigsumsize;

        let mut forw = 0;
        while forw < cap && blkno + 1 + forw < nblks && isset(&self.cg.clusterfree, blkno + 1 + forw) {
            forw += 1;
        }
        let mut back = 0;
        while back < cap && back < blkno && isset(&self.cg.clusterfree, blkno - 1 - back) {
            back += 1;
        }

        let merged = (back + forw + 1).min(cap);
        let block = self.geo.cgtod(self.group()).0;
        let sum = &mut self.cg.clustersum;
        bump(sum, merged, cnt, block)?;
        if back > 0 {
            bump(sum, back, -cnt, block)?;
        }
        if forw > 0 {
            bump(sum, forw, -cnt, block)?;
        }
        Ok(())
    }

    // ── Inodes ──────────────────────────────────────────────────────────────

    /// Choose a free inode, `pref` first, else scanning from the rotor.
    ///
    /// Only the rotor moves; call [`CgView::claim_inode`] once any lazy
    /// initialization has been written.
    pub fn pick_inode(&mut self, pref: Option<u32>) -> Option<InodePick> {
        if self.cg.cs.nifree == 0 {
            return None;
        }
        let ipg = self.cg.niblk;
        let index = match pref.map(|p| p % ipg) {
            Some(p) if !isset(&self.cg.inosused, p) => p,
            _ => {
                let found = find_clear_bit(&self.cg.inosused, ipg, self.cg.irotor)?;
                self.cg.irotor = found;
                found
            }
        };

        let inopb = self.geo.inopb();
        let mut init = None;
        if index + inopb > self.cg.initediblk && self.cg.initediblk < ipg {
            let start = self.cg.initediblk;
            let mut end = start;
            while index + inopb > end && end < ipg {
                end += inopb;
            }
            init = Some(start..end.min(ipg));
        }
        Some(InodePick { index, init })
    }

    /// Mark inode `index` in use, recording any slots initialized for it.
    pub fn claim_inode(&mut self, pick: &InodePick, is_dir: bool) -> Result<CsDelta> {
        let index = pick.index;
        if index >= self.cg.niblk || isset(&self.cg.inosused, index) {
            let ino = self.geo.make_ino(self.group(), index);
            return Err(UfsError::invariant(
                self.geo.ino_to_fsba(ino).0,
                format!("inode {ino} already in use"),
            ));
        }
        if let Some(range) = &pick.init {
            self.cg.initediblk = self.cg.initediblk.max(range.end);
        }
        setbit(&mut self.cg.inosused, index);
        self.account(CsDelta {
            nifree: -1,
            ndir: i64::from(is_dir),
            ..CsDelta::default()
        })
    }

    /// Release inode `index`; the rotor rewinds so the slot is found again
    /// quickly.
    pub fn free_inode(&mut self, index: u32, is_dir: bool) -> Result<CsDelta> {
        if index >= self.cg.niblk || !isset(&self.cg.inosused, index) {
            let ino = self.geo.make_ino(self.group(), index);
            return Err(UfsError::invariant(
                self.geo.ino_to_fsba(ino).0,
                format!("freeing free inode {ino}"),
            ));
        }
        clrbit(&mut self.cg.inosused, index);
        if index < self.cg.irotor {
            self.cg.irotor = index;
        }
        self.account(CsDelta {
            nifree: 1,
            ndir: -i64::from(is_dir),
            ..CsDelta::default()
        })
    }
}

// ── Whole-group helpers ─────────────────────────────────────────────────────

/// Freshly formatted group `cg`: metadata allocated, every data block and
/// inode free.
#[must_use]
pub fn init_group(geo: &Geometry, cg: GroupNumber, contigsumsize: u32) -> CylinderGroup {
    let mut group = CylinderGroup::empty(geo, cg);
    let frag = geo.frag;
    let first = geo.dblkno / frag;
    let last = group.ndblk / frag;
    for blkno in first..last {
        setblock(&mut group.blksfree, frag, blkno);
        setbit(&mut group.clusterfree, blkno);
    }
    group.cs = Csum {
        ndir: 0,
        nbfree: last - first,
        nifree: geo.ipg,
        nffree: 0,
    };
    group.rotor = geo.dblkno;
    group.frotor = geo.dblkno;
    rebuild_cluster_summary(&mut group, contigsumsize);
    group
}

/// Recompute the cluster histogram from the cluster map.
pub fn rebuild_cluster_summary(cg: &mut CylinderGroup, contigsumsize: u32) {
    cg.clustersum = [0; CLUSTERSUM_LEN];
    let cap = contigsumsize.min(MAX_CONTIGSUM);
    if cap == 0 {
        return;
    }
    let mut run = 0_u32;
    for blkno in 0..=cg.nclusterblks {
        if blkno < cg.nclusterblks && isset(&cg.clusterfree, blkno) {
            run += 1;
        } else if run > 0 {
            cg.clustersum[run.min(cap) as usize] += 1;
            run = 0;
        }
    }
}

/// Counters and histograms derived from a group's bitmaps alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCount {
    pub nbfree: u32,
    pub nffree: u32,
    pub nifree: u32,
    pub frsum: [u32; MAXFRAG as usize],
    pub clustersum: [u32; CLUSTERSUM_LEN],
}

/// Recount a group from its maps.
pub fn recount(geo: &Geometry, cg: &CylinderGroup, contigsumsize: u32) -> Result<GroupCount> {
    let frag = geo.frag;
    let mut nbfree = 0;
    let mut nffree = 0;
    let mut frsum = [0_u32; MAXFRAG as usize];
    for blkno in 0..cg.ndblk / frag {
        let blk = blkmap(&cg.blksfree, frag, blkno);
        if isblock(&cg.blksfree, frag, blkno) {
            nbfree += 1;
        } else {
            nffree += blk.count_ones();
            fragacct(frag, blk, &mut frsum, 1, geo.cgtod(GroupNumber(cg.cgx)).0)?;
        }
    }
    let mut scratch = cg.clone();
    rebuild_cluster_summary(&mut scratch, contigsumsize);
    Ok(GroupCount {
        nbfree,
        nffree,
        nifree: cg.niblk - count_set(&cg.inosused, cg.niblk),
        frsum,
        clustersum: scratch.clustersum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufs_ondisk::GeometryParams;
    use ufs_types::ByteOrder;

    fn geo() -> Geometry {
        Geometry::new(GeometryParams {
            bsize: 4096,
            fsize: 512,
            fpg: 832,
            ipg: 32,
            ncg: 4,
            size: 4 * 832,
            order: ByteOrder::Little,
        })
        .expect("geometry")
    }

    fn assert_consistent(g: &Geometry, cg: &CylinderGroup) {
        let count = recount(g, cg, 16).expect("recount");
        assert_eq!(count.nbfree, cg.cs.nbfree, "nbfree");
        assert_eq!(count.nffree, cg.cs.nffree, "nffree");
        assert_eq!(count.nifree, cg.cs.nifree, "nifree");
        assert_eq!(count.frsum, cg.frsum, "frsum");
        assert_eq!(count.clustersum, cg.clustersum, "clustersum");
    }

    #[test]
    fn fresh_group_is_all_free() {
        let g = geo();
        let cg = init_group(&g, GroupNumber(0), 16);
        assert_eq!(cg.cs.nbfree, 100);
        assert_eq!(cg.cs.nifree, 32);
        // One run of 100 free blocks, counted in the last bucket.
        assert_eq!(cg.clustersum[16], 1);
        assert_eq!(cg.clustersum.iter().sum::<u32>(), 1);
        assert_consistent(&g, &cg);
    }

    #[test]
    fn first_block_is_the_first_data_block() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let mut view = CgView::new(&g, &mut cg, 16);
        let (bno, delta) = view.alloc_block(None).expect("alloc").expect("space");
        assert_eq!(bno, g.dblkno);
        assert_eq!(delta.nbfree, -1);
        view.free(bno, 8).expect("free");
        assert_eq!(cg.cs.nbfree, 100);
        assert_consistent(&g, &cg);
    }

    #[test]
    fn drifted_cluster_histogram_is_an_invariant_violation() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let mut view = CgView::new(&g, &mut cg, 16);
        let taken: Vec<u32> = (0..4)
            .map(|_| view.alloc_block(None).expect("alloc").expect("space").0)
            .collect();
        view.free(taken[2], 8).expect("free");
        cg.clustersum[1] = 0;

        let mut view = CgView::new(&g, &mut cg, 16);
        let err = view.free(taken[1], 8).unwrap_err();
        assert!(matches!(err, UfsError::InvariantViolation { .. }));
    }

    #[test]
    fn preferred_block_is_taken_when_free() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let mut view = CgView::new(&g, &mut cg, 16);
        let (bno, _) = view.alloc_block(Some(80 + 3)).expect("alloc").expect("space");
        assert_eq!(bno, 80);
        assert_consistent(&g, &cg);
    }

    #[test]
    fn fragment_allocation_splits_then_reuses() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let mut view = CgView::new(&g, &mut cg, 16);

        let (a, d1) = view.alloc(None, 3).expect("alloc").expect("space");
        assert_eq!(d1.nbfree, -1);
        assert_eq!(d1.nffree, 5);
        // The remainder of the split block satisfies the next request.
        let (b, d2) = view.alloc(None, 2).expect("alloc").expect("space");
        assert_eq!(b, a + 3);
        assert_eq!(d2.nffree, -2);
        assert_eq!(cg.frsum[3], 1);
        assert_consistent(&g, &cg);
    }

    #[test]
    fn extend_never_crosses_a_block() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let mut view = CgView::new(&g, &mut cg, 16);
        let (a, _) = view.alloc(None, 6).expect("alloc").expect("space");
        assert!(view.extend(a, 6, 8).expect("extend").is_some());
        assert_consistent(&g, &cg);

        let mut view = CgView::new(&g, &mut cg, 16);
        let (b, _) = view.alloc(None, 2).expect("alloc").expect("space");
        let (c, _) = view.alloc(None, 2).expect("alloc").expect("space");
        assert_eq!(c, b + 2);
        // `c` has 4 free fragments left in its block; asking for 5 more fails.
        assert!(view.extend(c, 2, 7).expect("extend").is_none());
        assert!(view.extend(b, 2, 3).expect("extend").is_none());
        assert_consistent(&g, &cg);
    }

    #[test]
    fn double_free_is_an_invariant_violation() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let before = cg.clone();
        let mut view = CgView::new(&g, &mut cg, 16);
        let err = view.free(g.dblkno, 8).expect_err("double free");
        assert!(err.is_fatal());
        let err = view.free(g.dblkno + 1, 2).expect_err("double free");
        assert!(err.is_fatal());
        assert_eq!(cg, before);
    }

    #[test]
    fn freeing_metadata_is_rejected() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let mut view = CgView::new(&g, &mut cg, 16);
        assert!(view.free(g.cblkno, 8).is_err());
    }

    #[test]
    fn fragment_free_rejoins_block() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let mut view = CgView::new(&g, &mut cg, 16);
        let (a, _) = view.alloc(None, 5).expect("alloc").expect("space");
        let delta = view.free(a, 5).expect("free");
        assert_eq!(delta.nbfree, 1);
        assert_eq!(delta.nffree, -3);
        assert_eq!(cg.cs.nbfree, 100);
        assert_eq!(cg.cs.nffree, 0);
        assert_consistent(&g, &cg);
    }

    #[test]
    fn inode_pick_initializes_lazily() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(1), 16);
        let mut view = CgView::new(&g, &mut cg, 16);
        let pick = view.pick_inode(None).expect("free inode");
        assert_eq!(pick.index, 0);
        assert_eq!(pick.init, Some(0..16));
        view.claim_inode(&pick, true).expect("claim");
        assert_eq!(cg.initediblk, 16);
        assert_eq!(cg.cs.ndir, 1);

        let mut view = CgView::new(&g, &mut cg, 16);
        let pick = view.pick_inode(Some(20)).expect("free inode");
        assert_eq!(pick.index, 20);
        assert_eq!(pick.init, Some(16..32));
    }

    #[test]
    fn inode_free_rewinds_rotor() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(1), 16);
        for _ in 0..5 {
            let mut view = CgView::new(&g, &mut cg, 16);
            let pick = view.pick_inode(None).expect("free inode");
            view.claim_inode(&pick, false).expect("claim");
        }
        cg.irotor = 4;
        let mut view = CgView::new(&g, &mut cg, 16);
        view.free_inode(1, false).expect("free");
        assert_eq!(cg.irotor, 1);
        let mut view = CgView::new(&g, &mut cg, 16);
        assert!(view.free_inode(1, false).expect_err("twice").is_fatal());
        assert_consistent(&g, &cg);
    }

    #[test]
    fn full_group_refuses_blocks() {
        let g = geo();
        let mut cg = init_group(&g, GroupNumber(0), 16);
        let mut view = CgView::new(&g, &mut cg, 16);
        for _ in 0..100 {
            view.alloc_block(None).expect("alloc").expect("space");
        }
        assert!(view.alloc_block(None).expect("alloc").is_none());
        assert!(view.alloc(None, 1).expect("alloc").is_none());
        assert_eq!(cg.clustersum, [0; CLUSTERSUM_LEN]);
        assert_consistent(&g, &cg);
    }

    #[test]
    fn delta_apply_refuses_underflow() {
        let mut cs = Csum::default();
        let delta = CsDelta {
            nbfree: -1,
            ..CsDelta::default()
        };
        assert!(delta.apply(&mut cs, 0).is_err());
        assert_eq!(cs, Csum::default());
    }
}
