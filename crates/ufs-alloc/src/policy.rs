//! Placement policy: allocation tunables, the group search shared by every
//! allocation kind, and the directory-placement heuristic.

use serde::{Deserialize, Serialize};
use ufs_error::Result;
use ufs_ondisk::{Csum, CsumTotal, Geometry, Superblock};
use ufs_types::GroupNumber;

/// Allocation tunables, recorded in the superblock at format time and
/// overridable per mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocPolicy {
    /// Longest run of contiguous blocks the cluster histogram tracks.
    pub maxcontig: u32,
    /// Blocks a file may take from one group before moving on; `0` means
    /// one indirect block's worth.
    pub maxbpg: u32,
    /// Percentage of data space withheld from unprivileged allocations.
    pub minfree_percent: u32,
    /// Expected average file size in bytes.
    pub avgfilesize: u32,
    /// Expected files per directory.
    pub avgfpdir: u32,
    /// Write cylinder groups synchronously instead of delaying them.
    pub sync_commit: bool,
    /// Seed for directory placement; `None` draws from the OS.
    pub dirpref_seed: Option<u64>,
}

impl Default for AllocPolicy {
    fn default() -> Self {
        Self {
            maxcontig: 16,
            maxbpg: 0,
            minfree_percent: 8,
            avgfilesize: 16_384,
            avgfpdir: 64,
            sync_commit: false,
            dirpref_seed: None,
        }
    }
}

impl AllocPolicy {
    /// Tunables as recorded in `sb`.
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        Self {
            maxcontig: sb.maxcontig,
            maxbpg: sb.maxbpg,
            minfree_percent: sb.minfree,
            avgfilesize: sb.avgfilesize,
            avgfpdir: sb.avgfpdir,
            ..Self::default()
        }
    }

    /// Store the tunables in `sb`.
    pub fn record(&self, sb: &mut Superblock) {
        sb.maxcontig = self.maxcontig;
        sb.maxbpg = self.maxbpg;
        sb.minfree = self.minfree_percent;
        sb.avgfilesize = self.avgfilesize;
        sb.avgfpdir = self.avgfpdir;
    }

    /// Blocks per group per file before `blkpref` moves to another group.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn effective_maxbpg(&self, geo: &Geometry) -> u32 {
        if self.maxbpg == 0 {
            geo.nindir() as u32
        } else {
            self.maxbpg
        }
    }
}

/// What a group is being searched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// One full block.
    Block,
    /// `frags` fragments, fewer than a block.
    Fragment { frags: u32 },
    /// One inode.
    Inode { is_dir: bool },
}

/// Search every group for one that satisfies a request.
///
/// `start` is tried first (and is the only attempt given the caller's
/// preferred position), then `start + 1, start + 2, start + 4, ...` while the
/// offset stays below `ncg`, then every group from `start + 2` onward.
/// `try_group` returns `Ok(None)` when a group cannot help.
pub fn hashalloc<T>(
    ncg: u32,
    start: GroupNumber,
    mut try_group: impl FnMut(GroupNumber, bool) -> Result<Option<T>>,
) -> Result<Option<T>> {
    let start = start.0 % ncg;
    if let Some(found) = try_group(GroupNumber(start), true)? {
        return Ok(Some(found));
    }

    let mut offset = 1_u32;
    while offset < ncg {
        let cg = (start + offset) % ncg;
        if let Some(found) = try_group(GroupNumber(cg), false)? {
            return Ok(Some(found));
        }
        offset = offset.saturating_mul(2);
    }

    let mut cg = (start + 2) % ncg;
    for _ in 2..ncg {
        if let Some(found) = try_group(GroupNumber(cg), false)? {
            return Ok(Some(found));
        }
        cg = (cg + 1) % ncg;
    }
    Ok(None)
}

/// Summary counters `dirpref` reads.
#[derive(Debug, Clone, Copy)]
pub struct SummaryView<'a> {
    pub total: &'a CsumTotal,
    pub csum: &'a [Csum],
    /// Directories created in a row per group without an intervening file.
    pub contigdirs: &'a [u8],
}

/// Pick a group for a new directory.
///
/// Children of the root go to the emptiest above-average group, scanning
/// from `random_start`. Other directories stay near their parent unless the
/// parent's group already holds too many directories, too little free
/// space, or too many directories created back to back.
#[must_use]
pub fn dirpref(
    geo: &Geometry,
    policy: &AllocPolicy,
    summary: &SummaryView<'_>,
    parent_group: GroupNumber,
    parent_is_root: bool,
    random_start: u32,
) -> GroupNumber {
    let SummaryView {
        total,
        csum,
        contigdirs,
    } = *summary;
    let ncg = u64::from(geo.ncg);
    let avgifree = total.nifree / ncg;
    let avgbfree = total.nbfree / ncg;
    let avgndir = total.ndir / ncg;

    let order = |start: u32| (start..geo.ncg).chain(0..start);

    if parent_is_root {
        let start = random_start % geo.ncg;
        let mut best = start;
        let mut minndir = u64::from(geo.ipg);
        for cg in order(start) {
            let cs = &csum[cg as usize];
            if u64::from(cs.ndir) < minndir
                && u64::from(cs.nifree) >= avgifree
                && u64::from(cs.nbfree) >= avgbfree
            {
                best = cg;
                minndir = u64::from(cs.ndir);
            }
        }
        return GroupNumber(best);
    }

    let ipg = u64::from(geo.ipg);
    let maxndir = (avgndir + ipg / 16).min(ipg);
    let minifree = (avgifree - avgifree / 4).max(1);
    let minbfree = (avgbfree - avgbfree / 4).max(1);

    let cgsize = u64::from(geo.fsize) * u64::from(geo.fpg);
    let bsize = u64::from(geo.bsize);
    let mut dirsize = u64::from(policy.avgfilesize) * u64::from(policy.avgfpdir);
    if avgndir > 0 {
        let curdirsize = cgsize.saturating_sub(avgbfree * bsize) / avgndir;
        dirsize = dirsize.min(curdirsize);
    }
    let mut maxcontigdirs = if dirsize == 0 {
        0
    } else {
        (avgbfree * bsize / dirsize).min(255)
    };
    if policy.avgfpdir > 0 {
        maxcontigdirs = maxcontigdirs.min(ipg / u64::from(policy.avgfpdir));
    }
    let maxcontigdirs = maxcontigdirs.max(1);

    let start = parent_group.0 % geo.ncg;
    for cg in order(start) {
        let cs = &csum[cg as usize];
        if u64::from(cs.ndir) < maxndir
            && u64::from(cs.nifree) >= minifree
            && u64::from(cs.nbfree) >= minbfree
            && u64::from(contigdirs[cg as usize]) < maxcontigdirs
        {
            return GroupNumber(cg);
        }
    }
    // Backstop: anything with an average share of free inodes.
    for cg in order(start) {
        if u64::from(csum[cg as usize].nifree) >= avgifree {
            return GroupNumber(cg);
        }
    }
    GroupNumber(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufs_ondisk::GeometryParams;
    use ufs_types::ByteOrder;

    fn geo(ncg: u32) -> Geometry {
        Geometry::new(GeometryParams {
            bsize: 4096,
            fsize: 512,
            fpg: 832,
            ipg: 32,
            ncg,
            size: u64::from(ncg) * 832,
            order: ByteOrder::Little,
        })
        .expect("geometry")
    }

    fn visits(ncg: u32, start: u32) -> Vec<(u32, bool)> {
        let mut seen = Vec::new();
        let found: Option<()> = hashalloc(ncg, GroupNumber(start), |cg, first| {
            seen.push((cg.0, first));
            Ok(None)
        })
        .expect("search");
        assert!(found.is_none());
        seen
    }

    #[test]
    fn search_order_is_preferred_then_doubling_then_linear() {
        let order: Vec<u32> = visits(8, 3).into_iter().map(|(cg, _)| cg).collect();
        assert_eq!(order[..4], [3, 4, 5, 7]);
        assert_eq!(order[4..], [5, 6, 7, 0, 1, 2]);
    }

    #[test]
    fn only_the_first_attempt_is_preferred() {
        let seen = visits(5, 0);
        assert!(seen[0].1);
        assert!(seen[1..].iter().all(|(_, first)| !first));
    }

    #[test]
    fn search_visits_every_group() {
        for ncg in 1..12 {
            for start in 0..ncg {
                let mut hit: Vec<u32> = visits(ncg, start).into_iter().map(|(cg, _)| cg).collect();
                hit.sort_unstable();
                hit.dedup();
                assert_eq!(hit, (0..ncg).collect::<Vec<_>>(), "ncg={ncg} start={start}");
            }
        }
    }

    #[test]
    fn search_stops_at_first_success() {
        let mut tries = 0;
        let found = hashalloc(10, GroupNumber(0), |cg, _| {
            tries += 1;
            Ok((cg.0 == 5).then_some(cg))
        })
        .expect("search");
        assert_eq!(found, Some(GroupNumber(5)));
        assert!(tries <= 10);
    }

    fn uniform(ncg: u32, nbfree: u32, nifree: u32, ndir: u32) -> (Vec<Csum>, CsumTotal) {
        let csum = vec![
            Csum {
                ndir,
                nbfree,
                nifree,
                nffree: 0,
            };
            ncg as usize
        ];
        let total = CsumTotal::from_groups(&csum);
        (csum, total)
    }

    #[test]
    fn root_children_take_the_emptiest_group() {
        let g = geo(4);
        let (mut csum, _) = uniform(4, 100, 30, 2);
        csum[2].ndir = 0;
        let total = CsumTotal::from_groups(&csum);
        let view = SummaryView {
            total: &total,
            csum: &csum,
            contigdirs: &[0; 4],
        };
        let cg = dirpref(&g, &AllocPolicy::default(), &view, GroupNumber(0), true, 3);
        assert_eq!(cg, GroupNumber(2));
    }

    #[test]
    fn subdirectories_stay_with_parent_until_throttled() {
        let g = geo(4);
        let policy = AllocPolicy::default();
        let (csum, total) = uniform(4, 100, 30, 1);
        let mut contig = [0_u8; 4];
        let pick = |contig: &[u8]| {
            let view = SummaryView {
                total: &total,
                csum: &csum,
                contigdirs: contig,
            };
            dirpref(&g, &policy, &view, GroupNumber(1), false, 0)
        };
        assert_eq!(pick(&contig), GroupNumber(1));
        contig[1] = 255;
        assert_eq!(pick(&contig), GroupNumber(2));
    }

    #[test]
    fn full_groups_are_skipped_for_directories() {
        let g = geo(4);
        let (mut csum, _) = uniform(4, 100, 30, 1);
        csum[0].nbfree = 0;
        csum[0].nifree = 0;
        let total = CsumTotal::from_groups(&csum);
        let view = SummaryView {
            total: &total,
            csum: &csum,
            contigdirs: &[0; 4],
        };
        let cg = dirpref(&g, &AllocPolicy::default(), &view, GroupNumber(0), false, 0);
        assert_eq!(cg, GroupNumber(1));
    }

    #[test]
    fn maxbpg_defaults_to_one_indirect_block() {
        let policy = AllocPolicy::default();
        assert_eq!(policy.effective_maxbpg(&geo(4)), 512);
        let policy = AllocPolicy {
            maxbpg: 40,
            ..policy
        };
        assert_eq!(policy.effective_maxbpg(&geo(4)), 40);
    }
}
