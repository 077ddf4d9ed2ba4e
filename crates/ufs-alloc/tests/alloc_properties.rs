//! Randomized allocate/free sequences against a fresh filesystem.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use ufs_alloc::{AllocHint, AllocPolicy, Allocator};
use ufs_block::memory_device;
use ufs_error::UfsError;
use ufs_ondisk::{Geometry, GeometryParams};
use ufs_types::{ByteOrder, FragNumber, GroupNumber, InodeNumber};

fn setup(ncg: u32) -> Allocator {
    let geo = Geometry::new(GeometryParams {
        bsize: 4096,
        fsize: 512,
        fpg: 832,
        ipg: 32,
        ncg,
        size: u64::from(ncg) * 832,
        order: ByteOrder::Little,
    })
    .expect("geometry");
    let dev = Arc::new(memory_device(geo.fsize, geo.size).expect("device"));
    let policy = AllocPolicy {
        minfree_percent: 0,
        dirpref_seed: Some(1),
        ..AllocPolicy::default()
    };
    let sb = Allocator::format(&geo, dev.as_ref(), &policy).expect("format");
    Allocator::open(geo, dev, sb, policy).expect("open")
}

#[derive(Debug, Clone)]
enum Op {
    Alloc { frags: u32, group: u32 },
    Free { pick: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1_u32..=8, 0_u32..3).prop_map(|(frags, group)| Op::Alloc { frags, group }),
        1 => any::<usize>().prop_map(|pick| Op::Free { pick }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn allocations_never_overlap_and_counters_stay_exact(
        ops in proptest::collection::vec(op(), 1..160),
    ) {
        let alloc = setup(3);
        let initial = alloc.total();
        let geo = *alloc.geometry();
        // start fragment -> fragment count
        let mut held = BTreeMap::<u64, u32>::new();

        for op in ops {
            match op {
                Op::Alloc { frags, group } => {
                    let ino = geo.make_ino(GroupNumber(group), 5);
                    match alloc.alloc(ino, frags * geo.fsize, AllocHint::default()) {
                        Ok(addr) => {
                            prop_assert!(geo.is_data_range(addr, u64::from(frags)));
                            prop_assert!(geo.fragnum(addr) + frags <= geo.frag);
                            let overlaps_prev = held
                                .range(..=addr.0)
                                .next_back()
                                .is_some_and(|(start, len)| start + u64::from(*len) > addr.0);
                            let overlaps_next = held
                                .range(addr.0..)
                                .next()
                                .is_some_and(|(start, _)| *start < addr.0 + u64::from(frags));
                            prop_assert!(!overlaps_prev && !overlaps_next, "overlap at {addr}");
                            held.insert(addr.0, frags);
                        }
                        Err(UfsError::NoSpace) => {}
                        Err(err) => prop_assert!(false, "unexpected error {err}"),
                    }
                }
                Op::Free { pick } => {
                    if held.is_empty() {
                        continue;
                    }
                    let key = *held.keys().nth(pick % held.len()).expect("key");
                    let frags = held.remove(&key).expect("held");
                    alloc
                        .free(FragNumber(key), frags * geo.fsize, InodeNumber(5))
                        .expect("free");
                }
            }
        }

        let report = alloc.check().expect("check");
        prop_assert!(report.is_clean(), "{:?}", report.problems);

        for (start, frags) in std::mem::take(&mut held) {
            alloc.free(FragNumber(start), frags * geo.fsize, InodeNumber(5)).expect("free");
        }
        prop_assert_eq!(alloc.total(), initial);
        prop_assert!(alloc.check().expect("check").is_clean());
    }

    #[test]
    fn inode_allocation_round_trips(count in 1_usize..90) {
        let alloc = setup(3);
        let initial = alloc.total();
        let mut inodes = Vec::new();
        for i in 0..count {
            let mode = if i % 5 == 0 { ufs_types::S_IFDIR } else { ufs_types::S_IFREG };
            let ino = alloc.valloc(InodeNumber::ROOT, mode).expect("valloc");
            prop_assert!(!inodes.iter().any(|(seen, _)| *seen == ino));
            inodes.push((ino, i % 5 == 0));
        }
        prop_assert_eq!(alloc.total().nifree, initial.nifree - count as u64);
        for (ino, is_dir) in inodes {
            alloc.vfree(ino, is_dir).expect("vfree");
        }
        prop_assert_eq!(alloc.total(), initial);
        prop_assert!(alloc.check().expect("check").is_clean());
    }
}

#[test]
fn summary_tracks_groups_under_concurrent_allocation() {
    let alloc = setup(3);
    let initial = alloc.total();
    let fsize = alloc.geometry().fsize;
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let workers: Vec<_> = (0..2_u32)
            .map(|t| {
                let alloc = &alloc;
                s.spawn(move || {
                    let mut held = std::collections::VecDeque::new();
                    for i in 0..300_u32 {
                        let size = (1 + (i + t) % 8) * fsize;
                        let addr = alloc
                            .alloc(InodeNumber(5), size, AllocHint::default())
                            .expect("alloc");
                        held.push_back((addr, size));
                        if held.len() > 6 {
                            let (addr, size) = held.pop_front().expect("held");
                            alloc.free(addr, size, InodeNumber(5)).expect("free");
                        }
                    }
                    for (addr, size) in held {
                        alloc.free(addr, size, InodeNumber(5)).expect("free");
                    }
                })
            })
            .collect();

        let (alloc, done) = (&alloc, &done);
        let checker = s.spawn(move || {
            let mut rounds = 0_u32;
            while !done.load(Ordering::Acquire) || rounds == 0 {
                let report = alloc.check().expect("check");
                assert!(report.is_clean(), "{:?}", report.problems);
                rounds += 1;
            }
        });

        for worker in workers {
            worker.join().expect("worker");
        }
        done.store(true, Ordering::Release);
        checker.join().expect("checker");
    });

    assert_eq!(alloc.total(), initial);
    let sum: u64 = (0..3)
        .filter_map(|cg| alloc.group_summary(GroupNumber(cg)))
        .map(|cs| u64::from(cs.nbfree))
        .sum();
    assert_eq!(sum, initial.nbfree);
    assert!(alloc.check().expect("check").is_clean());
}
