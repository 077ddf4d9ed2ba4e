//! Benchmark: table-driven free-run search vs bit-at-a-time scan, and
//! whole-group allocate/free cycles.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ufs_alloc::bitmap::{find_clear_bit, find_run, find_run_linear};
use ufs_alloc::{CgView, init_group};
use ufs_ondisk::{Geometry, GeometryParams};
use ufs_types::{ByteOrder, GroupNumber};

const NBITS: u32 = 32_768;

/// A mostly allocated fragment map: one 3-fragment hole every ~700
/// fragments, and the only 5-fragment hole near the end.
fn make_map() -> Vec<u8> {
    let mut map = vec![0_u8; (NBITS / 8) as usize];
    let mut blk = 10_u32;
    while (blk + 1) * 8 < NBITS {
        map[blk as usize] = 0b0000_0111;
        blk += 87;
    }
    map[4000] = 0b0001_1111;
    map
}

fn bench_find_run(c: &mut Criterion) {
    let map = make_map();
    let mut group = c.benchmark_group("find_run");

    group.bench_function("table", |b| {
        b.iter(|| black_box(find_run(black_box(&map), NBITS, 8, 5, 0)));
    });

    group.bench_function("linear", |b| {
        b.iter(|| black_box(find_run_linear(black_box(&map), NBITS, 8, 5)));
    });

    group.finish();
}

fn bench_find_clear_bit(c: &mut Criterion) {
    let mut map = vec![0xFF_u8; 8192];
    map[6000] = 0xEF;
    c.bench_function("find_clear_bit", |b| {
        b.iter(|| black_box(find_clear_bit(black_box(&map), 65_536, black_box(100))));
    });
}

fn bench_group_cycle(c: &mut Criterion) {
    let geo = Geometry::new(GeometryParams {
        bsize: 32_768,
        fsize: 4096,
        fpg: 65_536,
        ipg: 2048,
        ncg: 1,
        size: 65_536,
        order: ByteOrder::Little,
    })
    .expect("geometry");
    let template = init_group(&geo, GroupNumber(0), 16);

    c.bench_function("group_alloc_free_cycle", |b| {
        b.iter(|| {
            let mut cg = template.clone();
            let mut view = CgView::new(&geo, &mut cg, 16);
            let mut held = Vec::with_capacity(64);
            for i in 0..64_u32 {
                let frags = 1 + i % geo.frag;
                if let Ok(Some((bno, _))) = view.alloc(None, frags) {
                    held.push((bno, frags));
                }
            }
            for (bno, frags) in held {
                let _ = black_box(view.free(bno, frags));
            }
        });
    });
}

criterion_group!(benches, bench_find_run, bench_find_clear_bit, bench_group_cycle);
criterion_main!(benches);
