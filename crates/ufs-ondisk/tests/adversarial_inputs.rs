#![forbid(unsafe_code)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use ufs_ondisk::{CylinderGroup, DiskInode, Geometry, GeometryParams, Superblock};
use ufs_types::{ByteOrder, GroupNumber, ParseError};

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    invalid_magic: u32,
    invalid_field: u32,
    integer_conversion: u32,
    accepted: u32,
}

impl ErrorCoverage {
    fn observe<T>(&mut self, result: &Result<T, ParseError>) {
        match result {
            Ok(_) => self.accepted += 1,
            Err(ParseError::InsufficientData { .. }) => self.insufficient_data += 1,
            Err(ParseError::InvalidMagic { .. }) => self.invalid_magic += 1,
            Err(ParseError::InvalidField { .. }) => self.invalid_field += 1,
            Err(ParseError::IntegerConversion { .. }) => self.integer_conversion += 1,
        }
    }
}

fn geometry() -> Geometry {
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

/// Deterministic xorshift so the mutation set is stable between runs.
fn next(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

fn mutations(seed_block: &[u8], count: usize) -> Vec<Vec<u8>> {
    let mut state = 0x9E37_79B9_7F4A_7C15_u64;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let mut block = seed_block.to_vec();
        match i % 3 {
            0 => {
                let cut = usize::try_from(next(&mut state) % seed_block.len() as u64).expect("cut");
                block.truncate(cut);
            }
            1 => {
                for _ in 0..8 {
                    let pos = usize::try_from(next(&mut state) % 0x100).expect("pos");
                    block[pos] ^= 1 << (next(&mut state) % 8);
                }
            }
            _ => {
                let pos = usize::try_from(next(&mut state) % 0xD0).expect("pos");
                block[pos..pos + 4].copy_from_slice(&u32::MAX.to_le_bytes());
            }
        }
        out.push(block);
    }
    out
}

#[test]
fn mutated_superblocks_never_panic() {
    let geo = geometry();
    let seed = Superblock::new(&geo).to_block().expect("encode");
    let mut coverage = ErrorCoverage::default();

    for sample in mutations(&seed, 600) {
        let result = catch_unwind(AssertUnwindSafe(|| Superblock::parse(&sample)))
            .expect("superblock parser panicked");
        if let Ok(sb) = &result {
            let _ = catch_unwind(AssertUnwindSafe(|| sb.geometry()))
                .expect("geometry validation panicked");
        }
        coverage.observe(&result);
    }

    assert!(coverage.insufficient_data > 0, "{coverage:?}");
    assert!(coverage.invalid_magic > 0, "{coverage:?}");
    assert!(coverage.accepted > 0, "{coverage:?}");
}

#[test]
fn mutated_cylinder_groups_never_panic() {
    let geo = geometry();
    let seed = CylinderGroup::empty(&geo, GroupNumber(1))
        .to_block(&geo)
        .expect("encode");
    let mut coverage = ErrorCoverage::default();

    for sample in mutations(&seed, 600) {
        let result = catch_unwind(AssertUnwindSafe(|| CylinderGroup::parse(&geo, &sample)))
            .expect("cylinder group parser panicked");
        coverage.observe(&result);
    }

    assert!(coverage.insufficient_data > 0, "{coverage:?}");
    assert!(coverage.invalid_magic > 0, "{coverage:?}");
}

#[test]
fn truncated_inodes_are_rejected_not_panicking() {
    let mut slot = [0_u8; 256];
    DiskInode::new(0o100_644)
        .write_to(ByteOrder::Big, &mut slot)
        .expect("encode");
    for len in 0..256 {
        let result = catch_unwind(AssertUnwindSafe(|| {
            DiskInode::parse(ByteOrder::Big, &slot[..len])
        }))
        .expect("inode parser panicked");
        assert!(result.is_err(), "accepted {len}-byte inode");
    }
}
