//! Bit-level primitives over cylinder-group maps.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8`. In the fragment map a
//! set bit means free; in the inode map a set bit means in use.
//!
//! [`RUN_TABLE`] answers "which free-run lengths does this map byte contain"
//! in one lookup, so [`find_run`] can skip whole bytes instead of testing
//! bits one at a time.

use ufs_error::{Result, UfsError};

/// Test bit `i`.
#[must_use]
#[inline]
pub fn isset(map: &[u8], i: u32) -> bool {
    map.get((i / 8) as usize)
        .is_some_and(|byte| byte & (1 << (i % 8)) != 0)
}

#[inline]
pub fn setbit(map: &mut [u8], i: u32) {
    if let Some(byte) = map.get_mut((i / 8) as usize) {
        *byte |= 1 << (i % 8);
    }
}

#[inline]
pub fn clrbit(map: &mut [u8], i: u32) {
    if let Some(byte) = map.get_mut((i / 8) as usize) {
        *byte &= !(1 << (i % 8));
    }
}

/// Mask covering the low `frag` bits.
#[must_use]
#[inline]
#[expect(clippy::cast_possible_truncation)]
pub fn full_mask(frag: u32) -> u8 {
    ((1_u16 << frag) - 1) as u8
}

/// The `frag` bits of block `blkno` (block-relative fragment map).
#[must_use]
#[inline]
pub fn blkmap(map: &[u8], frag: u32, blkno: u32) -> u8 {
    let base = blkno * frag;
    let byte = map.get((base / 8) as usize).copied().unwrap_or(0);
    (byte >> (base % 8)) & full_mask(frag)
}

/// Every fragment of block `blkno` is free.
#[must_use]
#[inline]
pub fn isblock(map: &[u8], frag: u32, blkno: u32) -> bool {
    blkmap(map, frag, blkno) == full_mask(frag)
}

/// Every fragment of block `blkno` is allocated.
#[must_use]
#[inline]
pub fn isfreeblock_clear(map: &[u8], frag: u32, blkno: u32) -> bool {
    blkmap(map, frag, blkno) == 0
}

/// Mark every fragment of block `blkno` free.
#[inline]
pub fn setblock(map: &mut [u8], frag: u32, blkno: u32) {
    let base = blkno * frag;
    if let Some(byte) = map.get_mut((base / 8) as usize) {
        *byte |= full_mask(frag) << (base % 8);
    }
}

/// Mark every fragment of block `blkno` allocated.
#[inline]
pub fn clrblock(map: &mut [u8], frag: u32, blkno: u32) {
    let base = blkno * frag;
    if let Some(byte) = map.get_mut((base / 8) as usize) {
        *byte &= !(full_mask(frag) << (base % 8));
    }
}

/// Number of set bits among the first `nbits`.
#[must_use]
pub fn count_set(map: &[u8], nbits: u32) -> u32 {
    (0..nbits).filter(|&i| isset(map, i)).count() as u32
}

// ── Free-run table ──────────────────────────────────────────────────────────

const fn run_table(frag: u32) -> [u8; 256] {
    let mut table = [0_u8; 256];
    let mut byte = 0_usize;
    while byte < 256 {
        let mut mask = 0_u8;
        let mut base = 0_u32;
        while base < 8 {
            let mut run = 0_u32;
            let mut i = 0_u32;
            while i < frag {
                if byte & (1 << (base + i)) != 0 {
                    run += 1;
                } else {
                    if run > 0 {
                        mask |= 1 << (run - 1);
                    }
                    run = 0;
                }
                i += 1;
            }
            if run > 0 {
                mask |= 1 << (run - 1);
            }
            base += frag;
        }
        table[byte] = mask;
        byte += 1;
    }
    table
}

/// `RUN_TABLE[log2(frag)][byte]` has bit `n - 1` set when some block inside
/// `byte` holds a maximal free run of exactly `n` fragments.
pub const RUN_TABLE: [[u8; 256]; 4] = [run_table(1), run_table(2), run_table(4), run_table(8)];

#[must_use]
#[inline]
fn table_for(frag: u32) -> &'static [u8; 256] {
    &RUN_TABLE[frag.trailing_zeros() as usize]
}

/// Start offset of a maximal free run of exactly `len` fragments inside the
/// `frag`-bit block map `blk`.
#[must_use]
pub fn run_in_block(blk: u8, frag: u32, len: u32) -> Option<u32> {
    let mut pos = 0;
    while pos + len <= frag {
        let run_mask = full_mask(len) << pos;
        let before_used = pos == 0 || blk & (1 << (pos - 1)) == 0;
        let after_used = pos + len == frag || blk & (1 << (pos + len)) == 0;
        if blk & run_mask == run_mask && before_used && after_used {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

/// Find a maximal free run of exactly `len` fragments in a fragment map of
/// `nbits` bits, scanning bytes from `start_byte` and wrapping once.
///
/// Returns `(fragment offset, byte where the search stopped)`.
#[must_use]
pub fn find_run(map: &[u8], nbits: u32, frag: u32, len: u32, start_byte: u32) -> Option<(u32, u32)> {
    let table = table_for(frag);
    let nbytes = nbits.div_ceil(8).min(u32::try_from(map.len()).unwrap_or(u32::MAX));
    if nbytes == 0 || len == 0 || len > frag {
        return None;
    }
    let want = 1_u8 << (len - 1);
    let start = if start_byte >= nbytes { 0 } else { start_byte };

    for b in (start..nbytes).chain(0..start) {
        let byte = map[b as usize];
        if table[usize::from(byte)] & want == 0 {
            continue;
        }
        let first_block = b * 8 / frag;
        for blkno in first_block..first_block + 8 / frag.min(8) {
            if (blkno + 1) * frag > nbits {
                break;
            }
            if let Some(pos) = run_in_block(blkmap(map, frag, blkno), frag, len) {
                return Some((blkno * frag + pos, b));
            }
        }
    }
    None
}

/// Bit-at-a-time equivalent of [`find_run`], kept for comparison.
#[must_use]
pub fn find_run_linear(map: &[u8], nbits: u32, frag: u32, len: u32) -> Option<u32> {
    let mut blkno = 0;
    while (blkno + 1) * frag <= nbits {
        let mut run_start = 0;
        let mut run = 0;
        for i in 0..frag {
            if isset(map, blkno * frag + i) {
                if run == 0 {
                    run_start = i;
                }
                run += 1;
            } else {
                if run == len {
                    return Some(blkno * frag + run_start);
                }
                run = 0;
            }
        }
        if run == len {
            return Some(blkno * frag + run_start);
        }
        blkno += 1;
    }
    None
}

/// First clear bit among `nbits`, scanning bytes from `start_bit / 8` and
/// wrapping once.
#[must_use]
pub fn find_clear_bit(map: &[u8], nbits: u32, start_bit: u32) -> Option<u32> {
    let nbytes = nbits.div_ceil(8).min(u32::try_from(map.len()).unwrap_or(u32::MAX));
    if nbytes == 0 {
        return None;
    }
    let start = (start_bit / 8).min(nbytes - 1);
    for b in (start..nbytes).chain(0..start) {
        let byte = map[b as usize];
        if byte == 0xFF {
            continue;
        }
        let idx = b * 8 + byte.trailing_ones();
        if idx < nbits {
            return Some(idx);
        }
    }
    None
}

/// Add `cnt` to `hist[n]`. A slot that would leave the `u32` range means
/// the histogram no longer matches the map it summarizes.
pub fn bump(hist: &mut [u32], n: u32, cnt: i32, block: u64) -> Result<()> {
    let slot = hist
        .get_mut(n as usize)
        .ok_or_else(|| UfsError::invariant(block, format!("histogram has no slot {n}")))?;
    *slot = slot.checked_add_signed(cnt).ok_or_else(|| {
        UfsError::invariant(block, format!("histogram slot {n} out of range: {slot} {cnt:+}"))
    })?;
    Ok(())
}

/// Add `cnt` to `frsum[n]` for every maximal free run of `n < frag`
/// fragments in block map `blk`.
pub fn fragacct(frag: u32, blk: u8, frsum: &mut [u32], cnt: i32, block: u64) -> Result<()> {
    let mut run = 0_u32;
    for i in 0..=frag {
        if i < frag && blk & (1 << i) != 0 {
            run += 1;
            continue;
        }
        if run > 0 && run < frag {
            bump(frsum, run, cnt, block)?;
        }
        run = 0;
    }
    Ok(())
}
