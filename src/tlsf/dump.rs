//! Deterministic text snapshot of the allocator state.
//!
//! The format is fixed; integration tests match it byte for byte. One line
//! for the alignment, one per chunk, the first-level bitmap in binary, one
//! line per populated bin, then one row per block descriptor with runs of
//! recycled descriptors collapsed.

use std::fmt;

use super::bins::BinDirectory;
use super::blocks::{BlockPool, BlockStatus, NIL};
use super::chunks::ChunkDesc;
use super::mapping::{self, L1_COUNT, L2_COUNT};

/// Render a link field the way the descriptors think of it: `-1` marks the
/// end of a list.
fn link(idx: u32) -> i64 {
    if idx == NIL {
        -1
    } else {
        i64::from(idx)
    }
}

pub(crate) fn write_dump<W: fmt::Write>(
    alignment: u32,
    chunks: &[ChunkDesc],
    blocks: &BlockPool,
    bins: &BinDirectory,
    out: &mut W,
) -> fmt::Result {
    writeln!(out, "alignment {alignment}")?;

    for (i, c) in chunks.iter().enumerate() {
        writeln!(
            out,
            "chunk {i}: id {:#x} base {:#x} size {} allocated {} used {} free {}",
            c.id, c.base, c.size, c.allocated, c.used_blocks, c.free_blocks
        )?;
    }

    writeln!(out, "l1 bitmap {:022b}", bins.l1_bitmap())?;

    for l1 in 0..L1_COUNT as u32 {
        for l2 in 0..L2_COUNT as u32 {
            let head = bins.head(l1, l2);
            if head != NIL {
                let (lo, hi) = mapping::bin_range(l1, l2);
                writeln!(out, "bin ({l1},{l2}) [{lo}..{hi}): head {head}")?;
            }
        }
    }

    let n = blocks.len() as u32;
    let mut idx = 0u32;
    while idx < n {
        let b = &blocks[idx];
        if b.status == BlockStatus::Available {
            let start = idx;
            while idx + 1 < n && blocks[idx + 1].status == BlockStatus::Available {
                idx += 1;
            }
            if start == idx {
                writeln!(out, "[{start}] Avail")?;
            } else {
                writeln!(out, "[{start}-{idx}] Avail")?;
            }
        } else {
            let status = if b.status == BlockStatus::Used {
                "Used"
            } else {
                "Free"
            };
            writeln!(
                out,
                "[{idx}] chunk {} offset {} size {} {status} free {}/{} phys {}/{}",
                b.chunk,
                b.offset,
                b.size,
                link(b.prev_free),
                link(b.next_free),
                link(b.prev_phys),
                link(b.next_phys)
            )?;
        }
        idx += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_state_dump() {
        let blocks = BlockPool::with_capacity(0);
        let bins = BinDirectory::new();
        let mut out = String::new();
        write_dump(64, &[], &blocks, &bins, &mut out).unwrap();
        assert_eq!(out, "alignment 64\nl1 bitmap 0000000000000000000000\n");
    }

    #[test]
    fn test_link_rendering() {
        assert_eq!(link(NIL), -1);
        assert_eq!(link(0), 0);
        assert_eq!(link(41), 41);
    }
}
