//! End-to-end scenarios across the allocator core, bin directory, block
//! pool, and chunk registry, plus randomized property tests driving a
//! shadow model of the live allocations.

#[cfg(test)]
mod tests {
    use crate::tlsf::provider::{FixedChunkProvider, TEST_CHUNK_BASE};
    use crate::{Allocation, TlsfAllocator, TlsfConfig};
    use quickcheck_macros::quickcheck;

    fn new_alloc(alignment: u32, chunk_size: u32) -> TlsfAllocator<FixedChunkProvider> {
        let _ = env_logger::builder().is_test(true).try_init();
        TlsfAllocator::with_config(
            FixedChunkProvider::new(chunk_size),
            TlsfConfig {
                alignment,
                ..TlsfConfig::default()
            },
        )
        .unwrap()
    }

    fn dump_string(alloc: &TlsfAllocator<FixedChunkProvider>) -> String {
        let mut out = String::new();
        alloc.dump(&mut out).unwrap();
        out
    }

    // --- Scenario 1: single allocate/free ---

    #[test]
    fn test_scenario_single_allocate_free() {
        let mut alloc = new_alloc(64, 65536);

        let a = alloc.allocate(512).unwrap();
        assert_eq!(a.address, 0xFE00_1200_0000_0000);
        assert_eq!(a.size, 512);
        assert_eq!(alloc.chunks().len(), 1);
        alloc.check_invariants();
        assert_eq!(
            dump_string(&alloc),
            "\
alignment 64
chunk 0: id 0x1 base 0xfe00120000000000 size 65536 allocated 512 used 1 free 1
l1 bitmap 0000000000000000100000
bin (5,15) [63488..65536): head 0
[0] chunk 0 offset 512 size 65024 Free free -1/-1 phys 1/-1
[1] chunk 0 offset 0 size 512 Used free -1/-1 phys -1/0
"
        );

        alloc.free(a.token);
        let chunk = &alloc.chunks()[0];
        assert_eq!(chunk.used_blocks(), 0);
        assert_eq!(chunk.free_blocks(), 1);
        alloc.check_invariants();
        assert_eq!(
            dump_string(&alloc),
            "\
alignment 64
chunk 0: id 0x1 base 0xfe00120000000000 size 65536 allocated 0 used 0 free 1
l1 bitmap 0000000000000001000000
bin (6,0) [65536..69632): head 1
[0] Avail
[1] chunk 0 offset 0 size 65536 Free free -1/-1 phys -1/-1
"
        );
    }

    // --- Scenario 2: three allocations at alignment 1024 ---

    #[test]
    fn test_scenario_alignment_1024_rounding() {
        let mut alloc = new_alloc(1024, 65536);

        let a = alloc.allocate(512).unwrap();
        let b = alloc.allocate(1024).unwrap();
        // 1025 first rounds up to the 1024 alignment, landing on 2048.
        let c = alloc.allocate(1025).unwrap();

        assert_eq!((a.size, b.size, c.size), (1024, 1024, 2048));
        assert_eq!(a.address, TEST_CHUNK_BASE);
        assert_eq!(b.address, TEST_CHUNK_BASE + 1024);
        assert_eq!(c.address, TEST_CHUNK_BASE + 2048);
        alloc.check_invariants();
        assert_eq!(
            dump_string(&alloc),
            "\
alignment 1024
chunk 0: id 0x1 base 0xfe00120000000000 size 65536 allocated 4096 used 3 free 1
l1 bitmap 0000000000000000100000
bin (5,14) [61440..63488): head 0
[0] chunk 0 offset 4096 size 61440 Free free -1/-1 phys 3/-1
[1] chunk 0 offset 0 size 1024 Used free -1/-1 phys -1/2
[2] chunk 0 offset 1024 size 1024 Used free -1/-1 phys 1/3
[3] chunk 0 offset 2048 size 2048 Used free -1/-1 phys 2/0
"
        );
    }

    // --- Scenario 3: request larger than the provider's base chunk size ---

    #[test]
    fn test_scenario_chunk_overflow() {
        let mut alloc = new_alloc(64, 65536);

        let a = alloc.allocate(65541).unwrap();
        // The provider was asked for at least the rounded request and
        // answered with the next power of two.
        assert!(alloc.provider().allocations[0] >= 65541);
        assert_eq!(alloc.chunks().len(), 1);
        assert_eq!(alloc.chunks()[0].size(), 131072);
        assert_eq!(a.size, 65600);
        assert_eq!(a.address, TEST_CHUNK_BASE);
        alloc.check_invariants();
        assert_eq!(
            dump_string(&alloc),
            "\
alignment 64
chunk 0: id 0x1 base 0xfe00120000000000 size 131072 allocated 65600 used 1 free 1
l1 bitmap 0000000000000000100000
bin (5,15) [63488..65536): head 0
[0] chunk 0 offset 65600 size 65472 Free free -1/-1 phys 1/-1
[1] chunk 0 offset 0 size 65600 Used free -1/-1 phys -1/0
"
        );
    }

    // --- Scenario 4: a bin head that is too small forces a second chunk ---

    #[test]
    fn test_scenario_second_chunk_forcing() {
        let mut alloc = new_alloc(64, 65536);

        let a = alloc.allocate(960).unwrap();
        assert_eq!(a.size, 960);
        // The first chunk retains 65536 - 960 = 64576 free bytes. The next
        // request shares that block's bin but does not fit it.
        let b = alloc.allocate(65471).unwrap();
        assert_eq!(b.size, 65472);
        assert_eq!(alloc.chunks().len(), 2);
        assert_eq!(b.chunk_id, 2);
        assert_eq!(b.address, TEST_CHUNK_BASE + 65536);
        alloc.check_invariants();
        assert_eq!(
            dump_string(&alloc),
            "\
alignment 64
chunk 0: id 0x1 base 0xfe00120000000000 size 65536 allocated 960 used 1 free 1
chunk 1: id 0x2 base 0xfe00120000010000 size 65536 allocated 65472 used 1 free 1
l1 bitmap 0000000000000000100001
bin (0,0) [0..2048): head 2
bin (5,15) [63488..65536): head 0
[0] chunk 0 offset 960 size 64576 Free free -1/-1 phys 1/-1
[1] chunk 0 offset 0 size 960 Used free -1/-1 phys -1/0
[2] chunk 1 offset 65472 size 64 Free free -1/-1 phys 3/-1
[3] chunk 1 offset 0 size 65472 Used free -1/-1 phys -1/2
"
        );
    }

    // --- Scenario 5: interleaved free and coalesce ---

    #[test]
    fn test_scenario_interleaved_free_coalesce() {
        let mut alloc = new_alloc(64, 65536);

        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        let c = alloc.allocate(64).unwrap();
        let d = alloc.allocate(64).unwrap();
        assert_eq!(b.address, a.address + 64);
        assert_eq!(c.address, b.address + 64);
        assert_eq!(d.address, c.address + 64);

        // Two holes, neither adjacent to the other.
        alloc.free(b.token);
        alloc.free(d.token);
        alloc.check_invariants();
        assert_eq!(
            dump_string(&alloc),
            "\
alignment 64
chunk 0: id 0x1 base 0xfe00120000000000 size 65536 allocated 128 used 2 free 2
l1 bitmap 0000000000000000100001
bin (0,0) [0..2048): head 2
bin (5,15) [63488..65536): head 4
[0] Avail
[1] chunk 0 offset 0 size 64 Used free -1/-1 phys -1/2
[2] chunk 0 offset 64 size 64 Free free -1/-1 phys 1/3
[3] chunk 0 offset 128 size 64 Used free -1/-1 phys 2/4
[4] chunk 0 offset 192 size 65344 Free free -1/-1 phys 3/-1
"
        );

        // Freeing the remaining blocks collapses everything into a single
        // whole-chunk free block.
        alloc.free(a.token);
        alloc.check_invariants();
        alloc.free(c.token);
        alloc.check_invariants();
        assert_eq!(
            dump_string(&alloc),
            "\
alignment 64
chunk 0: id 0x1 base 0xfe00120000000000 size 65536 allocated 0 used 0 free 1
l1 bitmap 0000000000000001000000
bin (6,0) [65536..69632): head 3
[0-2] Avail
[3] chunk 0 offset 0 size 65536 Free free -1/-1 phys -1/-1
[4] Avail
"
        );
    }

    // --- Scenario 6: reset releases chunks and is idempotent ---

    #[test]
    fn test_scenario_reset_releases_chunks() {
        let mut alloc = new_alloc(64, 65536);
        let _a = alloc.allocate(960).unwrap();
        let _b = alloc.allocate(65471).unwrap();
        assert_eq!(alloc.chunks().len(), 2);

        alloc.reset();
        assert_eq!(alloc.provider().freed, vec![1, 2]);
        assert!(alloc.chunks().is_empty());
        let empty = dump_string(&alloc);
        assert_eq!(empty, "alignment 64\nl1 bitmap 0000000000000000000000\n");

        // A second reset changes nothing and releases nothing.
        alloc.reset();
        assert_eq!(alloc.provider().freed, vec![1, 2]);
        assert_eq!(dump_string(&alloc), empty);
    }

    // --- Unaligned backing regions ---

    #[test]
    fn test_gap_absorbed_for_unaligned_base() {
        let _ = env_logger::builder().is_test(true).try_init();
        let provider = FixedChunkProvider::with_base(65536, TEST_CHUNK_BASE + 16);
        let mut alloc = TlsfAllocator::new(provider).unwrap();

        let a = alloc.allocate(100).unwrap();
        let b = alloc.allocate(100).unwrap();
        assert_eq!(a.address % 64, 0);
        assert_eq!(a.address, TEST_CHUNK_BASE + 64);
        assert_eq!(b.address, a.address + 128);
        alloc.check_invariants();

        alloc.free(a.token);
        alloc.free(b.token);
        alloc.check_invariants();
        let chunk = &alloc.chunks()[0];
        assert_eq!(chunk.used_blocks(), 0);
        assert_eq!(chunk.free_blocks(), 1);
    }

    // --- Randomized properties ---

    #[quickcheck]
    fn qc_live_allocations_stay_disjoint_and_aligned(ops: Vec<(u32, bool)>) {
        let mut alloc = new_alloc(64, 65536);
        let mut live: Vec<Allocation> = Vec::new();

        for (raw, do_free) in ops {
            if do_free && !live.is_empty() {
                let victim = live.swap_remove(raw as usize % live.len());
                alloc.free(victim.token);
            } else {
                let size = raw % (128 * 1024) + 1;
                let a = alloc.allocate(size).unwrap();
                assert_eq!(a.address % 64, 0, "unaligned address for size {size}");
                assert_eq!(a.size % 64, 0, "unaligned granted size for size {size}");
                assert!(a.size >= size);
                live.push(a);
            }
            alloc.check_invariants();
        }

        live.sort_by_key(|a| a.address);
        for pair in live.windows(2) {
            assert!(
                pair[0].address + u64::from(pair[0].size) <= pair[1].address,
                "overlapping allocations at {:#x} and {:#x}",
                pair[0].address,
                pair[1].address
            );
        }

        // Freeing everything must collapse each chunk back into a single
        // free block spanning its usable extent.
        for a in live {
            alloc.free(a.token);
        }
        alloc.check_invariants();
        for chunk in alloc.chunks() {
            assert_eq!(chunk.used_blocks(), 0);
            assert_eq!(chunk.free_blocks(), 1);
            assert_eq!(chunk.allocated(), 0);
        }
    }

    #[quickcheck]
    fn qc_granted_size_matches_aligned_request(raw: u32) {
        let mut alloc = new_alloc(1024, 65536);
        let size = raw % (1 << 20) + 1;
        let a = alloc.allocate(size).unwrap();
        assert_eq!(a.size, size.next_multiple_of(1024));
        assert_eq!(a.address % 1024, 0);
        alloc.check_invariants();
    }

    #[quickcheck]
    fn qc_reset_is_idempotent(sizes: Vec<u32>) {
        let mut alloc = new_alloc(64, 65536);
        for raw in sizes {
            alloc.allocate(raw % 70000 + 1).unwrap();
        }
        alloc.reset();
        let snapshot = dump_string(&alloc);
        let released = alloc.provider().freed.len();

        alloc.reset();
        assert_eq!(dump_string(&alloc), snapshot);
        assert_eq!(alloc.provider().freed.len(), released);
        alloc.check_invariants();
    }
}
