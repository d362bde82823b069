//! The allocator core: bin search, split, coalesce, chunk acquisition.
//!
//! Single-threaded by design. Callers that need cross-thread use wrap the
//! allocator in a mutex; per-thread instances are the intended concurrency
//! story.

use std::fmt;

use super::bins::BinDirectory;
use super::blocks::{BlockDesc, BlockPool, BlockStatus, NIL};
use super::chunks::ChunkDesc;
use super::dump;
use super::error::TlsfError;
use super::mapping::{self, L1_COUNT, L2_COUNT, MIN_ALIGNMENT};
use super::provider::ChunkProvider;

/// Configuration for [`TlsfAllocator`]. All fields have sensible defaults.
/// Set at init time via [`TlsfAllocator::with_config`].
#[derive(Clone, Debug)]
pub struct TlsfConfig {
    /// Allocation alignment in bytes. Must be a power of two; values below
    /// [`MIN_ALIGNMENT`] are clamped up to it. Default: 64.
    pub alignment: u32,

    /// Initial capacity of the chunk registry. Default: 8.
    pub chunk_capacity: usize,

    /// Initial capacity of the block descriptor pool. Default: 128.
    pub block_capacity: usize,
}

impl Default for TlsfConfig {
    fn default() -> Self {
        Self {
            alignment: MIN_ALIGNMENT,
            chunk_capacity: 8,
            block_capacity: 128,
        }
    }
}

/// Opaque handle identifying a live allocation. Pass back to
/// [`TlsfAllocator::free`] exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocToken(pub(crate) u32);

/// A successful allocation.
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
    pub token: AllocToken,
    /// Identifier of the chunk the block lives in, as assigned by the
    /// provider.
    pub chunk_id: u64,
    /// Address of the block. Always a multiple of the configured alignment.
    pub address: u64,
    /// Granted size in bytes, at least the requested size rounded up to the
    /// alignment.
    pub size: u32,
}

/// Aggregate snapshot of allocator state, for diagnostic display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsfStats {
    pub chunk_count: usize,
    /// Live block descriptors (used + free).
    pub block_count: usize,
    /// Descriptor slots on the recycle list.
    pub available_blocks: usize,
    pub allocated_bytes: u64,
    pub capacity_bytes: u64,
}

/// Two-level segregated fit allocator over externally supplied chunks.
///
/// Block metadata lives out-of-band in regular memory; the backing regions
/// are only ever described by 64-bit addresses, so they need not be CPU
/// accessible.
pub struct TlsfAllocator<P: ChunkProvider> {
    provider: P,
    alignment: u32,
    pub(crate) chunks: Vec<ChunkDesc>,
    pub(crate) blocks: BlockPool,
    pub(crate) bins: BinDirectory,
}

impl<P: ChunkProvider> TlsfAllocator<P> {
    /// Create an allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `TlsfError` if the configuration is invalid.
    pub fn new(provider: P) -> Result<Self, TlsfError> {
        Self::with_config(provider, TlsfConfig::default())
    }

    /// Create an allocator with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TlsfError::InvalidAlignment`] if the alignment is not a
    /// power of two.
    pub fn with_config(provider: P, config: TlsfConfig) -> Result<Self, TlsfError> {
        if !config.alignment.is_power_of_two() {
            return Err(TlsfError::InvalidAlignment {
                alignment: config.alignment,
            });
        }
        Ok(Self {
            provider,
            alignment: config.alignment.max(MIN_ALIGNMENT),
            chunks: Vec::with_capacity(config.chunk_capacity),
            blocks: BlockPool::with_capacity(config.block_capacity),
            bins: BinDirectory::new(),
        })
    }

    /// Effective allocation alignment in bytes.
    #[must_use]
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Shared access to the injected chunk provider.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Exclusive access to the injected chunk provider.
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Read-only view of the chunk registry.
    #[must_use]
    pub fn chunks(&self) -> &[ChunkDesc] {
        &self.chunks
    }

    /// Aggregate counters across all chunks and the descriptor pool.
    #[must_use]
    pub fn stats(&self) -> TlsfStats {
        let mut allocated = 0u64;
        let mut capacity = 0u64;
        for chunk in &self.chunks {
            allocated += u64::from(chunk.allocated);
            capacity += u64::from(chunk.size);
        }
        TlsfStats {
            chunk_count: self.chunks.len(),
            block_count: self.blocks.len() - self.blocks.available(),
            available_blocks: self.blocks.available(),
            allocated_bytes: allocated,
            capacity_bytes: capacity,
        }
    }

    /// Allocate `size` bytes.
    ///
    /// The request is rounded up to the configured alignment; the granted
    /// size and address are both alignment multiples. The bin search is
    /// O(1); at most one chunk acquisition is delegated to the provider.
    ///
    /// # Errors
    ///
    /// Returns [`TlsfError::ChunkAllocationFailed`] when no free block fits
    /// and the provider refuses to supply a chunk, leaving the allocator
    /// state untouched. Returns [`TlsfError::RequestTooLarge`] when the
    /// rounded request leaves 32-bit range.
    pub fn allocate(&mut self, size: u32) -> Result<Allocation, TlsfError> {
        debug_assert!(size > 0, "allocate: size must be non-zero");
        let aligned = mapping::align_up(u64::from(size.max(1)), u64::from(self.alignment));
        if aligned > u64::from(u32::MAX) {
            return Err(TlsfError::RequestTooLarge { size: aligned });
        }
        let aligned = aligned as u32;

        let block = loop {
            if let Some(found) = self.find_suitable(aligned) {
                break found;
            }
            self.acquire_chunk(aligned)?;
        };
        self.remove_free_block(block);

        let surplus = self.blocks[block].size - aligned;
        let token_idx = if surplus == 0 {
            // Consume the whole block.
            let chunk_idx = self.blocks[block].chunk;
            self.blocks[block].status = BlockStatus::Used;
            let chunk = &mut self.chunks[chunk_idx as usize];
            chunk.allocated += aligned;
            chunk.used_blocks += 1;
            chunk.free_blocks -= 1;
            block
        } else {
            // The found descriptor stays Free and becomes the remainder; a
            // fresh descriptor takes the used region and is spliced in
            // front of it in address order.
            let (chunk_idx, old_offset, prev_phys) = {
                let b = &self.blocks[block];
                (b.chunk, b.offset, b.prev_phys)
            };
            let used = self.blocks.acquire(BlockDesc {
                chunk: chunk_idx,
                offset: old_offset,
                size: aligned,
                status: BlockStatus::Used,
                prev_free: NIL,
                next_free: NIL,
                prev_phys,
                next_phys: block,
            });
            let remainder = &mut self.blocks[block];
            remainder.offset = old_offset + aligned;
            remainder.size = surplus;
            remainder.prev_phys = used;
            if prev_phys != NIL {
                self.blocks[prev_phys].next_phys = used;
            } else {
                self.chunks[chunk_idx as usize].first_block = used;
            }
            // The remainder may have changed class; re-file it.
            self.insert_free_block(block);
            let chunk = &mut self.chunks[chunk_idx as usize];
            chunk.allocated += aligned;
            chunk.used_blocks += 1;
            used
        };

        let b = &self.blocks[token_idx];
        let chunk = &self.chunks[b.chunk as usize];
        Ok(Allocation {
            token: AllocToken(token_idx),
            chunk_id: chunk.id,
            address: chunk.base + u64::from(b.offset),
            size: aligned,
        })
    }

    /// Return an allocation to the allocator.
    ///
    /// The block is eagerly coalesced with whichever physical neighbours
    /// are free, then filed into the bin for its final size.
    ///
    /// Freeing a token twice, a token from another allocator instance, or a
    /// token from before a [`reset`](Self::reset) is a programming error:
    /// debug builds assert, release builds silently corrupt state.
    pub fn free(&mut self, token: AllocToken) {
        let idx = token.0;
        debug_assert!(
            (idx as usize) < self.blocks.len(),
            "free: token {idx} is out of range"
        );
        debug_assert!(
            self.blocks[idx].status == BlockStatus::Used,
            "free: token {idx} does not reference a live allocation (double free?)"
        );

        let chunk_idx = self.blocks[idx].chunk;
        {
            let size = self.blocks[idx].size;
            self.blocks[idx].status = BlockStatus::Free;
            let chunk = &mut self.chunks[chunk_idx as usize];
            chunk.allocated -= size;
            chunk.used_blocks -= 1;
            chunk.free_blocks += 1;
        }

        // Coalesce with the physical predecessor. The neighbour's neighbour
        // is necessarily Used, so one merge per side suffices.
        let prev = self.blocks[idx].prev_phys;
        if prev != NIL && self.blocks[prev].status == BlockStatus::Free {
            self.remove_free_block(prev);
            let (p_offset, p_size, p_prev) = {
                let p = &self.blocks[prev];
                (p.offset, p.size, p.prev_phys)
            };
            let b = &mut self.blocks[idx];
            b.offset = p_offset;
            b.size += p_size;
            b.prev_phys = p_prev;
            if p_prev != NIL {
                self.blocks[p_prev].next_phys = idx;
            } else {
                self.chunks[chunk_idx as usize].first_block = idx;
            }
            self.blocks.recycle(prev);
            self.chunks[chunk_idx as usize].free_blocks -= 1;
        }

        // Coalesce with the physical successor.
        let next = self.blocks[idx].next_phys;
        if next != NIL && self.blocks[next].status == BlockStatus::Free {
            self.remove_free_block(next);
            let (n_size, n_next) = {
                let n = &self.blocks[next];
                (n.size, n.next_phys)
            };
            let b = &mut self.blocks[idx];
            b.size += n_size;
            b.next_phys = n_next;
            if n_next != NIL {
                self.blocks[n_next].prev_phys = idx;
            }
            self.blocks.recycle(next);
            self.chunks[chunk_idx as usize].free_blocks -= 1;
        }

        self.insert_free_block(idx);
    }

    /// Release every chunk back to the provider and clear all state.
    ///
    /// Outstanding tokens are invalidated. Calling `reset` on an empty
    /// allocator is a no-op.
    pub fn reset(&mut self) {
        for chunk in &self.chunks {
            log::debug!("releasing chunk id={:#x} size={}", chunk.id, chunk.size);
            self.provider.free_chunk(chunk.id);
        }
        self.chunks.clear();
        self.blocks.clear();
        self.bins.reset();
    }

    /// Write a deterministic human-readable snapshot of the allocator state.
    ///
    /// # Errors
    ///
    /// Propagates formatting errors from `out`.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        dump::write_dump(self.alignment, &self.chunks, &self.blocks, &self.bins, out)
    }

    /// Find the head of the smallest bin at or above the request's class
    /// whose head block actually fits.
    ///
    /// Class granularity is coarser than byte-exact, so the head of the
    /// request's own bin may be smaller than the request; such a bin is
    /// skipped rather than walked.
    fn find_suitable(&self, size: u32) -> Option<u32> {
        let (mut l1, mut l2) = mapping::bin_for(size);
        loop {
            let slot = match self.bins.find_next_l2(l1, l2) {
                Some(sl) => Some((l1, sl)),
                None => self.bins.find_next_l1(l1 + 1).and_then(|fl| {
                    self.bins.find_next_l2(fl, 0).map(|sl| (fl, sl))
                }),
            };
            let (fl, sl) = slot?;
            let head = self.bins.head(fl, sl);
            debug_assert!(head != NIL, "set bin ({fl},{sl}) has no head block");
            if self.blocks[head].size >= size {
                return Some(head);
            }
            l1 = fl;
            l2 = sl + 1;
            if l2 as usize == L2_COUNT {
                l1 += 1;
                l2 = 0;
            }
            if l1 as usize == L1_COUNT {
                return None;
            }
        }
    }

    /// Acquire a fresh chunk from the provider and register it as one free
    /// block. Requesting `size + alignment` (capped to the 32-bit limit)
    /// guarantees the usable extent after the alignment gap still fits the
    /// request, so the caller's retry always succeeds. The cap keeps the
    /// padding from turning an in-range request into an overflow rejection;
    /// a provider that cannot serve the capped minimum reports exhaustion.
    fn acquire_chunk(&mut self, size: u32) -> Result<(), TlsfError> {
        let min_size = u64::from(size)
            .saturating_add(u64::from(self.alignment))
            .min(u64::from(u32::MAX)) as u32;
        let Some(chunk) = self.provider.try_allocate_chunk(min_size) else {
            return Err(TlsfError::ChunkAllocationFailed { min_size });
        };
        debug_assert!(
            chunk.size >= min_size,
            "provider returned {} bytes for a {min_size}-byte request",
            chunk.size
        );
        debug_assert!(
            chunk.size.is_power_of_two(),
            "provider returned a non-power-of-two chunk size {}",
            chunk.size
        );

        let align = u64::from(self.alignment);
        let gap = ((align - (chunk.base & (align - 1))) & (align - 1)) as u32;
        let usable = chunk.size - gap;
        debug_assert!(usable >= size);
        log::debug!(
            "acquired chunk id={:#x} base={:#x} size={} gap={}",
            chunk.id,
            chunk.base,
            chunk.size,
            gap
        );

        let chunk_idx = u32::try_from(self.chunks.len()).expect("chunk registry index overflow");
        let block = self.blocks.acquire(BlockDesc {
            chunk: chunk_idx,
            offset: gap,
            size: usable,
            status: BlockStatus::Free,
            prev_free: NIL,
            next_free: NIL,
            prev_phys: NIL,
            next_phys: NIL,
        });
        self.chunks.push(ChunkDesc {
            id: chunk.id,
            base: chunk.base,
            size: chunk.size,
            allocated: 0,
            used_blocks: 0,
            free_blocks: 1,
            first_block: block,
        });
        self.insert_free_block(block);
        Ok(())
    }

    /// File a Free block at the head of the bin for its size and raise the
    /// directory bits.
    fn insert_free_block(&mut self, idx: u32) {
        debug_assert!(self.blocks[idx].status == BlockStatus::Free);
        let (l1, l2) = mapping::bin_for(self.blocks[idx].size);
        let old_head = self.bins.head(l1, l2);
        {
            let b = &mut self.blocks[idx];
            b.prev_free = NIL;
            b.next_free = old_head;
        }
        if old_head != NIL {
            self.blocks[old_head].prev_free = idx;
        }
        self.bins.set_head(l1, l2, idx);
        self.bins.set_l2(l1, l2);
        self.bins.set_l1(l1);
    }

    /// Unlink a Free block from its bin, lowering directory bits that run
    /// empty.
    fn remove_free_block(&mut self, idx: u32) {
        let (prev, next, size) = {
            let b = &self.blocks[idx];
            debug_assert!(b.status == BlockStatus::Free);
            (b.prev_free, b.next_free, b.size)
        };
        if next != NIL {
            self.blocks[next].prev_free = prev;
        }
        if prev != NIL {
            self.blocks[prev].next_free = next;
        } else {
            let (l1, l2) = mapping::bin_for(size);
            debug_assert_eq!(
                self.bins.head(l1, l2),
                idx,
                "free-list head desync at bin ({l1},{l2})"
            );
            self.bins.set_head(l1, l2, next);
            if next == NIL && self.bins.clear_l2(l1, l2) {
                self.bins.clear_l1(l1);
            }
        }
        let b = &mut self.blocks[idx];
        b.prev_free = NIL;
        b.next_free = NIL;
    }

    /// Verify every structural invariant. O(blocks), test and debug use
    /// only.
    ///
    /// # Panics
    ///
    /// Panics on the first violated invariant.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn check_invariants(&self) {
        use fixedbitset::FixedBitSet;

        let n = self.blocks.len();
        let mut in_free_list = FixedBitSet::with_capacity(n);

        // Bin directory: bits agree with heads, lists are well formed, and
        // every member is a Free block filed under its own class.
        for l1 in 0..L1_COUNT as u32 {
            let mut row_populated = false;
            for l2 in 0..L2_COUNT as u32 {
                let head = self.bins.head(l1, l2);
                assert_eq!(
                    self.bins.l2_set(l1, l2),
                    head != NIL,
                    "l2 bit ({l1},{l2}) disagrees with head"
                );
                row_populated |= head != NIL;

                let mut prev = NIL;
                let mut cur = head;
                while cur != NIL {
                    assert!(
                        !in_free_list.contains(cur as usize),
                        "block {cur} appears in more than one free list"
                    );
                    in_free_list.insert(cur as usize);
                    let b = &self.blocks[cur];
                    assert_eq!(b.status, BlockStatus::Free, "bin member {cur} is not Free");
                    assert_eq!(
                        mapping::bin_for(b.size),
                        (l1, l2),
                        "block {cur} of size {} filed in bin ({l1},{l2})",
                        b.size
                    );
                    assert_eq!(b.prev_free, prev, "broken free-list back link at {cur}");
                    prev = cur;
                    cur = b.next_free;
                }
            }
            assert_eq!(
                self.bins.l1_set(l1),
                row_populated,
                "l1 bit {l1} disagrees with row state"
            );
        }

        // Physical lists: contiguous, total, aligned, counts in step, no
        // two adjacent Free blocks.
        let mut in_chunk = FixedBitSet::with_capacity(n);
        for (ci, chunk) in self.chunks.iter().enumerate() {
            let first = chunk.first_block;
            assert!(first != NIL, "chunk {ci} has no blocks");
            let gap = self.blocks[first].offset;
            assert!(gap < self.alignment, "chunk {ci} gap {gap} exceeds alignment");

            let mut expected_offset = gap;
            let mut prev = NIL;
            let mut prev_was_free = false;
            let mut allocated = 0u64;
            let mut used = 0u32;
            let mut free = 0u32;
            let mut cur = first;
            while cur != NIL {
                assert!(
                    !in_chunk.contains(cur as usize),
                    "block {cur} appears in two physical lists"
                );
                in_chunk.insert(cur as usize);
                let b = &self.blocks[cur];
                assert_eq!(b.chunk as usize, ci, "block {cur} claims another chunk");
                assert_eq!(
                    b.offset, expected_offset,
                    "physical list of chunk {ci} is not contiguous at block {cur}"
                );
                assert_eq!(b.prev_phys, prev, "broken physical back link at {cur}");
                assert_eq!(
                    (chunk.base + u64::from(b.offset)) % u64::from(self.alignment),
                    0,
                    "block {cur} address is misaligned"
                );
                match b.status {
                    BlockStatus::Used => {
                        assert_eq!(
                            b.size % self.alignment,
                            0,
                            "used block {cur} has unaligned size {}",
                            b.size
                        );
                        allocated += u64::from(b.size);
                        used += 1;
                        prev_was_free = false;
                    }
                    BlockStatus::Free => {
                        assert!(!prev_was_free, "adjacent free blocks in chunk {ci}");
                        assert!(
                            in_free_list.contains(cur as usize),
                            "free block {cur} is not reachable from any bin"
                        );
                        free += 1;
                        prev_was_free = true;
                    }
                    BlockStatus::Available => {
                        panic!("recycled descriptor {cur} linked into chunk {ci}")
                    }
                }
                expected_offset += b.size;
                prev = cur;
                cur = b.next_phys;
            }
            assert_eq!(
                expected_offset, chunk.size,
                "blocks of chunk {ci} do not cover the chunk"
            );
            assert_eq!(u64::from(chunk.allocated), allocated, "chunk {ci} allocated gauge");
            assert_eq!(chunk.used_blocks, used, "chunk {ci} used-block gauge");
            assert_eq!(chunk.free_blocks, free, "chunk {ci} free-block gauge");
        }

        // Every descriptor is in exactly one place.
        let mut avail = 0usize;
        for idx in 0..n as u32 {
            let b = &self.blocks[idx];
            match b.status {
                BlockStatus::Available => {
                    avail += 1;
                    assert!(
                        !in_chunk.contains(idx as usize),
                        "recycled descriptor {idx} still linked into a chunk"
                    );
                }
                BlockStatus::Free => {
                    assert!(in_chunk.contains(idx as usize), "orphaned free block {idx}");
                }
                BlockStatus::Used => {
                    assert!(in_chunk.contains(idx as usize), "orphaned used block {idx}");
                    assert!(
                        !in_free_list.contains(idx as usize),
                        "used block {idx} is on a free list"
                    );
                }
            }
        }
        assert_eq!(avail, self.blocks.available(), "recycle-list count desync");

        let mut walked = 0usize;
        let mut cur = self.blocks.avail_head();
        while cur != NIL {
            assert_eq!(self.blocks[cur].status, BlockStatus::Available);
            walked += 1;
            assert!(walked <= avail, "cycle in the recycle list");
            cur = self.blocks[cur].next_free;
        }
        assert_eq!(walked, avail, "recycle list does not cover Available slots");
    }
}
