//! Chunk registry entries.
//!
//! One descriptor per backing region acquired from the provider, recording
//! the region identity plus per-chunk gauges. The gauges are diagnostic
//! state kept exactly in step by the allocator core; readers get them
//! through the accessor methods below.

/// Descriptor for one backing memory region.
#[derive(Clone, Copy, Debug)]
pub struct ChunkDesc {
    pub(crate) id: u64,
    pub(crate) base: u64,
    pub(crate) size: u32,
    pub(crate) allocated: u32,
    pub(crate) used_blocks: u32,
    pub(crate) free_blocks: u32,
    /// Index of the first block in address order.
    pub(crate) first_block: u32,
}

impl ChunkDesc {
    /// Provider-assigned identifier. Stored opaquely, never interpreted.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Base address of the backing region.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the backing region in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes currently handed out from this chunk.
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Number of blocks currently handed out from this chunk.
    #[must_use]
    pub fn used_blocks(&self) -> u32 {
        self.used_blocks
    }

    /// Number of free blocks in this chunk.
    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }
}
