//! Backing chunk provider interface and the OS-memory implementation.
//!
//! The allocator core never touches backing bytes; it only records the
//! `(id, base, size)` triple a provider hands back. Providers may be backed
//! by anything addressable: the OS virtual-memory layer below, a GPU heap, a
//! managed buffer, or the fixed test provider at the bottom of this file.

use std::collections::HashMap;
use std::ptr::NonNull;

use super::mapping::MIN_ALIGNMENT;

/// One backing memory region.
///
/// The contract for provider implementations: `size` must be at least the
/// requested minimum, a power of two, and at least [`MIN_ALIGNMENT`]; `id`
/// must be unique for the provider's lifetime.
#[derive(Clone, Copy, Debug)]
pub struct Chunk {
    pub id: u64,
    pub base: u64,
    pub size: u32,
}

/// Injected capability that supplies and releases raw memory regions.
pub trait ChunkProvider {
    /// Allocate a region of at least `min_size` bytes, or `None` when the
    /// backing resource is exhausted.
    fn try_allocate_chunk(&mut self, min_size: u32) -> Option<Chunk>;

    /// Release a previously returned region. Idempotency is not required.
    fn free_chunk(&mut self, chunk_id: u64);
}

struct SystemRegion {
    ptr: NonNull<u8>,
    size: usize,
}

/// Provider backed by OS memory: `mmap`/`munmap` on unix, the global heap
/// elsewhere. Sizes are rounded up to a power of two of at least one page.
/// Ids are a running counter, so they stay unique even when the OS reuses an
/// address. Regions still live at drop time are released.
pub struct SystemChunkProvider {
    regions: HashMap<u64, SystemRegion>,
    next_id: u64,
}

// Safety: the provider owns every mapped region; the raw pointers are not
// shared outside `free_chunk`/`Drop`.
unsafe impl Send for SystemChunkProvider {}

const SYSTEM_PAGE_SIZE: u32 = 4096;

impl SystemChunkProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: HashMap::new(),
            next_id: 1,
        }
    }

    /// Number of regions currently held.
    #[must_use]
    pub fn live_chunks(&self) -> usize {
        self.regions.len()
    }

    fn rounded_size(min_size: u32) -> Option<u32> {
        min_size
            .max(SYSTEM_PAGE_SIZE)
            .max(MIN_ALIGNMENT)
            .checked_next_power_of_two()
    }
}

impl Default for SystemChunkProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn map_region(size: usize) -> Option<NonNull<u8>> {
    // Safety: FFI call to mmap.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr.cast::<u8>())
}

#[cfg(unix)]
fn unmap_region(region: &SystemRegion) {
    // Safety: FFI call to munmap; the region was returned by map_region.
    let rc = unsafe { libc::munmap(region.ptr.as_ptr().cast::<libc::c_void>(), region.size) };
    debug_assert!(
        rc == 0,
        "munmap failed: {}",
        std::io::Error::last_os_error()
    );
}

#[cfg(not(unix))]
fn map_region(size: usize) -> Option<NonNull<u8>> {
    let layout = std::alloc::Layout::from_size_align(size, SYSTEM_PAGE_SIZE as usize).ok()?;
    // Safety: layout has non-zero size.
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr)
}

#[cfg(not(unix))]
fn unmap_region(region: &SystemRegion) {
    let layout =
        std::alloc::Layout::from_size_align(region.size, SYSTEM_PAGE_SIZE as usize)
            .expect("layout was valid at allocation time");
    // Safety: ptr was allocated with the same layout in map_region.
    unsafe { std::alloc::dealloc(region.ptr.as_ptr(), layout) };
}

impl ChunkProvider for SystemChunkProvider {
    fn try_allocate_chunk(&mut self, min_size: u32) -> Option<Chunk> {
        let size = Self::rounded_size(min_size)?;
        let ptr = map_region(size as usize)?;
        let base = ptr.as_ptr() as u64;
        let id = self.next_id;
        self.next_id += 1;
        self.regions.insert(
            id,
            SystemRegion {
                ptr,
                size: size as usize,
            },
        );
        Some(Chunk { id, base, size })
    }

    fn free_chunk(&mut self, chunk_id: u64) {
        match self.regions.remove(&chunk_id) {
            Some(region) => unmap_region(&region),
            None => debug_assert!(false, "free_chunk: unknown chunk id {chunk_id:#x}"),
        }
    }
}

impl Drop for SystemChunkProvider {
    fn drop(&mut self) {
        for region in self.regions.values() {
            unmap_region(region);
        }
    }
}

/// Deterministic provider for tests: serves power-of-two chunks of at least
/// a fixed base size, at consecutive addresses from a fixed base, with ids
/// 1, 2, ... Records every `free_chunk` call.
#[cfg(test)]
pub(crate) struct FixedChunkProvider {
    chunk_size: u32,
    cursor: u64,
    next_id: u64,
    pub allocations: Vec<u32>,
    pub freed: Vec<u64>,
    pub fail: bool,
}

#[cfg(test)]
pub(crate) const TEST_CHUNK_BASE: u64 = 0xFE00_1200_0000_0000;

#[cfg(test)]
impl FixedChunkProvider {
    pub fn new(chunk_size: u32) -> Self {
        Self::with_base(chunk_size, TEST_CHUNK_BASE)
    }

    pub fn with_base(chunk_size: u32, base: u64) -> Self {
        assert!(chunk_size.is_power_of_two());
        Self {
            chunk_size,
            cursor: base,
            next_id: 1,
            allocations: Vec::new(),
            freed: Vec::new(),
            fail: false,
        }
    }
}

#[cfg(test)]
impl ChunkProvider for FixedChunkProvider {
    fn try_allocate_chunk(&mut self, min_size: u32) -> Option<Chunk> {
        if self.fail {
            return None;
        }
        let size = min_size.checked_next_power_of_two()?.max(self.chunk_size);
        let base = self.cursor;
        self.cursor += u64::from(size);
        let id = self.next_id;
        self.next_id += 1;
        self.allocations.push(min_size);
        Some(Chunk { id, base, size })
    }

    fn free_chunk(&mut self, chunk_id: u64) {
        self.freed.push(chunk_id);
    }
}
