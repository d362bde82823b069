//! Two-level segregated fit (TLSF) sub-allocator over externally supplied
//! memory chunks.
//!
//! The allocator carves variable-sized blocks out of large backing regions
//! obtained from an injected [`ChunkProvider`] and services allocate/free in
//! O(1) worst case for the segregation search. Block metadata is kept
//! out-of-band, so the backing memory never has to be CPU accessible; the
//! core only hands out 64-bit addresses.
//!
//! The core is single-threaded. Wrap it in a mutex or keep one instance per
//! thread.

// public module: contains implementation details (hidden via pub(crate))
pub mod tlsf;

// allocator surface
pub use tlsf::allocator::{AllocToken, Allocation, TlsfAllocator, TlsfConfig, TlsfStats};
pub use tlsf::chunks::ChunkDesc;
pub use tlsf::mapping::MIN_ALIGNMENT;

// chunk providers
pub use tlsf::provider::{Chunk, ChunkProvider, SystemChunkProvider};

// errors
pub use tlsf::error::TlsfError;
