use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsfError {
    /// The configured alignment is not a power of two.
    InvalidAlignment { alignment: u32 },
    /// The chunk provider could not supply a region of at least `min_size`
    /// bytes. The allocator state is unchanged.
    ChunkAllocationFailed { min_size: u32 },
    /// The request no longer fits in 32 bits after rounding up to the
    /// configured alignment.
    RequestTooLarge { size: u64 },
}

impl fmt::Display for TlsfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsfError::InvalidAlignment { alignment } => {
                write!(f, "alignment {alignment} is not a power of two")
            }
            TlsfError::ChunkAllocationFailed { min_size } => {
                write!(f, "chunk provider could not supply {min_size} bytes")
            }
            TlsfError::RequestTooLarge { size } => {
                write!(f, "aligned request of {size} bytes exceeds the 32-bit size limit")
            }
        }
    }
}

impl Error for TlsfError {}
