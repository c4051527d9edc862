//! Network-layer error types.

use thiserror::Error;

/// Errors raised by the peer-facing plumbing.
#[derive(Error, Debug)]
pub enum NetError {
    /// Loaded bloom filter exceeds the size constraints.
    #[error("bloom filter too large: {size} bytes / {hash_funcs} hash funcs")]
    FilterOversized { size: usize, hash_funcs: u32 },

    /// An element pushed into a bloom filter exceeds the per-item cap.
    #[error("bloom filter element too large: {size} bytes, max {max}")]
    FilterElementOversized { size: usize, max: usize },

    /// A filteradd arrived with no filter loaded.
    #[error("no bloom filter loaded")]
    FilterMissing,
}

/// Result type for network operations.
pub type NetResult<T> = Result<T, NetError>;
