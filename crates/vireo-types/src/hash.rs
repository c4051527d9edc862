//! 32-byte identifiers.

use serde::{Deserialize, Serialize};

/// A 32-byte hash identifying a block, transaction or service transaction.
///
/// The node never computes these itself; they arrive precomputed inside the
/// typed payloads the transport hands us.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash, used as a "no hash" marker on the wire.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Build from a byte array.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// True if this is the all-zero marker.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Deterministic test/bench helper: a hash whose first bytes encode `n`.
    pub fn from_u64(n: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        Self(bytes)
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
