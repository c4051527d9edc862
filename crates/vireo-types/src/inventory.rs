//! Inventory items: typed (kind, hash) announcements.

use crate::Hash256;

/// The kind of object an inventory entry advertises.
///
/// Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InvKind {
    /// A transaction.
    Tx = 1,
    /// A block.
    Block = 2,
    /// A merkle-filtered block (only valid in getdata).
    FilteredBlock = 3,
    /// A service transaction.
    ServiceTx = 4,
}

impl InvKind {
    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            InvKind::Tx => "tx",
            InvKind::Block => "block",
            InvKind::FilteredBlock => "filtered block",
            InvKind::ServiceTx => "stx",
        }
    }
}

/// A single inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inv {
    pub fn new(kind: InvKind, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self::new(InvKind::Tx, hash)
    }

    pub fn block(hash: Hash256) -> Self {
        Self::new(InvKind::Block, hash)
    }

    pub fn service_tx(hash: Hash256) -> Self {
        Self::new(InvKind::ServiceTx, hash)
    }

    /// True for the transaction-like kinds that flow through the ask-for map.
    pub fn is_tx_like(&self) -> bool {
        matches!(self.kind, InvKind::Tx | InvKind::ServiceTx)
    }
}

impl std::fmt::Display for Inv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.hash)
    }
}
