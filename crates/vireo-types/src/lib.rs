//! # vireo-types
//!
//! Core value types shared across the Vireo node crates.
//!
//! This crate provides:
//! - 32-byte identifiers for blocks and transactions
//! - Transactions and service transactions as the relay core sees them
//! - Block headers, blocks and locators
//! - Inventory items and network addresses

mod address;
mod block;
mod hash;
mod inventory;
mod transaction;

pub use address::{NetAddress, ServiceFlags, NODE_BLOOM, NODE_NETWORK, NODE_NONE};
pub use block::{Block, BlockHeader, Locator};
pub use hash::Hash256;
pub use inventory::{Inv, InvKind};
pub use transaction::{OutPoint, ServiceTransaction, Transaction};

/// Opaque identifier assigned to a connected peer by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
