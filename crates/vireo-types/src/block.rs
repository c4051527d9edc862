//! Block headers, blocks and locators.

use crate::{Hash256, Transaction};

/// A block header, reduced to the fields the sync core consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Header hash.
    pub hash: Hash256,
    /// Hash of the previous block.
    pub prev: Hash256,
    /// Block timestamp (unix seconds).
    pub time: i64,
}

impl BlockHeader {
    pub fn new(hash: Hash256, prev: Hash256, time: i64) -> Self {
        Self { hash, prev, time }
    }
}

/// A full block: header plus the transactions it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// The block hash, from the header.
    pub fn hash(&self) -> Hash256 {
        self.header.hash
    }
}

/// A block locator: hashes spaced exponentially back from a tip, used by a
/// peer to find the fork point with our chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Locator {
    pub hashes: Vec<Hash256>,
}

impl Locator {
    pub fn new(hashes: Vec<Hash256>) -> Self {
        Self { hashes }
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
