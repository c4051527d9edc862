//! Transactions as the relay core sees them.
//!
//! Consensus evaluation and byte-level serialization belong to the validator
//! and transport collaborators. What the message-processing core needs from a
//! transaction is its id, which outpoints it spends, how many outputs it
//! creates, and the serialized payload it relays onward.

use crate::Hash256;
use bytes::Bytes;

/// Reference to an output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// Transaction the output belongs to.
    pub hash: Hash256,
    /// Output index within that transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }
}

/// A transaction, reduced to the fields the relay core consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction id.
    pub txid: Hash256,
    /// Outpoints spent by this transaction.
    pub inputs: Vec<OutPoint>,
    /// Number of outputs it creates (drives orphan resolution).
    pub output_count: u32,
    /// Serialized payload, relayed verbatim.
    pub payload: Bytes,
}

impl Transaction {
    pub fn new(txid: Hash256, inputs: Vec<OutPoint>, output_count: u32, payload: Bytes) -> Self {
        Self {
            txid,
            inputs,
            output_count,
            payload,
        }
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// A service transaction: an off-chain command referencing the on-chain
/// payment transaction that funds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTransaction {
    /// Service transaction hash.
    pub hash: Hash256,
    /// Hash of the on-chain payment transaction this command references.
    pub payment_hash: Hash256,
    /// Serialized payload, relayed verbatim.
    pub payload: Bytes,
}

impl ServiceTransaction {
    pub fn new(hash: Hash256, payment_hash: Hash256, payload: Bytes) -> Self {
        Self {
            hash,
            payment_hash,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_size_is_payload_len() {
        let tx = Transaction::new(
            Hash256::from_u64(1),
            vec![OutPoint::new(Hash256::from_u64(2), 0)],
            1,
            Bytes::from(vec![0u8; 250]),
        );
        assert_eq!(tx.size(), 250);
    }
}
