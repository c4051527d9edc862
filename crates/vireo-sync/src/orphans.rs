//! Transactions whose parents we have not seen yet.

use crate::MAX_ORPHAN_TX_SIZE;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;
use vireo_types::{Hash256, PeerId, Transaction};

/// One parked transaction and the peer it came from.
#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub tx: Transaction,
    pub from_peer: PeerId,
}

/// Bounded pool of orphan transactions, indexed by the outpoints they spend.
#[derive(Default)]
pub struct OrphanPool {
    entries: BTreeMap<Hash256, OrphanEntry>,
    /// prev-tx hash -> orphans spending one of its outputs.
    by_prev: HashMap<Hash256, HashSet<Hash256>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a transaction. Refused when the hash is already present or the
    /// payload exceeds the per-orphan cap (a legitimate large transaction
    /// will be rebroadcast once its parents are mined).
    pub fn add(&mut self, tx: Transaction, from_peer: PeerId) -> bool {
        let hash = tx.txid;
        if self.entries.contains_key(&hash) {
            return false;
        }
        if tx.size() > MAX_ORPHAN_TX_SIZE {
            debug!(size = tx.size(), %hash, "ignoring large orphan tx");
            return false;
        }
        for input in &tx.inputs {
            self.by_prev.entry(input.hash).or_default().insert(hash);
        }
        self.entries.insert(hash, OrphanEntry { tx, from_peer });
        debug!(
            %hash,
            pool = self.entries.len(),
            prev_index = self.by_prev.len(),
            "stored orphan tx"
        );
        true
    }

    /// Remove one orphan and clean its reverse-index entries.
    pub fn erase(&mut self, hash: &Hash256) -> bool {
        let Some(entry) = self.entries.remove(hash) else {
            return false;
        };
        for input in &entry.tx.inputs {
            if let Some(set) = self.by_prev.get_mut(&input.hash) {
                set.remove(hash);
                if set.is_empty() {
                    self.by_prev.remove(&input.hash);
                }
            }
        }
        true
    }

    /// Drop everything a disconnecting peer gave us.
    pub fn erase_for_peer(&mut self, peer: PeerId) -> usize {
        let hashes: Vec<Hash256> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.from_peer == peer)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &hashes {
            self.erase(hash);
        }
        if !hashes.is_empty() {
            debug!(count = hashes.len(), %peer, "erased orphan txs for peer");
        }
        hashes.len()
    }

    /// Evict uniformly random orphans until at most `cap` remain. Sampling
    /// by key: pick a random hash and take the next entry in key order.
    pub fn evict_to(&mut self, cap: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > cap {
            let probe = Hash256::new(rand::random());
            let victim = self
                .entries
                .range(probe..)
                .next()
                .or_else(|| self.entries.iter().next())
                .map(|(hash, _)| *hash)
                .expect("pool is non-empty");
            self.erase(&victim);
            evicted += 1;
        }
        evicted
    }

    /// Orphans spending an output of `prev_hash`.
    pub fn children_of(&self, prev_hash: &Hash256) -> Vec<Hash256> {
        self.by_prev
            .get(prev_hash)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, hash: &Hash256) -> Option<&OrphanEntry> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify the reverse index is exactly the union over orphans of their
    /// input references. Test support.
    pub fn index_is_consistent(&self) -> bool {
        let mut expected: HashMap<Hash256, HashSet<Hash256>> = HashMap::new();
        for (hash, entry) in &self.entries {
            for input in &entry.tx.inputs {
                expected.entry(input.hash).or_default().insert(*hash);
            }
        }
        expected == self.by_prev
    }
}
