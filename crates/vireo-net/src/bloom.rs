//! Probabilistic sets: the rolling filter and the loadable peer filter.

use crate::{NetError, NetResult, MAX_BLOOM_FILTER_SIZE, MAX_BLOOM_HASH_FUNCS};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use vireo_types::Transaction;

fn optimal_bits(capacity: u32, fp_rate: f64) -> usize {
    let bits = (-1.0 / (2.0_f64.ln().powi(2)) * capacity as f64 * fp_rate.ln()).ceil();
    (bits as usize).max(64)
}

fn optimal_hash_funcs(bits: usize, capacity: u32) -> u32 {
    let k = (bits as f64 / capacity as f64 * 2.0_f64.ln()).round() as u32;
    k.clamp(1, 50)
}

/// Generational rolling approximate set.
///
/// Two equally-sized halves; inserts go to the current half, lookups probe
/// both. When the current half reaches the configured capacity the stale half
/// is cleared and becomes current, so the last `capacity` inserts are always
/// remembered and the stated false-positive rate holds across generations.
pub struct RollingFilter {
    data: Vec<u64>,
    hash_funcs: u32,
    capacity: u32,
    entries: u32,
    generation: u32,
    tweak: u64,
}

impl RollingFilter {
    /// Create a filter remembering at least `capacity` recent elements at the
    /// given false-positive rate.
    pub fn new(capacity: u32, fp_rate: f64) -> Self {
        let bits = optimal_bits(capacity, fp_rate);
        let words = bits.div_ceil(64);
        Self {
            data: vec![0; words * 2],
            hash_funcs: optimal_hash_funcs(bits, capacity),
            capacity,
            entries: 0,
            generation: 1,
            tweak: rand::random(),
        }
    }

    fn bit(&self, n: u32, element: &[u8]) -> usize {
        let mut hasher =
            SipHasher24::new_with_keys(self.tweak, ((n as u64) << 32) | self.generation as u64);
        hasher.write(element);
        hasher.finish() as usize % (self.data.len() / 2 * 64)
    }

    fn stale_bit(&self, n: u32, element: &[u8]) -> usize {
        let generation = self.generation.wrapping_sub(1).max(1);
        let mut hasher = SipHasher24::new_with_keys(self.tweak, ((n as u64) << 32) | generation as u64);
        hasher.write(element);
        hasher.finish() as usize % (self.data.len() / 2 * 64)
    }

    /// Insert an element.
    pub fn insert(&mut self, element: &[u8]) {
        if self.entries >= self.capacity {
            self.roll();
        }
        let half = self.data.len() / 2;
        let offset = if self.generation % 2 == 1 { 0 } else { half };
        for n in 0..self.hash_funcs {
            let bit = self.bit(n, element);
            self.data[offset + bit / 64] |= 1 << (bit % 64);
        }
        self.entries += 1;
    }

    /// Whether the element was (probably) inserted recently.
    pub fn contains(&self, element: &[u8]) -> bool {
        let half = self.data.len() / 2;
        let (current, stale) = if self.generation % 2 == 1 {
            (0, half)
        } else {
            (half, 0)
        };

        let mut in_current = true;
        for n in 0..self.hash_funcs {
            let bit = self.bit(n, element);
            if self.data[current + bit / 64] >> (bit % 64) & 1 == 0 {
                in_current = false;
                break;
            }
        }
        if in_current {
            return true;
        }
        if self.generation == 1 {
            // No stale generation yet.
            return false;
        }
        for n in 0..self.hash_funcs {
            let bit = self.stale_bit(n, element);
            if self.data[stale + bit / 64] >> (bit % 64) & 1 == 0 {
                return false;
            }
        }
        true
    }

    fn roll(&mut self) {
        let half = self.data.len() / 2;
        let stale = if self.generation % 2 == 1 {
            half..self.data.len()
        } else {
            0..half
        };
        for word in &mut self.data[stale] {
            *word = 0;
        }
        self.generation += 1;
        self.entries = 0;
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        for word in &mut self.data {
            *word = 0;
        }
        self.entries = 0;
        self.generation = 1;
        self.tweak = rand::random();
    }
}

/// A peer-loaded transaction filter (`filterload`).
///
/// A transaction is relevant when the filter matches its id or one of the
/// outpoints it spends.
pub struct PeerFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
}

impl PeerFilter {
    /// Validate and load a filter a peer sent us.
    pub fn load(data: Vec<u8>, hash_funcs: u32, tweak: u32) -> NetResult<Self> {
        if data.len() > MAX_BLOOM_FILTER_SIZE || hash_funcs > MAX_BLOOM_HASH_FUNCS {
            return Err(NetError::FilterOversized {
                size: data.len(),
                hash_funcs,
            });
        }
        Ok(Self {
            data,
            hash_funcs,
            tweak,
        })
    }

    /// An empty filter that matches nothing (`filterclear`).
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            hash_funcs: 0,
            tweak: 0,
        }
    }

    fn bit(&self, n: u32, element: &[u8]) -> usize {
        let mut hasher = SipHasher24::new_with_keys(self.tweak as u64, n as u64);
        hasher.write(element);
        hasher.finish() as usize % (self.data.len() * 8)
    }

    /// Add an element (`filteradd`).
    pub fn insert(&mut self, element: &[u8]) -> NetResult<()> {
        if element.len() > crate::MAX_SCRIPT_ELEMENT_SIZE {
            return Err(NetError::FilterElementOversized {
                size: element.len(),
                max: crate::MAX_SCRIPT_ELEMENT_SIZE,
            });
        }
        if self.data.is_empty() {
            return Err(NetError::FilterMissing);
        }
        for n in 0..self.hash_funcs {
            let bit = self.bit(n, element);
            self.data[bit / 8] |= 1 << (bit % 8);
        }
        Ok(())
    }

    /// Whether an element (probably) matches.
    pub fn contains(&self, element: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        for n in 0..self.hash_funcs {
            let bit = self.bit(n, element);
            if self.data[bit / 8] >> (bit % 8) & 1 == 0 {
                return false;
            }
        }
        true
    }

    /// Whether the transaction is relevant to the peer behind this filter.
    pub fn matches_transaction(&self, tx: &Transaction) -> bool {
        if self.contains(tx.txid.as_ref()) {
            return true;
        }
        for input in &tx.inputs {
            let mut key = Vec::with_capacity(36);
            key.extend_from_slice(input.hash.as_ref());
            key.extend_from_slice(&input.index.to_le_bytes());
            if self.contains(&key) {
                return true;
            }
        }
        false
    }
}
