//! Transaction relay map and deterministic address-relay sampling.

use crate::RELAY_EXPIRY_US;
use siphasher::sip::SipHasher24;
use std::collections::{HashMap, VecDeque};
use std::hash::Hasher;
use vireo_types::{Hash256, NetAddress, PeerId, Transaction};

/// Recently relayed transactions, kept so `getdata(tx)` can be answered
/// without re-consulting the mempool. Entries age out after 15 minutes.
#[derive(Default)]
pub struct RelayMap {
    entries: HashMap<Hash256, Transaction>,
    expiration: VecDeque<(i64, Hash256)>,
}

impl RelayMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a relayed transaction. A hash already present keeps its
    /// original expiry.
    pub fn insert(&mut self, tx: Transaction, now_us: i64) {
        let hash = tx.txid;
        if self.entries.insert(hash, tx).is_none() {
            self.expiration.push_back((now_us + RELAY_EXPIRY_US, hash));
        }
    }

    pub fn get(&self, hash: &Hash256) -> Option<&Transaction> {
        self.entries.get(hash)
    }

    /// Drop entries whose window has passed.
    pub fn expire(&mut self, now_us: i64) {
        while let Some(&(expiry, hash)) = self.expiration.front() {
            if expiry >= now_us {
                break;
            }
            self.entries.remove(&hash);
            self.expiration.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pick the peers that relay `addr` for the current 24-hour epoch.
///
/// At most two peers for reachable addresses, one otherwise. The choice is a
/// keyed PRF over `(addr, day)` combined with each peer id, so within an
/// epoch every node relays a given address through the same peers and their
/// known-address filters suppress repeats.
pub fn relay_targets(
    key: (u64, u64),
    addr: &NetAddress,
    now_s: i64,
    reachable: bool,
    peers: &[PeerId],
) -> Vec<PeerId> {
    let want = if reachable { 2 } else { 1 };

    let mut addr_hasher = SipHasher24::new_with_keys(key.0, key.1);
    addr_hasher.write(&addr.key());
    let addr_hash = addr_hasher.finish();
    let day = (now_s.wrapping_add(addr_hash as i64)) / (24 * 60 * 60);

    let mut best: Vec<(u64, PeerId)> = Vec::with_capacity(want + 1);
    for &peer in peers {
        let mut hasher = SipHasher24::new_with_keys(key.0, key.1);
        hasher.write_u64(addr_hash.wrapping_shl(32));
        hasher.write_i64(day);
        hasher.write_u64(peer.0);
        let score = hasher.finish();
        best.push((score, peer));
        best.sort_by(|a, b| b.0.cmp(&a.0));
        best.truncate(want);
    }
    best.into_iter().map(|(_, peer)| peer).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vireo_types::NODE_NETWORK;

    fn address(s: &str) -> NetAddress {
        NetAddress::new(s.parse().unwrap(), NODE_NETWORK, 0)
    }

    fn tx(n: u64) -> Transaction {
        Transaction::new(Hash256::from_u64(n), vec![], 1, bytes::Bytes::from_static(b"tx"))
    }

    #[test]
    fn relay_map_expires_in_order() {
        let mut map = RelayMap::new();
        map.insert(tx(1), 0);
        map.insert(tx(2), 1_000_000);

        map.expire(RELAY_EXPIRY_US + 1);
        assert!(map.get(&Hash256::from_u64(1)).is_none());
        assert!(map.get(&Hash256::from_u64(2)).is_some());

        map.expire(RELAY_EXPIRY_US + 1_000_001);
        assert!(map.is_empty());
    }

    #[test]
    fn reinsert_keeps_first_expiry() {
        let mut map = RelayMap::new();
        map.insert(tx(1), 0);
        map.insert(tx(1), 10 * RELAY_EXPIRY_US);
        map.expire(RELAY_EXPIRY_US + 1);
        assert!(map.is_empty());
    }

    #[test]
    fn relay_targets_stable_within_epoch() {
        let key = (11, 22);
        let peers: Vec<PeerId> = (0..20).map(PeerId).collect();
        let addr = address("8.8.8.8:5744");

        let now = 1_700_000_000;
        let first = relay_targets(key, &addr, now, true, &peers);
        let second = relay_targets(key, &addr, now + 60, true, &peers);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn unreachable_addresses_get_one_target() {
        let key = (11, 22);
        let peers: Vec<PeerId> = (0..20).map(PeerId).collect();
        let addr = address("8.8.8.8:5744");
        assert_eq!(relay_targets(key, &addr, 0, false, &peers).len(), 1);
    }

    #[test]
    fn no_peers_no_targets() {
        let addr = address("8.8.8.8:5744");
        assert!(relay_targets((1, 2), &addr, 0, true, &[]).is_empty());
    }
}
