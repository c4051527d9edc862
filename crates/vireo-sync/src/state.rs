//! The single-lock aggregate behind the protocol core.

use crate::chain::{BlockId, ChainIndex};
use crate::orphans::OrphanPool;
use crate::peers::{NodeStateStats, PeerSyncState};
use std::collections::{HashMap, HashSet};
use tracing::info;
use vireo_net::{RelayMap, RollingFilter};
use vireo_types::{Hash256, PeerId};

/// Everything the chain lock guards: the header index, the peer registry,
/// the in-flight table, the filters and pools, and the derived counters.
pub struct CoreState {
    pub chain: ChainIndex,
    pub peers: HashMap<PeerId, PeerSyncState>,

    /// hash -> (peer holding it, position in that peer's in-flight list).
    pub in_flight: HashMap<Hash256, (PeerId, usize)>,
    pub peers_with_validated_downloads: usize,
    pub preferred_download_count: usize,
    pub sync_started_count: usize,

    /// Recently rejected transactions; reset whenever the tip moves.
    pub recent_rejects: RollingFilter,
    pub rejects_chain_tip: Hash256,

    pub orphans: OrphanPool,
    pub relay: RelayMap,

    /// Block hash -> (source peer, punish on invalidity).
    pub block_source: HashMap<Hash256, (PeerId, bool)>,

    /// Global per-inventory request cool-down bookkeeping.
    pub already_asked: HashMap<Hash256, i64>,

    /// Highest block height fast-announced via the validated-block callback.
    pub highest_fast_announce: u32,
    /// When we last accepted a new best block, unix seconds.
    pub best_received_time: i64,

    /// Nonces of version messages we sent; used for self-connect detection.
    pub local_version_nonces: HashSet<u64>,
}

impl CoreState {
    pub fn new(chain: ChainIndex) -> Self {
        let rejects_chain_tip = chain.tip_entry().hash;
        Self {
            chain,
            peers: HashMap::new(),
            in_flight: HashMap::new(),
            peers_with_validated_downloads: 0,
            preferred_download_count: 0,
            sync_started_count: 0,
            recent_rejects: RollingFilter::new(
                crate::RECENT_REJECTS_CAPACITY,
                crate::RECENT_REJECTS_FP_RATE,
            ),
            rejects_chain_tip,
            orphans: OrphanPool::new(),
            relay: RelayMap::new(),
            block_source: HashMap::new(),
            already_asked: HashMap::new(),
            highest_fast_announce: 0,
            best_received_time: 0,
            local_version_nonces: HashSet::new(),
        }
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerSyncState> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut PeerSyncState> {
        self.peers.get_mut(&id)
    }

    /// Add to a peer's misbehavior score; crossing `banscore` on this call
    /// marks the peer for banning.
    pub fn misbehaving(&mut self, id: PeerId, howmuch: u32, reason: &str, banscore: u32) {
        if howmuch == 0 {
            return;
        }
        let Some(state) = self.peers.get_mut(&id) else {
            return;
        };
        let before = state.misbehavior;
        state.misbehavior += howmuch;
        if state.misbehavior >= banscore && before < banscore {
            info!(
                peer = %id,
                name = %state.name,
                score = state.misbehavior,
                reason,
                "misbehaving peer, ban threshold exceeded"
            );
            state.should_ban = true;
        } else {
            info!(
                peer = %id,
                name = %state.name,
                from = before,
                to = state.misbehavior,
                reason,
                "misbehaving peer"
            );
        }
    }

    /// Drop the rejects filter when the tip it was built against has moved:
    /// a rejected transaction might now be valid.
    pub fn maybe_reset_rejects(&mut self) {
        let tip = self.chain.tip_entry().hash;
        if tip != self.rejects_chain_tip {
            self.rejects_chain_tip = tip;
            self.recent_rejects.reset();
        }
    }

    /// Sync-state snapshot for the RPC collaborator.
    pub fn node_state_stats(&self, id: PeerId) -> Option<NodeStateStats> {
        let state = self.peers.get(&id)?;
        Some(NodeStateStats {
            misbehavior: state.misbehavior,
            sync_height: state
                .best_known_block
                .map(|id| self.chain.get(id).height as i32)
                .unwrap_or(-1),
            common_height: state
                .last_common_block
                .map(|id| self.chain.get(id).height as i32)
                .unwrap_or(-1),
            heights_in_flight: state
                .blocks_in_flight
                .iter()
                .filter_map(|qb| qb.index.map(|id| self.chain.get(id).height))
                .collect(),
        })
    }

    /// Check the cross-structure invariants. Panics on violation; meant for
    /// tests and the empty-registry consistency check.
    pub fn check_invariants(&self) {
        let mut total_in_flight = 0;
        for (id, state) in &self.peers {
            total_in_flight += state.blocks_in_flight.len();
            for (pos, queued) in state.blocks_in_flight.iter().enumerate() {
                assert_eq!(
                    self.in_flight.get(&queued.hash),
                    Some(&(*id, pos)),
                    "in-flight index out of sync for {}",
                    queued.hash
                );
            }
            assert_eq!(
                state.in_flight_validated,
                state
                    .blocks_in_flight
                    .iter()
                    .filter(|qb| qb.validated_header())
                    .count()
            );
        }
        assert_eq!(total_in_flight, self.in_flight.len());
        assert_eq!(
            self.peers_with_validated_downloads,
            self.peers
                .values()
                .filter(|s| s.in_flight_validated > 0)
                .count()
        );
        assert_eq!(
            self.preferred_download_count,
            self.peers.values().filter(|s| s.preferred_download).count()
        );
        assert_eq!(
            self.sync_started_count,
            self.peers.values().filter(|s| s.sync_started).count()
        );
        assert!(self.orphans.index_is_consistent());
    }
}
