//! Block download scheduling: peer availability tracking, the sliding
//! download window, and the in-flight table.

use crate::chain::BlockId;
use crate::peers::QueuedBlock;
use crate::state::CoreState;
use crate::{ConsensusParams, BLOCK_DOWNLOAD_WINDOW, DIRECT_FETCH_SPACING_MULTIPLIER};
use tracing::trace;
use vireo_types::{Hash256, PeerId};

impl CoreState {
    /// Lift a parked unknown-block announcement onto `best_known_block` once
    /// the hash resolves to an index entry with work.
    pub fn process_block_availability(&mut self, peer: PeerId) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        if let Some(hash) = state.last_unknown_block {
            if let Some(id) = self.chain.lookup(&hash) {
                if self.chain.get(id).work > 0 {
                    let better = match state.best_known_block {
                        Some(best) => self.chain.get(id).work >= self.chain.get(best).work,
                        None => true,
                    };
                    if better {
                        state.best_known_block = Some(id);
                    }
                    state.last_unknown_block = None;
                }
            }
        }
    }

    /// Track a block announcement from a peer.
    pub fn update_block_availability(&mut self, peer: PeerId, hash: Hash256) {
        self.process_block_availability(peer);
        let id = self.chain.lookup(&hash);
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        match id {
            Some(id) if self.chain.get(id).work > 0 => {
                let better = match state.best_known_block {
                    Some(best) => self.chain.get(id).work >= self.chain.get(best).work,
                    None => true,
                };
                if better {
                    state.best_known_block = Some(id);
                }
            }
            _ => {
                // Unknown block; assume the latest announcement is the best.
                state.last_unknown_block = Some(hash);
            }
        }
    }

    /// Remove an in-flight entry once its block arrived (or to steal it for
    /// another peer). Returns true when the block was actually tracked.
    pub fn mark_block_received(&mut self, hash: &Hash256, now_us: i64) -> bool {
        let Some((peer, pos)) = self.in_flight.remove(hash) else {
            return false;
        };
        let state = self.peers.get_mut(&peer).expect("in-flight entry has owner");
        let queued = state.blocks_in_flight.remove(pos);
        if queued.validated_header() {
            state.in_flight_validated -= 1;
            if state.in_flight_validated == 0 {
                // Last validated block on this peer's queue was received.
                self.peers_with_validated_downloads -= 1;
            }
        }
        if pos == 0 {
            // Head of the queue arrived: time the next one from now.
            state.downloading_since_us = state.downloading_since_us.max(now_us);
        }
        state.stalling_since_us = 0;
        // Later entries shifted down one slot.
        for (new_pos, queued) in state.blocks_in_flight.iter().enumerate().skip(pos) {
            self.in_flight.insert(queued.hash, (peer, new_pos));
        }
        true
    }

    /// Record that `peer` was asked for a block. Any previous holder loses
    /// the entry first, so each hash is in flight from exactly one peer.
    pub fn mark_block_in_flight(
        &mut self,
        peer: PeerId,
        hash: Hash256,
        index: Option<BlockId>,
        now_us: i64,
    ) {
        self.mark_block_received(&hash, now_us);

        let state = self.peers.get_mut(&peer).expect("peer is registered");
        let queued = QueuedBlock { hash, index };
        let validated = queued.validated_header();
        state.blocks_in_flight.push(queued);
        if state.blocks_in_flight.len() == 1 {
            // Starting a download batch from this peer.
            state.downloading_since_us = now_us;
        }
        if validated {
            state.in_flight_validated += 1;
            if state.in_flight_validated == 1 {
                self.peers_with_validated_downloads += 1;
            }
        }
        self.in_flight
            .insert(hash, (peer, state.blocks_in_flight.len() - 1));
    }

    /// Whether the tip is recent enough to fetch announced blocks directly
    /// instead of waiting for the header sync.
    pub fn can_direct_fetch(&self, params: &ConsensusParams, adjusted_time: i64) -> bool {
        let tip = self.chain.tip_entry();
        let spacing = params.target_spacing_at(tip.time);
        tip.time > adjusted_time - spacing * DIRECT_FETCH_SPACING_MULTIPLIER
    }

    /// Advance `last_common_block` and pick up to `count` successors on the
    /// peer's chain that are neither downloaded nor in flight, bounded by
    /// the sliding download window. When the window is blocked and nothing
    /// was fetchable, the peer holding the first blocking block is reported
    /// as the staller.
    pub fn find_next_blocks_to_download(
        &mut self,
        peer: PeerId,
        count: usize,
    ) -> (Vec<BlockId>, Option<PeerId>) {
        let mut blocks = Vec::new();
        let mut staller = None;
        if count == 0 {
            return (blocks, staller);
        }

        self.process_block_availability(peer);

        let Some(state) = self.peers.get_mut(&peer) else {
            return (blocks, staller);
        };
        let Some(best) = state.best_known_block else {
            // This peer has nothing interesting.
            return (blocks, staller);
        };
        if self.chain.get(best).work < self.chain.tip_entry().work {
            return (blocks, staller);
        }

        if state.last_common_block.is_none() {
            // Bootstrap quickly by guessing a parent of our best tip is the
            // forking point. Guessing wrong in either direction is fine.
            let height = self.chain.get(best).height.min(self.chain.height());
            state.last_common_block = self.chain.active_at(height);
        }

        // If the peer reorganized, our previous last-common may not be an
        // ancestor of its current tip anymore.
        let last_common = self
            .chain
            .last_common_ancestor(state.last_common_block.expect("set above"), best);
        state.last_common_block = Some(last_common);
        if last_common == best {
            return (blocks, staller);
        }

        let window_end = self.chain.get(last_common).height + BLOCK_DOWNLOAD_WINDOW;
        let max_height = self.chain.get(best).height.min(window_end + 1);
        let mut waiting_for: Option<PeerId> = None;
        let mut walk = last_common;

        while self.chain.get(walk).height < max_height {
            // Read successors of the walk point toward the peer's best block
            // in batches; the ancestor lookup amortizes over the batch.
            let walk_height = self.chain.get(walk).height;
            let to_fetch = ((max_height - walk_height) as usize)
                .min((count - blocks.len()).max(128));
            let target = self
                .chain
                .ancestor(best, walk_height + to_fetch as u32)
                .expect("height below best");
            let mut batch = Vec::with_capacity(to_fetch);
            let mut cursor = target;
            for _ in 0..to_fetch {
                batch.push(cursor);
                cursor = self.chain.get(cursor).prev.expect("above last common");
            }
            batch.reverse();
            walk = target;

            for id in batch {
                let entry = self.chain.get(id);
                if entry.failed {
                    // The chain this peer is on is invalid.
                    return (blocks, staller);
                }
                if entry.have_data || self.chain.contains(id) {
                    if entry.have_chain_txs {
                        state.last_common_block = Some(id);
                    }
                } else if !self.in_flight.contains_key(&entry.hash) {
                    if entry.height > window_end {
                        // Reached the end of the window.
                        if blocks.is_empty() && waiting_for != Some(peer) {
                            // We would be able to fetch this block if the
                            // window were one larger.
                            staller = waiting_for;
                        }
                        return (blocks, staller);
                    }
                    blocks.push(id);
                    if blocks.len() == count {
                        return (blocks, staller);
                    }
                } else if waiting_for.is_none() {
                    waiting_for = self.in_flight.get(&entry.hash).map(|&(holder, _)| holder);
                }
            }
        }
        (blocks, staller)
    }

    /// Whether this peer is assumed to have the header: it is an ancestor of
    /// either its best known block or the best header we sent it.
    pub fn peer_has_header(&self, peer: PeerId, id: BlockId) -> bool {
        let Some(state) = self.peers.get(&peer) else {
            return false;
        };
        let height = self.chain.get(id).height;
        if let Some(best) = state.best_known_block {
            if self.chain.ancestor(best, height) == Some(id) {
                return true;
            }
        }
        if let Some(sent) = state.best_header_sent {
            if self.chain.ancestor(sent, height) == Some(id) {
                return true;
            }
        }
        false
    }

    /// Recompute a peer's preferred-download status and the global counter.
    pub fn update_preferred_download(&mut self, peer: PeerId, preferred: bool) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        self.preferred_download_count -= state.preferred_download as usize;
        state.preferred_download = preferred;
        self.preferred_download_count += preferred as usize;
        trace!(peer = %peer, preferred, "updated preferred download");
    }

    /// Per-peer download timeout for the head in-flight block, micros.
    pub fn block_download_timeout_us(&self, peer: PeerId, params: &ConsensusParams) -> i64 {
        let spacing = params.target_spacing_at(self.chain.tip_entry().time);
        let validated_here = self
            .peers
            .get(&peer)
            .map(|s| s.in_flight_validated > 0)
            .unwrap_or(false);
        let other_peers =
            (self.peers_with_validated_downloads - validated_here as usize) as i64;
        spacing
            * (crate::BLOCK_DOWNLOAD_TIMEOUT_BASE
                + crate::BLOCK_DOWNLOAD_TIMEOUT_PER_PEER * other_peers)
    }
}
