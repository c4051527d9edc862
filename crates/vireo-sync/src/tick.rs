//! The periodic outbound tick: pings, address broadcast, block
//! announcements, inventory trickle, stall checks and getdata dispatch.

use crate::chain::BlockId;
use crate::processor::{poisson_next_send, ProtocolCore};
use crate::state::CoreState;
use crate::{
    AVG_ADDRESS_BROADCAST_INTERVAL_US, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL_US,
    BLOCK_STALLING_TIMEOUT_US, INVENTORY_BROADCAST_INTERVAL_US, INVENTORY_BROADCAST_MAX,
    MAX_BLOCKS_IN_TRANSIT_PER_PEER, MAX_BLOCKS_TO_ANNOUNCE, PING_INTERVAL_US,
};
use rand::Rng;
use tracing::{debug, info, warn};
use vireo_net::{Message, Peer, MAX_ADDR_SZ, MAX_INV_SZ};
use vireo_types::{BlockHeader, Hash256, Inv, InvKind, PeerId};

impl ProtocolCore {
    /// Run one outbound pass for a peer. `now_us` is the caller's clock in
    /// microseconds; all tick timers are measured against it.
    pub fn tick(&self, peer_id: PeerId, now_us: i64) {
        let Some(peer) = self.peer(peer_id) else {
            return;
        };
        // Don't send anything until the version handshake is complete.
        if !peer.successfully_connected() || peer.disconnect_requested() {
            return;
        }

        // Ping as a latency probe and keepalive.
        if peer.ping_due(now_us, PING_INTERVAL_US) {
            let mut nonce: u64 = 0;
            while nonce == 0 {
                nonce = rand::thread_rng().gen();
            }
            peer.start_ping(nonce, now_us);
            self.out.send(peer.id, Message::Ping(nonce));
        }

        // A contended chain lock means we skip this tick rather than block.
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        let state = &mut *state;

        if self.flush_rejects_and_maybe_ban(state, &peer) {
            return;
        }
        if state.peer(peer.id).is_none() {
            return;
        }

        let ibd = self.validator.is_initial_block_download();
        self.expire_pending_service_tx(now_us);

        // Address refresh broadcast.
        if !ibd && peer.next_local_addr_send_us() < now_us {
            if self.config.listen {
                if let Some(local) = self.addr_book.local_address(&peer.addr) {
                    if local.is_routable() {
                        peer.push_address(local);
                    }
                }
            }
            peer.set_next_local_addr_send_us(poisson_next_send(
                now_us,
                AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL_US,
            ));
        }

        if peer.next_addr_send_us() < now_us {
            peer.set_next_addr_send_us(poisson_next_send(now_us, AVG_ADDRESS_BROADCAST_INTERVAL_US));
            let mut batch = Vec::new();
            {
                let mut queues = peer.addrs.lock();
                let pending = std::mem::take(&mut queues.to_send);
                for addr in pending {
                    if queues.known.contains(&addr.key()) {
                        continue;
                    }
                    queues.known.insert(&addr.key());
                    batch.push(addr);
                    // The receiver rejects addr messages larger than 1000.
                    if batch.len() >= MAX_ADDR_SZ {
                        self.out
                            .send(peer.id, Message::Addr(std::mem::take(&mut batch)));
                    }
                }
            }
            if !batch.is_empty() {
                self.out.send(peer.id, Message::Addr(batch));
            }
        }

        // Download if this is a nice peer, or we have no nice peers and this
        // one might do.
        let fetch = state
            .peer(peer.id)
            .map(|s| s.preferred_download)
            .unwrap_or(false)
            || (state.preferred_download_count == 0 && !peer.is_client() && !peer.flags.one_shot);

        // Start header sync from a single peer, unless our best header is
        // close to today.
        if !peer.is_client() {
            let sync_started = state
                .peer(peer.id)
                .map(|s| s.sync_started)
                .unwrap_or(false);
            let best_header = state.chain.best_header();
            let near_today =
                state.chain.get(best_header).time > self.validator.adjusted_time() - 24 * 60 * 60;
            if !sync_started && ((state.sync_started_count == 0 && fetch) || near_today) {
                if let Some(peer_state) = state.peer_mut(peer.id) {
                    peer_state.sync_started = true;
                }
                state.sync_started_count += 1;
                // Start one block back from the best header, so an
                // up-to-date peer still sends a non-empty response and we
                // can initialize its best known block.
                let start = state.chain.get(best_header).prev.unwrap_or(best_header);
                debug!(
                    peer = %peer.id,
                    height = state.chain.get(start).height,
                    start_height = peer.start_height(),
                    "initial getheaders"
                );
                let locator = state.chain.locator_from(start);
                self.out.send(
                    peer.id,
                    Message::GetHeaders {
                        locator,
                        stop: Hash256::ZERO,
                    },
                );
            }
        }

        // Resend wallet transactions that haven't gotten in a block yet.
        if !ibd {
            if let Some(wallet) = &self.wallet {
                wallet.resend(state.best_received_time);
            }
        }

        self.announce_blocks(state, &peer);

        // Inventory drain: block invs first, then the trickle.
        let mut invs: Vec<Inv> = Vec::new();
        {
            let mut queues = peer.inventory.lock();
            for hash in std::mem::take(&mut queues.block_invs) {
                invs.push(Inv::block(hash));
                if invs.len() == MAX_INV_SZ {
                    self.out.send(peer.id, Message::Inv(std::mem::take(&mut invs)));
                }
            }

            let mut trickle = peer.flags.whitelisted;
            if peer.next_inv_send_us() < now_us {
                trickle = true;
                // Half the delay for outbound peers; less privacy concern.
                let interval = INVENTORY_BROADCAST_INTERVAL_US >> u32::from(!peer.flags.inbound);
                peer.set_next_inv_send_us(poisson_next_send(now_us, interval));
            }

            if trickle {
                if !peer.relay_txes() {
                    // The peer asked us not to relay transactions.
                    queues.tx_invs.clear();
                }
                state.relay.expire(now_us);

                let candidates: Vec<Hash256> = queues.tx_invs.iter().rev().copied().collect();
                let mut relayed = 0;
                for hash in candidates {
                    if relayed >= INVENTORY_BROADCAST_MAX {
                        // No reason to drain out at many times the network's
                        // capacity.
                        break;
                    }
                    queues.tx_invs.remove(&hash);
                    if queues.known.contains(hash.as_ref()) {
                        continue;
                    }
                    // Not in the mempool anymore? don't bother sending it.
                    let Some(tx) = self.mempool.get(&hash) else {
                        continue;
                    };
                    state.relay.insert(tx, now_us);
                    invs.push(Inv::tx(hash));
                    relayed += 1;
                    queues.known.insert(hash.as_ref());
                    if invs.len() == MAX_INV_SZ {
                        self.out.send(peer.id, Message::Inv(std::mem::take(&mut invs)));
                    }
                }
            }

            // Service-transaction invs are not trickled.
            let candidates: Vec<Hash256> = queues.stx_invs.iter().rev().copied().collect();
            let mut relayed = 0;
            for hash in candidates {
                if relayed >= INVENTORY_BROADCAST_MAX {
                    break;
                }
                queues.stx_invs.remove(&hash);
                if queues.known_service.contains(hash.as_ref()) {
                    continue;
                }
                invs.push(Inv::service_tx(hash));
                relayed += 1;
                if invs.len() == MAX_INV_SZ {
                    self.out.send(peer.id, Message::Inv(std::mem::take(&mut invs)));
                }
            }
        }
        if !invs.is_empty() {
            self.out.send(peer.id, Message::Inv(invs));
        }

        // Detect whether we're stalling.
        let (stalling_since, downloading_since, head_in_flight, in_flight_count) = {
            let peer_state = state.peer(peer.id).expect("checked above");
            (
                peer_state.stalling_since_us,
                peer_state.downloading_since_us,
                peer_state.blocks_in_flight.first().map(|qb| qb.hash),
                peer_state.blocks_in_flight.len(),
            )
        };
        if stalling_since > 0 && stalling_since < now_us - BLOCK_STALLING_TIMEOUT_US {
            // Stalling only triggers when the download window cannot move;
            // in steady state the window is much larger than the in-flight
            // set, so this fires during initial download.
            warn!(peer = %peer.id, "peer is stalling block download, disconnecting");
            peer.request_disconnect();
            return;
        }
        if let Some(head) = head_in_flight {
            // Compensate for other peers with validated downloads so our own
            // saturated link does not kill everyone off; only validated
            // in-flight blocks count, so peers cannot inflate our timeout
            // with made-up hashes.
            let timeout = state.block_download_timeout_us(peer.id, &self.config.consensus);
            if now_us > downloading_since + timeout {
                warn!(peer = %peer.id, block = %head, "timeout downloading block, disconnecting");
                peer.request_disconnect();
                return;
            }
        }

        // Block getdata via the scheduler.
        let mut getdata: Vec<Inv> = Vec::new();
        if !peer.is_client()
            && (fetch || !ibd)
            && in_flight_count < MAX_BLOCKS_IN_TRANSIT_PER_PEER
        {
            let (to_download, staller) = state
                .find_next_blocks_to_download(peer.id, MAX_BLOCKS_IN_TRANSIT_PER_PEER - in_flight_count);
            for id in to_download {
                let hash = state.chain.get(id).hash;
                getdata.push(Inv::block(hash));
                state.mark_block_in_flight(peer.id, hash, Some(id), now_us);
                debug!(
                    peer = %peer.id,
                    block = %hash,
                    height = state.chain.get(id).height,
                    "requesting block"
                );
            }
            let in_flight_now = state
                .peer(peer.id)
                .map(|s| s.blocks_in_flight.len())
                .unwrap_or(0);
            if in_flight_now == 0 {
                if let Some(staller) = staller {
                    if let Some(staller_state) = state.peer_mut(staller) {
                        if staller_state.stalling_since_us == 0 {
                            staller_state.stalling_since_us = now_us;
                            debug!(peer = %staller, "stall started");
                        }
                    }
                }
            }
        }

        // Drain the ask-for schedule for non-block inventory.
        while let Some(inv) = peer.pop_due_ask(now_us) {
            if self.already_have(state, &inv) {
                // If we're not going to ask, don't expect a response.
                continue;
            }
            if peer.inventory.lock().known_service.contains(inv.hash.as_ref()) {
                continue;
            }
            debug!(peer = %peer.id, %inv, "requesting inventory");
            getdata.push(inv);
            if getdata.len() >= 1000 {
                self.out
                    .send(peer.id, Message::GetData(std::mem::take(&mut getdata)));
            }
        }
        if !getdata.is_empty() {
            self.out.send(peer.id, Message::GetData(getdata));
        }
    }

    /// Announce queued blocks, preferring a connecting `headers` message and
    /// falling back to an inv of the tip when the suffix cannot connect.
    fn announce_blocks(&self, state: &mut CoreState, peer: &Peer) {
        let to_announce: Vec<Hash256> = {
            let mut queues = peer.inventory.lock();
            std::mem::take(&mut queues.blocks_to_announce)
        };
        if to_announce.is_empty() {
            return;
        }

        state.process_block_availability(peer.id);
        let prefer_headers = state
            .peer(peer.id)
            .map(|s| s.prefer_headers)
            .unwrap_or(false);

        let mut revert_to_inv = (!prefer_headers && to_announce.len() > 1)
            || to_announce.len() > MAX_BLOCKS_TO_ANNOUNCE;
        let mut headers: Vec<BlockHeader> = Vec::new();
        let mut best_index: Option<BlockId> = None;

        if !revert_to_inv {
            let mut found_start = false;
            // Find the first header the peer is missing but can connect, and
            // send everything past it.
            for hash in &to_announce {
                let Some(id) = state.chain.lookup(hash) else {
                    revert_to_inv = true;
                    break;
                };
                if !state.chain.contains(id) {
                    // We reorganized away from this block.
                    revert_to_inv = true;
                    break;
                }
                if let Some(best) = best_index {
                    if state.chain.get(id).prev != Some(best) {
                        // The announce list does not connect to itself; can
                        // happen with repeated invalidate/reconsider on the
                        // tip. Robustly fall back to an inv.
                        revert_to_inv = true;
                        break;
                    }
                }
                best_index = Some(id);
                if found_start {
                    headers.push(self.header_of(state, id));
                } else if state.peer_has_header(peer.id, id) {
                    // Keep looking for the first new block.
                } else if state
                    .chain
                    .get(id)
                    .prev
                    .map(|prev| state.peer_has_header(peer.id, prev))
                    .unwrap_or(true)
                {
                    found_start = true;
                    headers.push(self.header_of(state, id));
                } else {
                    // Neither this header nor the prior one connects.
                    revert_to_inv = true;
                    break;
                }
            }
        }

        if !revert_to_inv && !headers.is_empty() {
            if prefer_headers {
                debug!(
                    peer = %peer.id,
                    count = headers.len(),
                    first = %headers.first().expect("non-empty").hash,
                    "announcing headers"
                );
                self.out.send(peer.id, Message::Headers(headers));
                if let Some(peer_state) = state.peer_mut(peer.id) {
                    peer_state.best_header_sent = best_index;
                }
            } else {
                revert_to_inv = true;
            }
        }

        if revert_to_inv {
            // Just inv the tip; the last queued entry was our tip at some
            // point in the past.
            if let Some(last) = to_announce.last() {
                if let Some(id) = state.chain.lookup(last) {
                    if !state.chain.contains(id) {
                        info!(
                            block = %last,
                            tip = %state.chain.tip_entry().hash,
                            "announcing block not on main chain"
                        );
                    }
                    if !state.peer_has_header(peer.id, id) {
                        peer.push_inventory(Inv::new(InvKind::Block, *last));
                        debug!(peer = %peer.id, block = %last, "announcing via inv");
                    }
                }
            }
        }
    }

    fn header_of(&self, state: &CoreState, id: BlockId) -> BlockHeader {
        let entry = state.chain.get(id);
        let prev_hash = entry
            .prev
            .map(|prev| state.chain.get(prev).hash)
            .unwrap_or(Hash256::ZERO);
        BlockHeader::new(entry.hash, prev_hash, entry.time)
    }
}
