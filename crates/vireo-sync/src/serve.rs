//! Serving `getdata`: a single ordered pass over the peer's request queue.

use crate::processor::ProtocolCore;
use tracing::{debug, info};
use vireo_net::{FilteredBlock, Message, Peer};
use vireo_types::{Block, Hash256, Inv, InvKind};

const ONE_WEEK_S: i64 = 7 * 24 * 60 * 60;
const ONE_MONTH_S: i64 = 30 * 24 * 60 * 60;

impl ProtocolCore {
    /// Drain the peer's pending getdata queue. Responses preserve request
    /// order; at most one block is served per pass, and the pass stops early
    /// when the send buffer saturates or an interrupt is requested.
    pub(crate) fn process_getdata(&self, peer: &Peer, _now_us: i64) {
        let mut not_found: Vec<Inv> = Vec::new();
        let state = self.lock_state();

        loop {
            // Don't bother if the send buffer is too full to respond anyway.
            if self.out.send_buffer_full(peer.id) {
                break;
            }
            if self.interrupted() {
                return;
            }
            let Some(inv) = peer.getdata_queue.lock().pop_front() else {
                break;
            };

            match inv.kind {
                InvKind::Block | InvKind::FilteredBlock => {
                    let mut send = false;
                    let looked_up = state.chain.lookup(&inv.hash);
                    if let Some(id) = looked_up {
                        if state.chain.contains(id) {
                            send = true;
                        } else {
                            // To prevent fingerprinting attacks, only send
                            // blocks off the active chain when they are
                            // validated and no more than a month older, in
                            // time and in equivalent work, than our best
                            // header.
                            let entry = state.chain.get(id);
                            let best = state.chain.get(state.chain.best_header());
                            let spacing = self
                                .config
                                .consensus
                                .target_spacing_at(state.chain.tip_entry().time);
                            let age = best.time - entry.time;
                            let work_equivalent_age =
                                (best.height.saturating_sub(entry.height)) as i64 * spacing;
                            send = entry.valid_scripts
                                && age < ONE_MONTH_S
                                && work_equivalent_age < ONE_MONTH_S;
                            if !send {
                                info!(
                                    peer = %peer.id,
                                    block = %inv.hash,
                                    "ignoring request for old block not on the main chain"
                                );
                            }
                        }
                    }

                    // Historical-block serving budget. Whitelisted peers are
                    // never disconnected for it.
                    if send && self.out.outbound_target_reached(true) && !peer.flags.whitelisted {
                        let id = looked_up.expect("send implies lookup");
                        let entry = state.chain.get(id);
                        let best = state.chain.get(state.chain.best_header());
                        let historical = best.time - entry.time > ONE_WEEK_S;
                        if historical || inv.kind == InvKind::FilteredBlock {
                            info!(peer = %peer.id, "historical block serving limit reached, disconnecting");
                            peer.request_disconnect();
                            send = false;
                        }
                    }

                    if send {
                        let id = looked_up.expect("send implies lookup");
                        if state.chain.get(id).have_data {
                            match self.fetch_block(&inv.hash) {
                                Some(block) => {
                                    self.send_block(peer, &inv, &block);
                                    // Trigger the peer to getblocks the next
                                    // batch of inventory.
                                    let mut continuation = peer.hash_continue.lock();
                                    if *continuation == Some(inv.hash) {
                                        let tip_hash = state.chain.tip_entry().hash;
                                        self.out.send(
                                            peer.id,
                                            Message::Inv(vec![Inv::block(tip_hash)]),
                                        );
                                        *continuation = None;
                                    }
                                }
                                None => {
                                    debug!(block = %inv.hash, "cannot load block from disk");
                                }
                            }
                        }
                    }
                    // One block per pass keeps responses in request order.
                    break;
                }
                InvKind::Tx => {
                    // Serve from relay memory.
                    match state.relay.get(&inv.hash) {
                        Some(tx) => self.out.send(peer.id, Message::Tx(tx.clone())),
                        None => not_found.push(inv),
                    }
                }
                InvKind::ServiceTx => match self.service_pool.get(&inv.hash) {
                    Some(stx) => {
                        peer.add_known_inventory(Inv::service_tx(inv.hash));
                        self.out.send(peer.id, Message::ServiceTx(stx));
                    }
                    None => not_found.push(inv),
                },
            }
        }

        if !not_found.is_empty() {
            // Let the peer know, so SPV clients walking dependencies don't
            // wait around forever.
            self.out.send(peer.id, Message::NotFound(not_found));
        }
    }

    /// Fetch a block from the single-slot recent cache, falling back to disk.
    fn fetch_block(&self, hash: &Hash256) -> Option<Block> {
        {
            let recent = self.most_recent_block.lock();
            if let Some((recent_hash, block)) = recent.as_ref() {
                if recent_hash == hash {
                    return Some(block.as_ref().clone());
                }
            }
        }
        self.block_store.read_block(hash)
    }

    fn send_block(&self, peer: &Peer, inv: &Inv, block: &Block) {
        match inv.kind {
            InvKind::Block => self.out.send(peer.id, Message::Block(block.clone())),
            InvKind::FilteredBlock => {
                let filtered = {
                    let filter = peer.filter.lock();
                    filter
                        .as_ref()
                        .map(|filter| FilteredBlock::from_block(block, filter))
                };
                if let Some((merkle, matched)) = filtered {
                    self.out.send(peer.id, Message::MerkleBlock(merkle));
                    // A merkle block only carries hashes; push the matched
                    // transactions right after, since the peer has no way to
                    // request one it did not see.
                    for tx in matched {
                        self.out.send(peer.id, Message::Tx(tx));
                    }
                }
                // No filter loaded: no response.
            }
            _ => unreachable!("block kinds only"),
        }
    }
}
