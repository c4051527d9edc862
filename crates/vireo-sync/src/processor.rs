//! The protocol core: owns the chain-lock aggregate, the peer objects, and
//! the collaborator handles; emits messages through the outbound sink.

use crate::chain::{
    AddrBook, BlockStore, CoinView, MempoolView, ServiceTxPool, ValidationFailure, Validator,
    WalletBroadcast,
};
use crate::peers::{BlockReject, NodeStateStats, PeerSyncState};
use crate::state::CoreState;
use crate::{ChainIndex, CoreConfig};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use vireo_net::{
    relay_targets, BanReason, Message, Outbound, Peer, PeerFlags, Reject, RejectCode,
    VersionMessage, PROTOCOL_VERSION,
};
use vireo_types::{
    Block, Hash256, Inv, InvKind, NetAddress, PeerId, ServiceFlags, ServiceTransaction,
    Transaction, NODE_NETWORK, NODE_NONE,
};

/// Handles to everything the core calls out to.
pub struct Collaborators {
    pub outbound: Arc<dyn Outbound>,
    pub validator: Arc<dyn Validator>,
    pub mempool: Arc<dyn MempoolView>,
    pub service_pool: Arc<dyn ServiceTxPool>,
    pub coins: Arc<dyn CoinView>,
    pub addr_book: Arc<dyn AddrBook>,
    pub block_store: Arc<dyn BlockStore>,
    /// Optional wallet rebroadcast hook.
    pub wallet: Option<Arc<dyn WalletBroadcast>>,
}

/// The peer message-processing core.
///
/// Construction must precede transport start; teardown must follow transport
/// stop. One coarse lock guards the chain index and every global map, with
/// peer-local locks only on the queue objects.
pub struct ProtocolCore {
    pub(crate) config: CoreConfig,
    pub(crate) local_services: ServiceFlags,
    pub(crate) relay_key: (u64, u64),

    pub(crate) state: Mutex<CoreState>,
    pub(crate) peers: DashMap<PeerId, Arc<Peer>>,

    pub(crate) out: Arc<dyn Outbound>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) mempool: Arc<dyn MempoolView>,
    pub(crate) service_pool: Arc<dyn ServiceTxPool>,
    pub(crate) coins: Arc<dyn CoinView>,
    pub(crate) addr_book: Arc<dyn AddrBook>,
    pub(crate) block_store: Arc<dyn BlockStore>,
    pub(crate) wallet: Option<Arc<dyn WalletBroadcast>>,

    /// Last fully-validated block, for fast announcement and serving.
    pub(crate) most_recent_block: Mutex<Option<(Hash256, Arc<Block>)>>,
    /// Service transactions whose payment check failed, kept for retry.
    /// Own lock; never held across the chain lock.
    pub(crate) pending_service_tx: Mutex<HashMap<Hash256, i64>>,

    pub(crate) interrupt: AtomicBool,
}

impl ProtocolCore {
    pub fn new(
        config: CoreConfig,
        local_services: ServiceFlags,
        chain: ChainIndex,
        collaborators: Collaborators,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            config,
            local_services,
            relay_key: (rng.gen(), rng.gen()),
            state: Mutex::new(CoreState::new(chain)),
            peers: DashMap::new(),
            out: collaborators.outbound,
            validator: collaborators.validator,
            mempool: collaborators.mempool,
            service_pool: collaborators.service_pool,
            coins: collaborators.coins,
            addr_book: collaborators.addr_book,
            block_store: collaborators.block_store,
            wallet: collaborators.wallet,
            most_recent_block: Mutex::new(None),
            pending_service_tx: Mutex::new(HashMap::new()),
            interrupt: AtomicBool::new(false),
        }
    }

    /// Ask in-progress handlers to bail out at the next message boundary.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock()
    }

    /// Register a new connection. Outbound connections start the handshake.
    pub fn initialize_peer(&self, id: PeerId, addr: NetAddress, addr_name: String, flags: PeerFlags) {
        let peer = Arc::new(Peer::new(id, addr, addr_name.clone(), flags));
        {
            let mut state = self.lock_state();
            state.peers.insert(id, PeerSyncState::new(addr, addr_name));
        }
        // Registry entry first: any thread that can see the peer object must
        // find its sync state.
        self.peers.insert(id, peer.clone());
        if !flags.inbound {
            self.push_version(&peer);
        }
    }

    /// Tear down a disconnected peer. Returns true when the connection
    /// completed cleanly and the address book should record the time.
    pub fn finalize_peer(&self, id: PeerId) -> bool {
        self.peers.remove(&id);
        let mut state = self.lock_state();
        let Some(peer_state) = state.peers.remove(&id) else {
            return false;
        };

        if peer_state.sync_started {
            state.sync_started_count -= 1;
        }
        let update_connection_time =
            peer_state.misbehavior == 0 && peer_state.currently_connected;

        for queued in &peer_state.blocks_in_flight {
            state.in_flight.remove(&queued.hash);
        }
        // Stale block-source entries for this peer would leak otherwise.
        state.block_source.retain(|_, (source, _)| *source != id);
        state.orphans.erase_for_peer(id);
        state.preferred_download_count -= peer_state.preferred_download as usize;
        state.peers_with_validated_downloads -= (peer_state.in_flight_validated > 0) as usize;

        if state.peers.is_empty() {
            // Consistency check after the last peer is removed.
            assert!(state.in_flight.is_empty());
            assert_eq!(state.preferred_download_count, 0);
            assert_eq!(state.peers_with_validated_downloads, 0);
            assert_eq!(state.sync_started_count, 0);
        }
        update_connection_time
    }

    /// Sync-state snapshot for RPC.
    pub fn node_state_stats(&self, id: PeerId) -> Option<NodeStateStats> {
        self.lock_state().node_state_stats(id)
    }

    /// Assert the cross-structure invariants. Test support.
    pub fn check_invariants(&self) {
        self.lock_state().check_invariants();
    }

    /// Start the handshake on an outbound connection.
    pub(crate) fn push_version(&self, peer: &Peer) {
        let nonce: u64 = rand::thread_rng().gen_range(1..u64::MAX);
        {
            let mut state = self.lock_state();
            state.local_version_nonces.insert(nonce);
        }
        let addr_you = if peer.addr.is_routable() {
            peer.addr
        } else {
            NetAddress::new("0.0.0.0:0".parse().expect("static addr"), NODE_NONE, 0)
        };
        let addr_me = self
            .addr_book
            .local_address(&peer.addr)
            .unwrap_or_else(|| {
                NetAddress::new("0.0.0.0:0".parse().expect("static addr"), self.local_services, 0)
            });
        let start_height = self.lock_state().chain.height() as i32;
        debug!(
            peer = %peer.id,
            version = PROTOCOL_VERSION,
            blocks = start_height,
            "send version message"
        );
        self.out.send(
            peer.id,
            Message::Version(VersionMessage {
                version: PROTOCOL_VERSION,
                services: self.local_services,
                time: self.validator.adjusted_time(),
                addr_recv: addr_you,
                addr_from: addr_me,
                nonce,
                subversion: self.config.user_agent.clone(),
                start_height,
                relay: !self.config.blocks_only,
            }),
        );
    }

    /// Whether this nonce belongs to one of our own outbound handshakes.
    pub(crate) fn is_local_nonce(&self, state: &CoreState, nonce: u64) -> bool {
        state.local_version_nonces.contains(&nonce)
    }

    /// `already_have`: do we already know this inventory from any source?
    /// For transactions, the rejects filter is re-anchored to the current
    /// tip first.
    pub(crate) fn already_have(&self, state: &mut CoreState, inv: &Inv) -> bool {
        match inv.kind {
            InvKind::Tx => {
                state.maybe_reset_rejects();
                state.recent_rejects.contains(inv.hash.as_ref())
                    || self.mempool.exists(&inv.hash)
                    || state.orphans.contains(&inv.hash)
                    // Best effort: only try outputs 0 and 1.
                    || self
                        .coins
                        .have_coin_in_cache(&vireo_types::OutPoint::new(inv.hash, 0))
                    || self
                        .coins
                        .have_coin_in_cache(&vireo_types::OutPoint::new(inv.hash, 1))
            }
            InvKind::Block | InvKind::FilteredBlock => state.chain.lookup(&inv.hash).is_some(),
            InvKind::ServiceTx => self.service_pool.exists(&inv.hash),
        }
    }

    /// Announce a transaction to every connected peer.
    pub fn relay_transaction(&self, tx: &Transaction) {
        let inv = Inv::tx(tx.txid);
        for entry in self.peers.iter() {
            entry.value().push_inventory(inv);
        }
    }

    /// Announce a service transaction to every connected peer.
    pub fn relay_service_transaction(&self, stx: &ServiceTransaction) {
        let inv = Inv::service_tx(stx.hash);
        for entry in self.peers.iter() {
            entry.value().push_inventory(inv);
        }
    }

    /// Relay an address to one or two deterministically chosen peers, so the
    /// same peers carry it for a 24-hour epoch.
    pub fn relay_address(&self, addr: &NetAddress, reachable: bool, now_s: i64) {
        let connected: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| entry.value().successfully_connected())
            .map(|entry| *entry.key())
            .collect();
        for target in relay_targets(self.relay_key, addr, now_s, reachable, &connected) {
            if let Some(peer) = self.peer(target) {
                peer.push_address(*addr);
            }
        }
    }

    /// Queue a reject for a block and optionally punish its source.
    pub(crate) fn handle_block_failure(
        &self,
        state: &mut CoreState,
        hash: Hash256,
        failure: &ValidationFailure,
    ) {
        if let Some(&(source, punish)) = state.block_source.get(&hash) {
            if state.peers.contains_key(&source) {
                if let Some(code) = failure.code {
                    let reject = BlockReject {
                        code,
                        reason: failure.reason.clone(),
                        hash,
                    };
                    if let Some(peer_state) = state.peer_mut(source) {
                        peer_state.rejects.push(reject);
                    }
                }
                if failure.dos > 0 && punish {
                    state.misbehaving(source, failure.dos, &failure.reason, self.config.banscore);
                }
            }
        }
        state.block_source.remove(&hash);
    }

    // --- validation-interface callbacks ---

    /// A block was connected to the chain: evict orphans it conflicts with,
    /// then retry pending service transactions whose payment may have just
    /// confirmed.
    pub fn block_connected(&self, block: &Block) {
        {
            let mut state = self.lock_state();
            let mut to_erase = Vec::new();
            for tx in &block.transactions {
                for input in &tx.inputs {
                    to_erase.extend(state.orphans.children_of(&input.hash));
                }
            }
            for hash in to_erase {
                state.orphans.erase(&hash);
            }
        }
        self.retry_pending_service_tx();
    }

    /// Re-check stashed service transactions against newly known payments.
    fn retry_pending_service_tx(&self) {
        let hashes: Vec<Hash256> = self.pending_service_tx.lock().keys().copied().collect();
        for hash in hashes {
            let Some(stx) = self.service_pool.get(&hash) else {
                self.pending_service_tx.lock().remove(&hash);
                continue;
            };
            let Some(payment) = self.validator.get_transaction(&stx.payment_hash) else {
                continue;
            };
            if self
                .validator
                .accept_service_transaction(&stx, &payment)
                .is_ok()
            {
                self.pending_service_tx.lock().remove(&hash);
                self.relay_service_transaction(&stx);
            }
        }
    }

    /// A new block passed proof-of-work and header checks: cache it and
    /// fast-announce the header to peers that can connect it.
    pub fn new_pow_valid_block(&self, block: &Block) {
        let hash = block.hash();
        let mut state = self.lock_state();
        let Some(id) = state.chain.lookup(&hash) else {
            return;
        };
        let height = state.chain.get(id).height;
        if height <= state.highest_fast_announce {
            return;
        }
        state.highest_fast_announce = height;

        {
            let mut recent = self.most_recent_block.lock();
            *recent = Some((hash, Arc::new(block.clone())));
        }

        let prev = state.chain.get(id).prev;
        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.disconnect_requested() {
                continue;
            }
            let peer_id = *entry.key();
            state.process_block_availability(peer_id);
            let has_this = state.peer_has_header(peer_id, id);
            let has_prev = prev.map(|p| state.peer_has_header(peer_id, p)).unwrap_or(false);
            if !has_this && has_prev {
                debug!(peer = %peer_id, block = %hash, "fast-announcing header");
                self.out
                    .send(peer_id, Message::Headers(vec![block.header]));
                if let Some(peer_state) = state.peer_mut(peer_id) {
                    peer_state.best_header_sent = Some(id);
                }
            }
        }
    }

    /// The active chain tip changed: re-anchor and queue announcements.
    pub fn updated_block_tip(&self, new_tip: Hash256, fork: Hash256, initial_download: bool) {
        let mut state = self.lock_state();
        let Some(tip_id) = state.chain.lookup(&new_tip) else {
            warn!(tip = %new_tip, "tip update for unknown block");
            return;
        };
        state.chain.set_active_tip(tip_id);
        let new_height = state.chain.get(tip_id).height as i32;

        if !initial_download {
            // Hashes of all blocks not previously on the best chain,
            // newest first, capped in case of a huge reorganization.
            let mut hashes = Vec::new();
            let mut cursor = Some(tip_id);
            while let Some(id) = cursor {
                let entry = state.chain.get(id);
                if entry.hash == fork {
                    break;
                }
                hashes.push(entry.hash);
                if hashes.len() == crate::MAX_BLOCKS_TO_ANNOUNCE {
                    break;
                }
                cursor = entry.prev;
            }
            for entry in self.peers.iter() {
                let peer = entry.value();
                let floor = match peer.start_height() {
                    -1 => 0,
                    h => h - 2000,
                };
                if new_height > floor {
                    for hash in hashes.iter().rev() {
                        peer.push_block_hash(*hash);
                    }
                }
            }
        }
        state.best_received_time = self.validator.adjusted_time();
    }

    /// Validation finished for a block we forwarded: deliver reject/DoS to
    /// its source.
    pub fn block_checked(&self, hash: Hash256, result: &Result<(), ValidationFailure>) {
        let mut state = self.lock_state();
        if let Err(failure) = result {
            self.handle_block_failure(&mut state, hash, failure);
        } else {
            state.block_source.remove(&hash);
        }
    }

    /// Flush queued rejects and action a pending ban. Returns true when the
    /// peer was disconnected.
    pub(crate) fn flush_rejects_and_maybe_ban(&self, state: &mut CoreState, peer: &Peer) -> bool {
        let Some(peer_state) = state.peer_mut(peer.id) else {
            return false;
        };
        for reject in peer_state.rejects.drain(..) {
            self.out.send(
                peer.id,
                Message::Reject(Reject::new(
                    "block",
                    reject.code,
                    &reject.reason,
                    Some(reject.hash),
                )),
            );
        }
        if peer_state.should_ban {
            peer_state.should_ban = false;
            if peer.flags.whitelisted {
                warn!(peer = %peer.id, addr = %peer.addr_name, "not punishing whitelisted peer");
            } else if peer.flags.manual {
                warn!(peer = %peer.id, addr = %peer.addr_name, "not punishing manually-added peer");
            } else {
                peer.request_disconnect();
                if peer.addr.is_local() {
                    warn!(peer = %peer.id, addr = %peer.addr_name, "not banning local peer");
                } else {
                    self.out.ban(peer.addr, BanReason::NodeMisbehaving);
                }
            }
            return true;
        }
        false
    }

    /// Expire stale pending service transactions. Called from the tick.
    pub(crate) fn expire_pending_service_tx(&self, now_us: i64) {
        let mut pending = self.pending_service_tx.lock();
        pending.retain(|_, &mut added| now_us - added < crate::PENDING_STX_EXPIRY_US);
    }

    /// Report a payload the transport could not parse: reply with a
    /// malformed reject and keep the connection alive.
    pub fn report_malformed(&self, peer_id: PeerId, command: &str) {
        self.out.send(
            peer_id,
            Message::Reject(Reject::new(
                command,
                RejectCode::Malformed,
                "error parsing message",
                None,
            )),
        );
    }

    /// Expected service bits for a connection we initiated.
    pub(crate) fn expected_services(&self, peer: &Peer) -> ServiceFlags {
        if !peer.flags.inbound && !peer.flags.feeler && !peer.flags.one_shot {
            NODE_NETWORK
        } else {
            NODE_NONE
        }
    }
}

/// Poisson-distributed next-send time used to randomize broadcast timing.
pub(crate) fn poisson_next_send(now_us: i64, average_interval_us: i64) -> i64 {
    let uniform: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..1.0);
    now_us + (-uniform.ln() * average_interval_us as f64 + 0.5) as i64
}
