//! End-to-end scenarios driving the protocol core with recording doubles
//! for the transport and the consensus collaborators.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use vireo_net::{
    BanReason, FilterLoad, Message, Outbound, PeerFlags, VersionMessage, MAX_BLOOM_FILTER_SIZE,
    MAX_HEADERS_RESULTS, MAX_INV_SZ, PROTOCOL_VERSION,
};
use vireo_sync::{
    AddrBook, BlockStore, BlockVerdict, ChainIndex, CoinView, Collaborators, CoreConfig,
    MempoolView, ProtocolCore, ServiceTxPool, TxVerdict, ValidationFailure, Validator,
};
use vireo_types::{
    Block, BlockHeader, Hash256, Inv, NetAddress, OutPoint, PeerId, ServiceFlags,
    ServiceTransaction, Transaction, NODE_BLOOM, NODE_NETWORK,
};

const GENESIS_TIME: i64 = 1_700_000_000;

/// Shared fake world behind every collaborator trait.
#[derive(Default)]
struct World {
    sent: Mutex<Vec<(PeerId, Message)>>,
    banned: Mutex<Vec<NetAddress>>,
    mempool: Mutex<HashMap<Hash256, Transaction>>,
    stx_pool: Mutex<HashMap<Hash256, ServiceTransaction>>,
    addr_book: Mutex<Vec<NetAddress>>,
    blocks: Mutex<HashMap<Hash256, Block>>,
    /// Txids whose outputs are spendable, as the validator sees it.
    known_outputs: Mutex<HashSet<Hash256>>,
    /// Scripted per-tx validation failures.
    tx_failures: Mutex<HashMap<Hash256, ValidationFailure>>,
    ibd: AtomicBool,
    adjusted_time: AtomicI64,
}

impl World {
    fn new() -> Arc<Self> {
        let world = Arc::new(Self::default());
        world.adjusted_time.store(GENESIS_TIME + 60, Ordering::Relaxed);
        world
    }

    fn sent_to(&self, peer: PeerId) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| *id == peer)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    fn commands_to(&self, peer: PeerId) -> Vec<String> {
        self.sent_to(peer)
            .iter()
            .map(|m| m.command().to_owned())
            .collect()
    }

    fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

struct WorldOutbound(Arc<World>);

impl Outbound for WorldOutbound {
    fn send(&self, peer: PeerId, message: Message) {
        self.0.sent.lock().push((peer, message));
    }

    fn ban(&self, addr: NetAddress, _reason: BanReason) {
        self.0.banned.lock().push(addr);
    }
}

struct WorldValidator(Arc<World>);

impl Validator for WorldValidator {
    fn check_header(&self, _header: &BlockHeader) -> Result<u128, ValidationFailure> {
        Ok(2)
    }

    fn submit_block(&self, block: &Block, _force: bool) -> BlockVerdict {
        self.0.blocks.lock().insert(block.hash(), block.clone());
        BlockVerdict::Accepted { work: 2 }
    }

    fn accept_transaction(&self, tx: &Transaction) -> TxVerdict {
        if let Some(failure) = self.0.tx_failures.lock().get(&tx.txid) {
            return TxVerdict::Invalid(failure.clone());
        }
        let known = self.0.known_outputs.lock();
        let mempool = self.0.mempool.lock();
        if tx
            .inputs
            .iter()
            .any(|input| !known.contains(&input.hash) && !mempool.contains_key(&input.hash))
        {
            return TxVerdict::MissingInputs;
        }
        drop(mempool);
        drop(known);
        self.0.mempool.lock().insert(tx.txid, tx.clone());
        self.0.known_outputs.lock().insert(tx.txid);
        TxVerdict::Accepted
    }

    fn accept_service_transaction(
        &self,
        _stx: &ServiceTransaction,
        _payment: &Transaction,
    ) -> Result<(), ValidationFailure> {
        Ok(())
    }

    fn get_transaction(&self, hash: &Hash256) -> Option<Transaction> {
        self.0.mempool.lock().get(hash).cloned()
    }

    fn is_initial_block_download(&self) -> bool {
        self.0.ibd.load(Ordering::Relaxed)
    }

    fn adjusted_time(&self) -> i64 {
        self.0.adjusted_time.load(Ordering::Relaxed)
    }
}

struct WorldMempool(Arc<World>);

impl MempoolView for WorldMempool {
    fn exists(&self, hash: &Hash256) -> bool {
        self.0.mempool.lock().contains_key(hash)
    }

    fn get(&self, hash: &Hash256) -> Option<Transaction> {
        self.0.mempool.lock().get(hash).cloned()
    }

    fn tx_hashes(&self) -> Vec<Hash256> {
        self.0.mempool.lock().keys().copied().collect()
    }
}

struct WorldServicePool(Arc<World>);

impl ServiceTxPool for WorldServicePool {
    fn add(&self, stx: &ServiceTransaction) {
        self.0.stx_pool.lock().insert(stx.hash, stx.clone());
    }

    fn exists(&self, hash: &Hash256) -> bool {
        self.0.stx_pool.lock().contains_key(hash)
    }

    fn get(&self, hash: &Hash256) -> Option<ServiceTransaction> {
        self.0.stx_pool.lock().get(hash).cloned()
    }
}

struct WorldCoins;

impl CoinView for WorldCoins {
    fn have_coin_in_cache(&self, _outpoint: &OutPoint) -> bool {
        false
    }
}

struct WorldAddrBook(Arc<World>);

impl AddrBook for WorldAddrBook {
    fn len(&self) -> usize {
        self.0.addr_book.lock().len()
    }

    fn add(&self, addrs: Vec<NetAddress>, _source: &NetAddress) {
        self.0.addr_book.lock().extend(addrs);
    }

    fn mark_good(&self, _addr: &NetAddress) {}

    fn select_for_getaddr(&self) -> Vec<NetAddress> {
        self.0.addr_book.lock().clone()
    }

    fn local_address(&self, _peer: &NetAddress) -> Option<NetAddress> {
        None
    }

    fn is_reachable(&self, _addr: &NetAddress) -> bool {
        true
    }
}

struct WorldBlockStore(Arc<World>);

impl BlockStore for WorldBlockStore {
    fn read_block(&self, hash: &Hash256) -> Option<Block> {
        self.0.blocks.lock().get(hash).cloned()
    }
}

fn genesis() -> BlockHeader {
    BlockHeader::new(Hash256::from_u64(1_000), Hash256::ZERO, GENESIS_TIME)
}

fn core_with(world: &Arc<World>, config: CoreConfig, services: ServiceFlags) -> ProtocolCore {
    ProtocolCore::new(
        config,
        services,
        ChainIndex::new(genesis()),
        Collaborators {
            outbound: Arc::new(WorldOutbound(world.clone())),
            validator: Arc::new(WorldValidator(world.clone())),
            mempool: Arc::new(WorldMempool(world.clone())),
            service_pool: Arc::new(WorldServicePool(world.clone())),
            coins: Arc::new(WorldCoins),
            addr_book: Arc::new(WorldAddrBook(world.clone())),
            block_store: Arc::new(WorldBlockStore(world.clone())),
            wallet: None,
        },
    )
}

fn test_core(world: &Arc<World>) -> ProtocolCore {
    core_with(world, CoreConfig::default(), NODE_NETWORK)
}

fn net_addr(octet: u8) -> NetAddress {
    NetAddress::new(
        format!("8.8.8.{}:5744", octet).parse().unwrap(),
        NODE_NETWORK,
        GENESIS_TIME,
    )
}

fn outbound_flags() -> PeerFlags {
    PeerFlags {
        inbound: false,
        ..PeerFlags::default()
    }
}

fn inbound_flags() -> PeerFlags {
    PeerFlags {
        inbound: true,
        ..PeerFlags::default()
    }
}

fn version_from_peer(nonce: u64) -> VersionMessage {
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: NODE_NETWORK,
        time: GENESIS_TIME + 60,
        addr_recv: net_addr(1),
        addr_from: net_addr(2),
        nonce,
        subversion: "/other:1.0/".to_owned(),
        start_height: 0,
        relay: true,
    }
}

/// Register an outbound peer and run both sides of the handshake.
fn connect_outbound(core: &ProtocolCore, world: &Arc<World>, id: u64) -> PeerId {
    let peer = PeerId(id);
    core.initialize_peer(peer, net_addr(id as u8), format!("peer{}", id), outbound_flags());
    core.handle_message(peer, Message::Version(version_from_peer(7_000 + id)), 0)
        .unwrap();
    core.handle_message(peer, Message::Verack, 0).unwrap();
    world.clear_sent();
    peer
}

fn headers_chain(count: u64) -> Vec<BlockHeader> {
    let mut headers = Vec::new();
    let mut prev = genesis().hash;
    for n in 0..count {
        let hash = Hash256::from_u64(2_000 + n);
        headers.push(BlockHeader::new(hash, prev, GENESIS_TIME + (n as i64 + 1) * 180));
        prev = hash;
    }
    headers
}

fn plain_tx(id: u64, parents: &[u64]) -> Transaction {
    Transaction::new(
        Hash256::from_u64(id),
        parents
            .iter()
            .map(|&p| OutPoint::new(Hash256::from_u64(p), 0))
            .collect(),
        1,
        Bytes::from(vec![0u8; 120]),
    )
}

#[test]
fn outbound_handshake_completes() {
    let world = World::new();
    let core = test_core(&world);
    let peer = PeerId(1);

    core.initialize_peer(peer, net_addr(1), "peer1".into(), outbound_flags());
    let commands = world.commands_to(peer);
    assert_eq!(commands, vec!["version"]);

    core.handle_message(peer, Message::Version(version_from_peer(42)), 0)
        .unwrap();
    core.handle_message(peer, Message::Verack, 0).unwrap();

    let commands = world.commands_to(peer);
    let position = |name: &str| commands.iter().position(|c| c == name);
    let verack = position("verack").expect("verack sent");
    let sendheaders = position("sendheaders").expect("sendheaders sent");
    assert!(verack < sendheaders);
    // Address book is nearly empty, so we ask for more.
    assert!(position("getaddr").is_some());

    let handle = core.peer(peer).unwrap();
    assert!(handle.successfully_connected());
    assert_eq!(handle.version(), PROTOCOL_VERSION);
    core.check_invariants();
}

#[test]
fn second_version_message_scores() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let err = core.handle_message(peer, Message::Version(version_from_peer(43)), 0);
    assert!(err.is_err());
    assert_eq!(core.node_state_stats(peer).unwrap().misbehavior, 1);
    let commands = world.commands_to(peer);
    assert_eq!(commands, vec!["reject"]);
}

#[test]
fn self_connect_disconnects_without_addrman_entry() {
    let world = World::new();
    let core = test_core(&world);

    // Our outbound handshake reveals the nonce we used.
    core.initialize_peer(PeerId(1), net_addr(1), "peer1".into(), outbound_flags());
    let our_nonce = world
        .sent_to(PeerId(1))
        .into_iter()
        .find_map(|m| match m {
            Message::Version(v) => Some(v.nonce),
            _ => None,
        })
        .expect("outbound version sent");

    // An inbound connection replaying that nonce is ourselves.
    let inbound = PeerId(2);
    core.initialize_peer(inbound, net_addr(2), "peer2".into(), inbound_flags());
    core.handle_message(inbound, Message::Version(version_from_peer(our_nonce)), 0)
        .unwrap();

    let handle = core.peer(inbound).unwrap();
    assert!(handle.disconnect_requested());
    assert!(!handle.successfully_connected());
    assert!(world.addr_book.lock().is_empty());
}

#[test]
fn obsolete_version_is_rejected_and_disconnected() {
    let world = World::new();
    let core = test_core(&world);
    let peer = PeerId(1);
    core.initialize_peer(peer, net_addr(1), "peer1".into(), inbound_flags());

    let mut version = version_from_peer(9);
    version.version = 1;
    core.handle_message(peer, Message::Version(version), 0).unwrap();

    assert!(core.peer(peer).unwrap().disconnect_requested());
    assert!(world.commands_to(peer).contains(&"reject".to_owned()));
}

#[test]
fn oversized_inv_scores_but_keeps_connection() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let invs: Vec<Inv> = (0..(MAX_INV_SZ as u64 + 1))
        .map(|n| Inv::tx(Hash256::from_u64(n)))
        .collect();
    let result = core.handle_message(peer, Message::Inv(invs), 0);

    assert!(result.is_err());
    assert_eq!(core.node_state_stats(peer).unwrap().misbehavior, 20);
    assert!(!core.peer(peer).unwrap().disconnect_requested());
    // No getdata went out for any of the entries.
    assert!(!world.commands_to(peer).contains(&"getdata".to_owned()));
}

#[test]
fn repeated_misbehavior_at_threshold_bans() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let oversized: Vec<Inv> = (0..(MAX_INV_SZ as u64 + 1))
        .map(|n| Inv::tx(Hash256::from_u64(n)))
        .collect();

    for _ in 0..4 {
        let _ = core.handle_message(peer, Message::Inv(oversized.clone()), 0);
    }
    // 80 points: still below the threshold.
    assert!(!core.peer(peer).unwrap().disconnect_requested());
    assert!(world.banned.lock().is_empty());

    let _ = core.handle_message(peer, Message::Inv(oversized.clone()), 0);
    // 100 points: the flush after the handler actions the ban.
    assert!(core.peer(peer).unwrap().disconnect_requested());
    assert_eq!(world.banned.lock().len(), 1);
}

#[test]
fn duplicate_inv_yields_single_getdata() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let inv = Inv::tx(Hash256::from_u64(77));
    core.handle_message(peer, Message::Inv(vec![inv]), 0).unwrap();
    core.handle_message(peer, Message::Inv(vec![inv]), 1).unwrap();

    core.tick(peer, 10);
    core.tick(peer, 20);

    let requests: usize = world
        .sent_to(peer)
        .iter()
        .filter(|m| match m {
            Message::GetData(invs) => invs.iter().any(|i| i.hash == inv.hash),
            _ => false,
        })
        .count();
    assert_eq!(requests, 1);
    core.check_invariants();
}

#[test]
fn orphan_is_parked_then_resolved_by_its_parent() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    // Parent A spends a known coin; child B spends A.
    world.known_outputs.lock().insert(Hash256::from_u64(500));
    let parent = plain_tx(501, &[500]);
    let child = plain_tx(502, &[501]);

    core.handle_message(peer, Message::Tx(child.clone()), 0).unwrap();
    // B is parked and A is scheduled for request.
    assert!(!world.mempool.lock().contains_key(&child.txid));
    let handle = core.peer(peer).unwrap();
    assert!(handle.has_pending_ask(&parent.txid));
    core.check_invariants();

    core.handle_message(peer, Message::Tx(parent.clone()), 10).unwrap();
    // A is accepted and B follows.
    assert!(world.mempool.lock().contains_key(&parent.txid));
    assert!(world.mempool.lock().contains_key(&child.txid));
    core.check_invariants();

    // Re-announcing B is a no-op now.
    core.handle_message(peer, Message::Inv(vec![Inv::tx(child.txid)]), 20)
        .unwrap();
    assert!(!core.peer(peer).unwrap().has_pending_ask(&child.txid));
}

#[test]
fn orphan_resolution_is_order_independent() {
    // Accepting parents in either order yields the same mempool set.
    for reversed in [false, true] {
        let world = World::new();
        let core = test_core(&world);
        let peer = connect_outbound(&core, &world, 1);

        world.known_outputs.lock().insert(Hash256::from_u64(600));
        world.known_outputs.lock().insert(Hash256::from_u64(601));
        let mut parents = vec![plain_tx(610, &[600]), plain_tx(611, &[601])];
        let child = plain_tx(612, &[610, 611]);

        core.handle_message(peer, Message::Tx(child.clone()), 0).unwrap();
        if reversed {
            parents.reverse();
        }
        for (step, parent) in parents.into_iter().enumerate() {
            core.handle_message(peer, Message::Tx(parent), step as i64 + 1)
                .unwrap();
        }
        assert!(world.mempool.lock().contains_key(&child.txid));
        core.check_invariants();
    }
}

#[test]
fn rejected_tx_is_filtered_until_tip_changes() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let tx = plain_tx(700, &[699]);
    world.tx_failures.lock().insert(
        tx.txid,
        ValidationFailure::new(vireo_net::RejectCode::Invalid, "bad-txns", 0),
    );
    core.handle_message(peer, Message::Tx(tx.clone()), 0).unwrap();
    assert!(world.commands_to(peer).contains(&"reject".to_owned()));

    // While the tip is unchanged the inventory is ignored.
    core.handle_message(peer, Message::Inv(vec![Inv::tx(tx.txid)]), 10)
        .unwrap();
    assert!(!core.peer(peer).unwrap().has_pending_ask(&tx.txid));

    // Grow the chain by one block and move the tip.
    let header = headers_chain(1)[0];
    core.handle_message(peer, Message::Headers(vec![header]), 20).unwrap();
    core.updated_block_tip(header.hash, genesis().hash, false);

    // The filter was reset; the transaction gets a second chance.
    world.tx_failures.lock().clear();
    core.handle_message(peer, Message::Inv(vec![Inv::tx(tx.txid)]), 30)
        .unwrap();
    assert!(core.peer(peer).unwrap().has_pending_ask(&tx.txid));
}

#[test]
fn headers_direct_fetch_marks_blocks_in_flight() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let headers = headers_chain(3);
    core.handle_message(peer, Message::Headers(headers.clone()), 0).unwrap();

    let getdata: Vec<Inv> = world
        .sent_to(peer)
        .into_iter()
        .find_map(|m| match m {
            Message::GetData(invs) => Some(invs),
            _ => None,
        })
        .expect("direct fetch issued");
    // Earliest to latest.
    let hashes: Vec<Hash256> = getdata.iter().map(|i| i.hash).collect();
    assert_eq!(hashes, headers.iter().map(|h| h.hash).collect::<Vec<_>>());
    core.check_invariants();
}

#[test]
fn full_headers_message_pipelines_next_getheaders() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let headers = headers_chain(MAX_HEADERS_RESULTS as u64);
    core.handle_message(peer, Message::Headers(headers), 0).unwrap();
    assert!(world.commands_to(peer).contains(&"getheaders".to_owned()));

    world.clear_sent();
    // An empty response stops the pipeline.
    core.handle_message(peer, Message::Headers(vec![]), 10).unwrap();
    assert!(!world.commands_to(peer).contains(&"getheaders".to_owned()));
}

#[test]
fn oversized_headers_scores() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let headers = headers_chain(MAX_HEADERS_RESULTS as u64 + 1);
    assert!(core.handle_message(peer, Message::Headers(headers), 0).is_err());
    assert_eq!(core.node_state_stats(peer).unwrap().misbehavior, 20);
}

#[test]
fn disconnected_headers_score_twenty() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let chained = headers_chain(2);
    let gap = BlockHeader::new(
        Hash256::from_u64(9_999),
        Hash256::from_u64(8_888),
        GENESIS_TIME + 900,
    );
    let result = core.handle_message(peer, Message::Headers(vec![chained[0], gap]), 0);
    assert!(result.is_err());
    assert_eq!(core.node_state_stats(peer).unwrap().misbehavior, 20);
}

#[test]
fn stalled_block_download_times_out() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    // Direct fetch puts three blocks in flight from this peer.
    core.handle_message(peer, Message::Headers(headers_chain(3)), 0).unwrap();
    assert!(core.node_state_stats(peer).unwrap().heights_in_flight.len() == 3);
    world.clear_sent();

    // The tip is past the service upgrade, so spacing is 150 seconds and
    // the timeout with no other downloading peers is one spacing.
    let timeout_us = 150 * 1_000_000;
    core.tick(peer, timeout_us - 1);
    assert!(!core.peer(peer).unwrap().disconnect_requested());

    // One target-spacing multiple later the peer is cut loose.
    core.tick(peer, timeout_us + 1);
    assert!(core.peer(peer).unwrap().disconnect_requested());
}

#[test]
fn finalize_clears_per_peer_state() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    core.handle_message(peer, Message::Headers(headers_chain(3)), 0).unwrap();
    // Park an orphan from this peer too.
    core.handle_message(peer, Message::Tx(plain_tx(800, &[799])), 0).unwrap();

    let clean = core.finalize_peer(peer);
    assert!(clean, "no misbehavior and handshake completed");
    core.check_invariants();
    assert!(core.peer(peer).is_none());
}

#[test]
fn finalize_after_misbehavior_is_not_clean() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let oversized: Vec<Inv> = (0..(MAX_INV_SZ as u64 + 1))
        .map(|n| Inv::tx(Hash256::from_u64(n)))
        .collect();
    let _ = core.handle_message(peer, Message::Inv(oversized), 0);
    assert!(!core.finalize_peer(peer));
}

#[test]
fn getdata_serves_tx_from_relay_and_reports_missing() {
    let world = World::new();
    let core = test_core(&world);
    let sender = connect_outbound(&core, &world, 1);
    let asker = connect_outbound(&core, &world, 2);

    // Accept a transaction from one peer and trickle it to the other.
    world.known_outputs.lock().insert(Hash256::from_u64(900));
    let tx = plain_tx(901, &[900]);
    core.handle_message(sender, Message::Tx(tx.clone()), 0).unwrap();
    core.tick(asker, 1_000_000);

    world.clear_sent();
    let missing = Hash256::from_u64(999);
    core.handle_message(
        asker,
        Message::GetData(vec![Inv::tx(tx.txid), Inv::tx(missing)]),
        1_000_001,
    )
    .unwrap();

    let messages = world.sent_to(asker);
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::Tx(served) if served.txid == tx.txid)));
    match messages.last().unwrap() {
        Message::NotFound(invs) => assert_eq!(invs, &vec![Inv::tx(missing)]),
        other => panic!("expected notfound, got {}", other.command()),
    }
}

#[test]
fn blocks_only_mode_ignores_tx_inventory() {
    let world = World::new();
    let config = CoreConfig {
        blocks_only: true,
        ..CoreConfig::default()
    };
    let core = core_with(&world, config, NODE_NETWORK);
    let peer = connect_outbound(&core, &world, 1);

    core.handle_message(peer, Message::Inv(vec![Inv::tx(Hash256::from_u64(5))]), 0)
        .unwrap();
    // Ignored, not scored.
    assert!(!core.peer(peer).unwrap().has_pending_ask(&Hash256::from_u64(5)));
    assert_eq!(core.node_state_stats(peer).unwrap().misbehavior, 0);
}

#[test]
fn tip_update_announces_block_to_peers() {
    let world = World::new();
    let core = test_core(&world);
    let syncer = connect_outbound(&core, &world, 1);
    let listener = connect_outbound(&core, &world, 2);

    let header = headers_chain(1)[0];
    core.handle_message(syncer, Message::Headers(vec![header]), 0).unwrap();
    core.updated_block_tip(header.hash, genesis().hash, false);
    world.clear_sent();

    core.tick(listener, 1_000);
    let announced = world.sent_to(listener).into_iter().any(|m| match m {
        Message::Inv(invs) => invs.iter().any(|i| i.hash == header.hash),
        Message::Headers(headers) => headers.iter().any(|h| h.hash == header.hash),
        _ => false,
    });
    assert!(announced, "tip should reach the other peer");
}

#[test]
fn service_tx_without_payment_is_stashed_not_relayed() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);
    let other = connect_outbound(&core, &world, 2);

    let stx = ServiceTransaction::new(
        Hash256::from_u64(1_500),
        Hash256::from_u64(1_501),
        Bytes::from_static(b"svc"),
    );
    core.handle_message(peer, Message::ServiceTx(stx.clone()), 0).unwrap();
    assert!(world.stx_pool.lock().contains_key(&stx.hash));

    // No payment known yet: nothing announced to the other peer.
    core.tick(other, 1_000);
    assert!(!world.sent_to(other).iter().any(|m| match m {
        Message::Inv(invs) => invs.iter().any(|i| i.hash == stx.hash),
        _ => false,
    }));

    // Once the payment lands in a block, the retry relays it.
    world.known_outputs.lock().insert(Hash256::from_u64(1_502));
    let payment = Transaction::new(
        Hash256::from_u64(1_501),
        vec![OutPoint::new(Hash256::from_u64(1_502), 0)],
        1,
        Bytes::from_static(b"pay"),
    );
    world.mempool.lock().insert(payment.txid, payment.clone());
    core.block_connected(&Block::new(headers_chain(1)[0], vec![]));
    core.tick(other, 2_000);
    assert!(world.sent_to(other).iter().any(|m| match m {
        Message::Inv(invs) => invs.iter().any(|i| i.hash == stx.hash),
        _ => false,
    }));
}

#[test]
fn oversized_addr_scores_twenty() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let addrs: Vec<NetAddress> = (0..1001u32)
        .map(|n| {
            NetAddress::new(
                format!("9.{}.{}.1:5744", n / 256, n % 256).parse().unwrap(),
                NODE_NETWORK,
                GENESIS_TIME,
            )
        })
        .collect();
    assert!(core.handle_message(peer, Message::Addr(addrs), 0).is_err());
    assert_eq!(core.node_state_stats(peer).unwrap().misbehavior, 20);
    assert!(world.addr_book.lock().is_empty());
}

#[test]
fn fresh_addresses_relay_to_deterministic_peers() {
    let world = World::new();
    let core = test_core(&world);
    let source = connect_outbound(&core, &world, 1);
    let others = [connect_outbound(&core, &world, 2), connect_outbound(&core, &world, 3)];

    // The first response clears the awaiting-addr flag; its stale timestamp
    // keeps it from being relayed.
    let stale = NetAddress::new("7.7.7.7:5744".parse().unwrap(), NODE_NETWORK, 100);
    core.handle_message(source, Message::Addr(vec![stale]), 0).unwrap();

    let now_s = GENESIS_TIME + 60;
    let fresh = NetAddress::new("9.9.9.9:5744".parse().unwrap(), NODE_NETWORK, now_s);
    core.handle_message(source, Message::Addr(vec![fresh]), 0).unwrap();

    let carriers = [source, others[0], others[1]]
        .iter()
        .filter(|&&id| {
            core.peer(id)
                .unwrap()
                .addrs
                .lock()
                .to_send
                .iter()
                .any(|a| a.addr == fresh.addr)
        })
        .count();
    // Reachable addresses go to at most two deterministic carriers.
    assert!((1..=2).contains(&carriers), "carriers = {}", carriers);
    assert!(!world.addr_book.lock().is_empty());
}

#[test]
fn getheaders_serves_from_fork_point() {
    let world = World::new();
    let core = test_core(&world);
    let syncer = connect_outbound(&core, &world, 1);
    let asker = connect_outbound(&core, &world, 2);

    let headers = headers_chain(3);
    core.handle_message(syncer, Message::Headers(headers.clone()), 0).unwrap();
    core.updated_block_tip(headers[2].hash, genesis().hash, false);
    world.clear_sent();

    core.handle_message(
        asker,
        Message::GetHeaders {
            locator: vireo_types::Locator::new(vec![genesis().hash]),
            stop: Hash256::ZERO,
        },
        10,
    )
    .unwrap();

    let served = world
        .sent_to(asker)
        .into_iter()
        .find_map(|m| match m {
            Message::Headers(served) => Some(served),
            _ => None,
        })
        .expect("headers served");
    assert_eq!(
        served.iter().map(|h| h.hash).collect::<Vec<_>>(),
        headers.iter().map(|h| h.hash).collect::<Vec<_>>()
    );
}

#[test]
fn served_block_triggers_continuation_inv() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    let header = headers_chain(1)[0];
    core.handle_message(peer, Message::Headers(vec![header]), 0).unwrap();
    let block = Block::new(header, vec![]);
    core.handle_message(peer, Message::Block(block), 5).unwrap();
    core.updated_block_tip(header.hash, genesis().hash, false);

    // Pretend an earlier getblocks hit its page limit at this block.
    *core.peer(peer).unwrap().hash_continue.lock() = Some(header.hash);
    world.clear_sent();

    core.handle_message(peer, Message::GetData(vec![Inv::block(header.hash)]), 10)
        .unwrap();

    let messages = world.sent_to(peer);
    assert!(matches!(messages.first(), Some(Message::Block(b)) if b.hash() == header.hash));
    assert!(messages.iter().any(|m| match m {
        Message::Inv(invs) => invs.iter().any(|i| i.hash == header.hash),
        _ => false,
    }));
    assert!(core.peer(peer).unwrap().hash_continue.lock().is_none());
}

#[test]
fn oversized_filterload_scores_but_still_enables_relay() {
    let world = World::new();
    let core = core_with(&world, CoreConfig::default(), NODE_NETWORK | NODE_BLOOM);

    let peer = PeerId(1);
    core.initialize_peer(peer, net_addr(1), "peer1".into(), outbound_flags());
    let mut version = version_from_peer(42);
    version.relay = false;
    core.handle_message(peer, Message::Version(version), 0).unwrap();
    core.handle_message(peer, Message::Verack, 0).unwrap();
    assert!(!core.peer(peer).unwrap().relay_txes());

    let filter = FilterLoad {
        data: vec![0; MAX_BLOOM_FILTER_SIZE + 1],
        hash_funcs: 1,
        tweak: 0,
    };
    core.handle_message(peer, Message::FilterLoad(filter), 10).unwrap();

    // The filter is refused and scored, but the peer is switched into relay
    // mode all the same.
    assert_eq!(core.node_state_stats(peer).unwrap().misbehavior, 100);
    assert!(core.peer(peer).unwrap().filter.lock().is_none());
    assert!(core.peer(peer).unwrap().relay_txes());
}

#[test]
fn ping_pong_round_trip_records_rtt() {
    let world = World::new();
    let core = test_core(&world);
    let peer = connect_outbound(&core, &world, 1);

    core.tick(peer, 200_000_000);
    let nonce = world
        .sent_to(peer)
        .into_iter()
        .find_map(|m| match m {
            Message::Ping(nonce) => Some(nonce),
            _ => None,
        })
        .expect("ping sent");

    core.handle_message(peer, Message::Pong(nonce), 200_070_000).unwrap();
    let handle = core.peer(peer).unwrap();
    assert_eq!(handle.ping_time_us(), 70_000);
    assert_eq!(handle.ping_nonce_sent(), 0);
}
