//! The per-peer connection object and its locally-locked queues.

use crate::bloom::{PeerFilter, RollingFilter};
use crate::{
    ASK_FOR_RETRY_US, KNOWN_ADDRESSES_CAPACITY, KNOWN_INVENTORY_CAPACITY, MAX_ADDR_SZ, MAX_ASK_FOR,
};
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use vireo_types::{Hash256, Inv, InvKind, NetAddress, PeerId, ServiceFlags};

/// Connection attributes fixed at accept/connect time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerFlags {
    pub inbound: bool,
    pub whitelisted: bool,
    /// Connect, fetch addresses, disconnect.
    pub one_shot: bool,
    /// Connection made only to verify the address is alive.
    pub feeler: bool,
    /// Manually added; spared from banning.
    pub manual: bool,
}

/// Inventory queues, guarded by one peer-local lock.
pub struct InventoryQueues {
    /// Block hashes the tip-update callback queued for announcement.
    pub blocks_to_announce: Vec<Hash256>,
    /// Block invs ready to send.
    pub block_invs: Vec<Hash256>,
    /// Transaction invs awaiting the trickle timer.
    pub tx_invs: BTreeSet<Hash256>,
    /// Service-transaction invs awaiting the trickle timer.
    pub stx_invs: BTreeSet<Hash256>,
    /// What the peer is believed to know already.
    pub known: RollingFilter,
    /// Service data the peer is believed to know already.
    pub known_service: RollingFilter,
}

/// Address queues, guarded by one peer-local lock.
pub struct AddrQueues {
    pub to_send: Vec<NetAddress>,
    pub known: RollingFilter,
}

struct AskForQueue {
    /// Earliest-request-time schedule. Multiple invs may share a slot.
    schedule: BTreeMap<i64, Vec<Inv>>,
    pending: HashSet<Hash256>,
    len: usize,
}

/// A connected peer: handshake and liveness state plus the queues the
/// protocol core drains. All locks here are peer-local and ordered before
/// the chain lock.
pub struct Peer {
    pub id: PeerId,
    pub addr: NetAddress,
    pub addr_name: String,
    pub flags: PeerFlags,

    version: AtomicU32,
    send_version: AtomicU32,
    services: AtomicU64,
    subversion: Mutex<String>,
    start_height: AtomicI32,
    successfully_connected: AtomicBool,
    disconnect: AtomicBool,
    relay_txes: AtomicBool,
    sent_addr: AtomicBool,
    awaiting_addr: AtomicBool,
    time_offset: AtomicI64,
    last_tx_time: AtomicI64,

    ping_nonce_sent: AtomicU64,
    ping_start_us: AtomicI64,
    ping_time_us: AtomicI64,
    min_ping_us: AtomicI64,
    ping_queued: AtomicBool,

    next_addr_send_us: AtomicI64,
    next_local_addr_send_us: AtomicI64,
    next_inv_send_us: AtomicI64,

    pub inventory: Mutex<InventoryQueues>,
    pub addrs: Mutex<AddrQueues>,
    ask_for: Mutex<AskForQueue>,
    pub getdata_queue: Mutex<VecDeque<Inv>>,
    pub hash_continue: Mutex<Option<Hash256>>,
    pub filter: Mutex<Option<PeerFilter>>,
}

impl Peer {
    pub fn new(id: PeerId, addr: NetAddress, addr_name: String, flags: PeerFlags) -> Self {
        Self {
            id,
            addr,
            addr_name,
            flags,
            version: AtomicU32::new(0),
            send_version: AtomicU32::new(crate::MIN_PROTO_VERSION),
            services: AtomicU64::new(0),
            subversion: Mutex::new(String::new()),
            start_height: AtomicI32::new(-1),
            successfully_connected: AtomicBool::new(false),
            disconnect: AtomicBool::new(false),
            relay_txes: AtomicBool::new(false),
            sent_addr: AtomicBool::new(false),
            awaiting_addr: AtomicBool::new(false),
            time_offset: AtomicI64::new(0),
            last_tx_time: AtomicI64::new(0),
            ping_nonce_sent: AtomicU64::new(0),
            ping_start_us: AtomicI64::new(0),
            ping_time_us: AtomicI64::new(0),
            min_ping_us: AtomicI64::new(i64::MAX),
            ping_queued: AtomicBool::new(false),
            next_addr_send_us: AtomicI64::new(0),
            next_local_addr_send_us: AtomicI64::new(0),
            next_inv_send_us: AtomicI64::new(0),
            inventory: Mutex::new(InventoryQueues {
                blocks_to_announce: Vec::new(),
                block_invs: Vec::new(),
                tx_invs: BTreeSet::new(),
                stx_invs: BTreeSet::new(),
                known: RollingFilter::new(KNOWN_INVENTORY_CAPACITY, 0.000001),
                known_service: RollingFilter::new(KNOWN_INVENTORY_CAPACITY, 0.000001),
            }),
            addrs: Mutex::new(AddrQueues {
                to_send: Vec::new(),
                known: RollingFilter::new(KNOWN_ADDRESSES_CAPACITY, 0.001),
            }),
            ask_for: Mutex::new(AskForQueue {
                schedule: BTreeMap::new(),
                pending: HashSet::new(),
                len: 0,
            }),
            getdata_queue: Mutex::new(VecDeque::new()),
            hash_continue: Mutex::new(None),
            filter: Mutex::new(None),
        }
    }

    // --- handshake ---

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Relaxed);
    }

    pub fn send_version(&self) -> u32 {
        self.send_version.load(Ordering::Relaxed)
    }

    pub fn set_send_version(&self, version: u32) {
        self.send_version.store(version, Ordering::Relaxed);
    }

    pub fn services(&self) -> ServiceFlags {
        ServiceFlags(self.services.load(Ordering::Relaxed))
    }

    pub fn set_services(&self, services: ServiceFlags) {
        self.services.store(services.0, Ordering::Relaxed);
    }

    /// A client-only peer does not serve the full chain.
    pub fn is_client(&self) -> bool {
        !self.services().includes(vireo_types::NODE_NETWORK)
    }

    pub fn subversion(&self) -> String {
        self.subversion.lock().clone()
    }

    pub fn set_subversion(&self, subversion: String) {
        *self.subversion.lock() = subversion;
    }

    pub fn start_height(&self) -> i32 {
        self.start_height.load(Ordering::Relaxed)
    }

    pub fn set_start_height(&self, height: i32) {
        self.start_height.store(height, Ordering::Relaxed);
    }

    pub fn successfully_connected(&self) -> bool {
        self.successfully_connected.load(Ordering::Relaxed)
    }

    pub fn set_successfully_connected(&self) {
        self.successfully_connected.store(true, Ordering::Relaxed);
    }

    pub fn relay_txes(&self) -> bool {
        self.relay_txes.load(Ordering::Relaxed)
    }

    pub fn set_relay_txes(&self, relay: bool) {
        self.relay_txes.store(relay, Ordering::Relaxed);
    }

    pub fn sent_addr(&self) -> bool {
        self.sent_addr.load(Ordering::Relaxed)
    }

    pub fn mark_sent_addr(&self) {
        self.sent_addr.store(true, Ordering::Relaxed);
    }

    /// True between our `getaddr` and the first `addr` response.
    pub fn awaiting_addr(&self) -> bool {
        self.awaiting_addr.load(Ordering::Relaxed)
    }

    pub fn set_awaiting_addr(&self, awaiting: bool) {
        self.awaiting_addr.store(awaiting, Ordering::Relaxed);
    }

    pub fn set_time_offset(&self, offset: i64) {
        self.time_offset.store(offset, Ordering::Relaxed);
    }

    pub fn time_offset(&self) -> i64 {
        self.time_offset.load(Ordering::Relaxed)
    }

    pub fn last_tx_time(&self) -> i64 {
        self.last_tx_time.load(Ordering::Relaxed)
    }

    pub fn set_last_tx_time(&self, time: i64) {
        self.last_tx_time.store(time, Ordering::Relaxed);
    }

    // --- disconnect ---

    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::Relaxed);
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::Relaxed)
    }

    // --- ping ---

    pub fn ping_nonce_sent(&self) -> u64 {
        self.ping_nonce_sent.load(Ordering::Relaxed)
    }

    pub fn ping_start_us(&self) -> i64 {
        self.ping_start_us.load(Ordering::Relaxed)
    }

    pub fn queue_ping(&self) {
        self.ping_queued.store(true, Ordering::Relaxed);
    }

    /// Whether the automatic ping should fire.
    pub fn ping_due(&self, now_us: i64, interval_us: i64) -> bool {
        self.ping_queued.load(Ordering::Relaxed)
            || (self.ping_nonce_sent() == 0 && self.ping_start_us() + interval_us < now_us)
    }

    pub fn start_ping(&self, nonce: u64, now_us: i64) {
        self.ping_queued.store(false, Ordering::Relaxed);
        self.ping_start_us.store(now_us, Ordering::Relaxed);
        self.ping_nonce_sent.store(nonce, Ordering::Relaxed);
    }

    /// Record a matching pong; updates the RTT and the floor.
    pub fn finish_ping(&self, now_us: i64) {
        let rtt = now_us - self.ping_start_us();
        if rtt > 0 {
            self.ping_time_us.store(rtt, Ordering::Relaxed);
            self.min_ping_us.fetch_min(rtt, Ordering::Relaxed);
        }
        self.ping_nonce_sent.store(0, Ordering::Relaxed);
    }

    /// Clear the outstanding ping without recording a time.
    pub fn abort_ping(&self) {
        self.ping_nonce_sent.store(0, Ordering::Relaxed);
    }

    pub fn ping_time_us(&self) -> i64 {
        self.ping_time_us.load(Ordering::Relaxed)
    }

    pub fn min_ping_us(&self) -> i64 {
        self.min_ping_us.load(Ordering::Relaxed)
    }

    // --- tick timers ---

    pub fn next_addr_send_us(&self) -> i64 {
        self.next_addr_send_us.load(Ordering::Relaxed)
    }

    pub fn set_next_addr_send_us(&self, when: i64) {
        self.next_addr_send_us.store(when, Ordering::Relaxed);
    }

    pub fn next_local_addr_send_us(&self) -> i64 {
        self.next_local_addr_send_us.load(Ordering::Relaxed)
    }

    pub fn set_next_local_addr_send_us(&self, when: i64) {
        self.next_local_addr_send_us.store(when, Ordering::Relaxed);
    }

    pub fn next_inv_send_us(&self) -> i64 {
        self.next_inv_send_us.load(Ordering::Relaxed)
    }

    pub fn set_next_inv_send_us(&self, when: i64) {
        self.next_inv_send_us.store(when, Ordering::Relaxed);
    }

    // --- inventory queues ---

    /// Queue an inventory announcement, deduplicated against what the peer
    /// already knows.
    pub fn push_inventory(&self, inv: Inv) {
        let mut queues = self.inventory.lock();
        match inv.kind {
            InvKind::Tx => {
                if !queues.known.contains(inv.hash.as_ref()) {
                    queues.tx_invs.insert(inv.hash);
                }
            }
            InvKind::ServiceTx => {
                if !queues.known_service.contains(inv.hash.as_ref()) {
                    queues.stx_invs.insert(inv.hash);
                }
            }
            InvKind::Block | InvKind::FilteredBlock => {
                queues.block_invs.push(inv.hash);
            }
        }
    }

    /// Queue a block hash for the header/inv announcement path.
    pub fn push_block_hash(&self, hash: Hash256) {
        self.inventory.lock().blocks_to_announce.push(hash);
    }

    /// Record that the peer knows this inventory.
    pub fn add_known_inventory(&self, inv: Inv) {
        let mut queues = self.inventory.lock();
        match inv.kind {
            InvKind::ServiceTx => queues.known_service.insert(inv.hash.as_ref()),
            _ => queues.known.insert(inv.hash.as_ref()),
        }
    }

    pub fn knows_inventory(&self, inv: &Inv) -> bool {
        let queues = self.inventory.lock();
        match inv.kind {
            InvKind::ServiceTx => queues.known_service.contains(inv.hash.as_ref()),
            _ => queues.known.contains(inv.hash.as_ref()),
        }
    }

    // --- addresses ---

    /// Queue an address for relay, deduplicated against the known filter.
    /// A full queue evicts a uniformly random entry first.
    pub fn push_address(&self, addr: NetAddress) {
        let mut queues = self.addrs.lock();
        if queues.known.contains(&addr.key()) {
            return;
        }
        if queues.to_send.len() >= MAX_ADDR_SZ {
            let slot = rand::thread_rng().gen_range(0..queues.to_send.len());
            queues.to_send[slot] = addr;
        } else {
            queues.to_send.push(addr);
        }
    }

    pub fn add_known_address(&self, addr: &NetAddress) {
        self.addrs.lock().known.insert(&addr.key());
    }

    // --- ask-for schedule ---

    /// Schedule a request for an inventory at `request_time_us`. Duplicate
    /// hashes and overflow beyond the cap are dropped.
    pub fn ask_for(&self, inv: Inv, request_time_us: i64) {
        let mut queue = self.ask_for.lock();
        if queue.len >= MAX_ASK_FOR || queue.pending.contains(&inv.hash) {
            return;
        }
        trace!(peer = %self.id, %inv, at = request_time_us, "askfor");
        queue.pending.insert(inv.hash);
        queue.schedule.entry(request_time_us).or_default().push(inv);
        queue.len += 1;
    }

    /// Pop the next request whose time has arrived.
    pub fn pop_due_ask(&self, now_us: i64) -> Option<Inv> {
        let mut queue = self.ask_for.lock();
        let (&when, _) = queue.schedule.iter().next()?;
        if when > now_us {
            return None;
        }
        let slot = queue.schedule.get_mut(&when).expect("slot exists");
        let inv = slot.remove(0);
        if slot.is_empty() {
            queue.schedule.remove(&when);
        }
        queue.pending.remove(&inv.hash);
        queue.len -= 1;
        Some(inv)
    }

    /// Forget a pending request (the object arrived, or we gave up).
    pub fn cancel_ask(&self, hash: &Hash256) {
        let mut queue = self.ask_for.lock();
        if queue.pending.remove(hash) {
            for slot in queue.schedule.values_mut() {
                if let Some(pos) = slot.iter().position(|inv| inv.hash == *hash) {
                    slot.remove(pos);
                    queue.len -= 1;
                    break;
                }
            }
            queue.schedule.retain(|_, slot| !slot.is_empty());
        }
    }

    /// Whether a request for this hash is scheduled.
    pub fn has_pending_ask(&self, hash: &Hash256) -> bool {
        self.ask_for.lock().pending.contains(hash)
    }

    /// The retry time for a repeated ask: the stored previous schedule plus
    /// the cool-down, or `now` for a fresh one.
    pub fn ask_retry_time(last_scheduled_us: Option<i64>, now_us: i64) -> i64 {
        match last_scheduled_us {
            Some(last) => now_us.max(last + ASK_FOR_RETRY_US),
            None => now_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vireo_types::NODE_NETWORK;

    fn peer() -> Peer {
        Peer::new(
            PeerId(1),
            NetAddress::new("8.8.8.8:5744".parse().unwrap(), NODE_NETWORK, 0),
            "8.8.8.8:5744".into(),
            PeerFlags::default(),
        )
    }

    #[test]
    fn push_inventory_dedupes_known_txs() {
        let peer = peer();
        let hash = Hash256::from_u64(7);

        peer.add_known_inventory(Inv::tx(hash));
        peer.push_inventory(Inv::tx(hash));
        assert!(peer.inventory.lock().tx_invs.is_empty());

        peer.push_inventory(Inv::tx(Hash256::from_u64(8)));
        assert_eq!(peer.inventory.lock().tx_invs.len(), 1);
    }

    #[test]
    fn block_invs_bypass_the_filter() {
        let peer = peer();
        let hash = Hash256::from_u64(7);
        peer.add_known_inventory(Inv::block(hash));
        peer.push_inventory(Inv::block(hash));
        assert_eq!(peer.inventory.lock().block_invs.len(), 1);
    }

    #[test]
    fn service_inventory_uses_its_own_filter() {
        let peer = peer();
        let hash = Hash256::from_u64(7);
        peer.add_known_inventory(Inv::tx(hash));
        peer.push_inventory(Inv::service_tx(hash));
        assert_eq!(peer.inventory.lock().stx_invs.len(), 1);
    }

    #[test]
    fn ask_for_schedule_orders_and_dedupes() {
        let peer = peer();
        let a = Inv::tx(Hash256::from_u64(1));
        let b = Inv::tx(Hash256::from_u64(2));

        peer.ask_for(b, 2_000);
        peer.ask_for(a, 1_000);
        peer.ask_for(a, 500); // duplicate hash, dropped

        assert!(peer.pop_due_ask(999).is_none());
        assert_eq!(peer.pop_due_ask(2_500), Some(a));
        assert_eq!(peer.pop_due_ask(2_500), Some(b));
        assert!(peer.pop_due_ask(2_500).is_none());
    }

    #[test]
    fn cancel_ask_removes_pending() {
        let peer = peer();
        let inv = Inv::tx(Hash256::from_u64(1));
        peer.ask_for(inv, 0);
        assert!(peer.has_pending_ask(&inv.hash));
        peer.cancel_ask(&inv.hash);
        assert!(!peer.has_pending_ask(&inv.hash));
        assert!(peer.pop_due_ask(i64::MAX).is_none());
    }

    #[test]
    fn ping_lifecycle() {
        let peer = peer();
        assert!(peer.ping_due(200_000_000, 120_000_000));

        peer.start_ping(42, 200_000_000);
        assert!(!peer.ping_due(210_000_000, 120_000_000));

        peer.finish_ping(200_050_000);
        assert_eq!(peer.ping_time_us(), 50_000);
        assert_eq!(peer.min_ping_us(), 50_000);
        assert_eq!(peer.ping_nonce_sent(), 0);
    }

    #[test]
    fn address_queue_dedupes_known() {
        let peer = peer();
        let addr = NetAddress::new("9.9.9.9:5744".parse().unwrap(), NODE_NETWORK, 0);
        peer.add_known_address(&addr);
        peer.push_address(addr);
        assert!(peer.addrs.lock().to_send.is_empty());
    }
}
