//! Per-peer sync state kept under the chain lock.

use crate::chain::BlockId;
use vireo_net::RejectCode;
use vireo_types::{Hash256, NetAddress};

/// A block we asked this peer to deliver.
#[derive(Debug, Clone)]
pub struct QueuedBlock {
    pub hash: Hash256,
    /// Index entry, when the header was already validated at request time.
    pub index: Option<BlockId>,
}

impl QueuedBlock {
    pub fn validated_header(&self) -> bool {
        self.index.is_some()
    }
}

/// A block reject queued for delivery on the next tick.
#[derive(Debug, Clone)]
pub struct BlockReject {
    pub code: RejectCode,
    pub reason: String,
    pub hash: Hash256,
}

/// The sync-view record for one peer. Everything here is guarded by the
/// core's chain lock; the transport-facing half lives on [`vireo_net::Peer`].
pub struct PeerSyncState {
    pub address: NetAddress,
    pub name: String,

    /// Accumulated misbehavior score.
    pub misbehavior: u32,
    /// The score crossed the ban threshold; the next tick actions it.
    pub should_ban: bool,
    /// Handshake completed (verack seen on an outbound connection).
    pub currently_connected: bool,

    /// This peer is our current header-sync peer.
    pub sync_started: bool,
    pub rejects: Vec<BlockReject>,

    /// Best block we know this peer knows.
    pub best_known_block: Option<BlockId>,
    /// Last announced block we could not resolve to an index entry yet.
    pub last_unknown_block: Option<Hash256>,
    /// Deepest block on the peer's chain that we share.
    pub last_common_block: Option<BlockId>,
    /// Best header we have announced to this peer.
    pub best_header_sent: Option<BlockId>,
    /// Peer asked for headers announcements instead of invs.
    pub prefer_headers: bool,
    /// Counted toward the preferred-download total.
    pub preferred_download: bool,

    pub blocks_in_flight: Vec<QueuedBlock>,
    /// In-flight entries whose header was validated.
    pub in_flight_validated: usize,
    /// When the head of the in-flight queue started downloading, micros.
    pub downloading_since_us: i64,
    /// When this peer first blocked the download window; 0 when it is not.
    pub stalling_since_us: i64,
}

impl PeerSyncState {
    pub fn new(address: NetAddress, name: String) -> Self {
        Self {
            address,
            name,
            misbehavior: 0,
            should_ban: false,
            currently_connected: false,
            sync_started: false,
            rejects: Vec::new(),
            best_known_block: None,
            last_unknown_block: None,
            last_common_block: None,
            best_header_sent: None,
            prefer_headers: false,
            preferred_download: false,
            blocks_in_flight: Vec::new(),
            in_flight_validated: 0,
            downloading_since_us: 0,
            stalling_since_us: 0,
        }
    }
}

/// Snapshot of a peer's sync state for the RPC collaborator.
#[derive(Debug, Clone, Default)]
pub struct NodeStateStats {
    pub misbehavior: u32,
    /// Height of the peer's best known block, -1 if unknown.
    pub sync_height: i32,
    /// Height of the last common block, -1 if unknown.
    pub common_height: i32,
    pub heights_in_flight: Vec<u32>,
}
