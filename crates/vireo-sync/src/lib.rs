//! # vireo-sync
//!
//! The peer message-processing core of the Vireo node.
//!
//! This crate provides:
//! - The per-peer sync-state registry with misbehavior scoring
//! - The recent-rejects filter, relay map and orphan pool
//! - The block download scheduler with stall detection
//! - The inbound message handler and getdata serving
//! - The periodic outbound tick
//!
//! The core sits between a transport that frames bytes into typed
//! [`vireo_net::Message`]s and the validation/consensus collaborators behind
//! the traits in [`chain`]. It owns no persistence.

mod chain;
mod config;
mod download;
mod error;
mod handler;
mod orphans;
mod peers;
mod processor;
mod serve;
mod state;
mod tick;

pub use chain::{
    AddrBook, BlockEntry, BlockId, BlockStore, BlockVerdict, ChainIndex, CoinView, MempoolView,
    ServiceTxPool, TxVerdict, ValidationFailure, Validator, WalletBroadcast,
};
pub use config::{ConsensusParams, CoreConfig};
pub use error::{SyncError, SyncResult};
pub use orphans::{OrphanEntry, OrphanPool};
pub use peers::{BlockReject, NodeStateStats, PeerSyncState, QueuedBlock};
pub use processor::{Collaborators, ProtocolCore};
pub use state::CoreState;

/// Most blocks a single peer may have in flight.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;

/// Window of contiguous blocks ahead of the last common block a peer may be
/// asked for.
pub const BLOCK_DOWNLOAD_WINDOW: u32 = 1024;

/// A peer blocking the download window this long is disconnected, micros.
pub const BLOCK_STALLING_TIMEOUT_US: i64 = 2_000_000;

/// Per-block download timeout factors, in micros per target-spacing second.
pub const BLOCK_DOWNLOAD_TIMEOUT_BASE: i64 = 1_000_000;
pub const BLOCK_DOWNLOAD_TIMEOUT_PER_PEER: i64 = 500_000;

/// Blocks announced per tip update; larger reorgs rely on the peer's own
/// synchronization.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;

/// Average trickle delay for transaction inventory, micros.
pub const INVENTORY_BROADCAST_INTERVAL_US: i64 = 5_000_000;

/// Most transaction invs relayed per trickle.
pub const INVENTORY_BROADCAST_MAX: usize = 35;

/// Average delay between addr broadcasts to a peer, micros.
pub const AVG_ADDRESS_BROADCAST_INTERVAL_US: i64 = 30_000_000;

/// Average delay between self-advertisements, micros (one day).
pub const AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL_US: i64 = 24 * 60 * 60 * 1_000_000;

/// Automatic ping cadence, micros.
pub const PING_INTERVAL_US: i64 = 120 * 1_000_000;

/// Page size of a getblocks response.
pub const GETBLOCKS_LIMIT: usize = 500;

/// The tip must be within this many target spacings of the adjusted time
/// before announced blocks are fetched directly.
pub const DIRECT_FETCH_SPACING_MULTIPLIER: i64 = 20;

/// Default misbehavior threshold for banning.
pub const DEFAULT_BANSCORE: u32 = 100;

/// Default orphan pool cap.
pub const DEFAULT_MAX_ORPHAN_TRANSACTIONS: usize = 100;

/// Largest serialized orphan we park, bytes.
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;

/// Recent-rejects filter sizing: two minutes of flood at 1000 tx/s, with a
/// one-in-a-million false-positive rate.
pub const RECENT_REJECTS_CAPACITY: u32 = 120_000;
pub const RECENT_REJECTS_FP_RATE: f64 = 0.000_001;

/// Pending service transactions are dropped after this long, micros.
pub const PENDING_STX_EXPIRY_US: i64 = 60 * 60 * 1_000_000;
