//! # vireo-net
//!
//! Peer-facing plumbing for the Vireo node.
//!
//! This crate provides:
//! - The typed P2P `Message` enum and reject codes
//! - Rolling bloom filters and the loadable per-peer transaction filter
//! - The transaction relay map and deterministic address-relay sampling
//! - The per-peer queue object with its local locks
//! - The `Outbound` sink the protocol core emits through

mod bloom;
mod error;
mod message;
mod peer;
mod relay;

pub use bloom::{PeerFilter, RollingFilter};
pub use error::{NetError, NetResult};
pub use message::{
    BanReason, FilterLoad, FilteredBlock, Message, Outbound, Reject, RejectCode, VersionMessage,
};
pub use peer::{AddrQueues, InventoryQueues, Peer, PeerFlags};
pub use relay::{relay_targets, RelayMap};

/// Our protocol version.
pub const PROTOCOL_VERSION: u32 = 70003;

/// Disconnect peers older than this.
pub const MIN_PROTO_VERSION: u32 = 70001;

/// Peers at or above this version understand `sendheaders`.
pub const SENDHEADERS_VERSION: u32 = 70002;

/// Peers at or above this version must not send filter messages to
/// non-bloom nodes.
pub const NO_BLOOM_VERSION: u32 = 70002;

/// Maximum entries in an `inv`/`getdata` payload.
pub const MAX_INV_SZ: usize = 50_000;

/// Maximum entries in an `addr` payload.
pub const MAX_ADDR_SZ: usize = 1_000;

/// Maximum headers in a single `headers` payload.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Maximum length of the subversion string we accept.
pub const MAX_SUBVERSION_LENGTH: usize = 256;

/// Reject reasons are truncated to this many bytes on the wire.
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;

/// Largest element a peer may add to its bloom filter.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Largest serialized bloom filter we accept, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Most hash functions a loaded bloom filter may use.
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;

/// Capacity of the per-peer known-inventory rolling filter.
pub const KNOWN_INVENTORY_CAPACITY: u32 = 50_000;

/// Capacity of the per-peer known-addresses rolling filter.
pub const KNOWN_ADDRESSES_CAPACITY: u32 = 5_000;

/// Relay map entries expire after this many microseconds (15 minutes).
pub const RELAY_EXPIRY_US: i64 = 15 * 60 * 1_000_000;

/// Cool-down between repeated requests for the same inventory (2 minutes).
pub const ASK_FOR_RETRY_US: i64 = 2 * 60 * 1_000_000;

/// Upper bound on entries in the per-peer ask-for schedule.
pub const MAX_ASK_FOR: usize = 50_000;
