//! Typed P2P protocol messages.
//!
//! The transport owns byte framing (envelope, checksum, command strings);
//! what crosses the boundary into the protocol core is one of these variants.

use crate::bloom::PeerFilter;
use crate::MAX_REJECT_MESSAGE_LENGTH;
use vireo_types::{
    Block, BlockHeader, Hash256, Inv, Locator, NetAddress, PeerId, ServiceFlags,
    ServiceTransaction, Transaction,
};

/// Payload of a `version` message.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: ServiceFlags,
    /// Sender's clock, unix seconds.
    pub time: i64,
    /// The address the sender believes we have.
    pub addr_recv: NetAddress,
    /// The sender's own address.
    pub addr_from: NetAddress,
    /// Connection nonce, for self-connect detection.
    pub nonce: u64,
    pub subversion: String,
    pub start_height: i32,
    /// Whether the sender wants transaction relay before a filter is loaded.
    pub relay: bool,
}

/// 8-bit reject codes sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    Nonstandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
}

/// Payload of a `reject` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    /// Command being rejected.
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    /// Hash of the offending object, when there is one.
    pub hash: Option<Hash256>,
}

impl Reject {
    /// Build a reject, truncating the reason to the wire limit.
    pub fn new(message: &str, code: RejectCode, reason: &str, hash: Option<Hash256>) -> Self {
        let mut reason = reason.to_owned();
        reason.truncate(MAX_REJECT_MESSAGE_LENGTH);
        Self {
            message: message.to_owned(),
            code,
            reason,
            hash,
        }
    }
}

/// A merkle-filtered block: the header, the total transaction count, and the
/// transactions matched by the requesting peer's bloom filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredBlock {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub matched: Vec<Hash256>,
}

impl FilteredBlock {
    /// Build from a block and the peer's loaded filter. Returns the filtered
    /// block and the matched transactions so the caller can push them right
    /// after (a peer has no way to request an individual missed tx).
    pub fn from_block(block: &Block, filter: &PeerFilter) -> (Self, Vec<Transaction>) {
        let mut matched = Vec::new();
        let mut matched_txs = Vec::new();
        for tx in &block.transactions {
            if filter.matches_transaction(tx) {
                matched.push(tx.txid);
                matched_txs.push(tx.clone());
            }
        }
        (
            Self {
                header: block.header,
                total_transactions: block.transactions.len() as u32,
                matched,
            },
            matched_txs,
        )
    }
}

/// Parameters of a `filterload` message.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterLoad {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
}

/// A typed P2P message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Addr(Vec<NetAddress>),
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    NotFound(Vec<Inv>),
    GetBlocks { locator: Locator, stop: Hash256 },
    GetHeaders { locator: Locator, stop: Hash256 },
    Headers(Vec<BlockHeader>),
    Tx(Transaction),
    Block(Block),
    MerkleBlock(FilteredBlock),
    ServiceTx(ServiceTransaction),
    Mempool,
    GetAddr,
    Ping(u64),
    Pong(u64),
    Reject(Reject),
    SendHeaders,
    FilterLoad(FilterLoad),
    FilterAdd(Vec<u8>),
    FilterClear,
    /// Command we do not understand; ignored for extensibility.
    Unknown(String),
}

impl Message {
    /// Wire command name, for logging and reject payloads.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetBlocks { .. } => "getblocks",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::MerkleBlock(_) => "merkleblock",
            Message::ServiceTx(_) => "stx",
            Message::Mempool => "mempool",
            Message::GetAddr => "getaddr",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Reject(_) => "reject",
            Message::SendHeaders => "sendheaders",
            Message::FilterLoad(_) => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::Unknown(cmd) => cmd,
        }
    }
}

/// Reason recorded with a ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    NodeMisbehaving,
    ManuallyAdded,
}

/// Sink through which the protocol core reaches the transport.
///
/// Implementations queue the message for delivery; per-peer ordering must be
/// preserved (the core relies on it for getdata responses and pagination).
pub trait Outbound: Send + Sync {
    /// Queue a message for a peer.
    fn send(&self, peer: PeerId, message: Message);

    /// Record a ban for an address.
    fn ban(&self, addr: NetAddress, reason: BanReason);

    /// Whether the outbound bandwidth budget for serving historical blocks
    /// is exhausted.
    fn outbound_target_reached(&self, historical: bool) -> bool {
        let _ = historical;
        false
    }

    /// Whether the peer's send buffer is saturated; serving pauses when so.
    fn send_buffer_full(&self, peer: PeerId) -> bool {
        let _ = peer;
        false
    }
}
