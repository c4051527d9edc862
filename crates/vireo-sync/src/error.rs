//! Sync-layer error types.
//!
//! A returned error means the message was rejected and why; the connection
//! itself stays up unless the handler also set the disconnect flag or the
//! misbehavior score crossed the ban threshold.

use thiserror::Error;
use vireo_types::{Hash256, PeerId};

/// Errors raised while processing a peer message.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The peer is not registered with the core.
    #[error("peer {0} not registered")]
    UnknownPeer(PeerId),

    /// A payload exceeded its entry-count limit.
    #[error("oversized {command} payload: {size} entries, max {max}")]
    OversizedPayload {
        command: &'static str,
        size: usize,
        max: usize,
    },

    /// A second version message on the same connection.
    #[error("duplicate version message")]
    DuplicateVersion,

    /// A non-version message arrived before the handshake.
    #[error("message received before version handshake")]
    MissingVersion,

    /// Headers in a `headers` payload do not chain onto each other.
    #[error("non-continuous headers sequence")]
    DisconnectedHeaders,

    /// A header failed validation.
    #[error("invalid header received: {0}")]
    InvalidHeader(String),

    /// A service transaction without a payment reference.
    #[error("service transaction {0} has no payment reference")]
    ServiceTxWithoutPayment(Hash256),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
