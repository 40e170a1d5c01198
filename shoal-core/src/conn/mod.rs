//! Authenticated, rate-limited peer connections.
//!
//! A raw TCP stream becomes a [`Conn`] only after a successful handshake
//! performed by the [`Handshaker`]. Every conn of a node shares one
//! [`BandwidthLimiter`] and reports inbound traffic as [`ConnEvent`]s.

pub mod bandwidth;
pub mod connection;
pub mod handshake;
pub mod handshaker;
pub mod message;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use bandwidth::{BandwidthLimiter, Direction, TokenBucket};
pub use connection::{Conn, ConnOrigin, ConnStatus};
pub use handshake::HandshakeMessage;
pub use handshaker::{Handshaker, PendingConn};
pub use message::{Message, MessageCodec};

use crate::config::BandwidthConfig;
use crate::torrent::{BitfieldError, IdError, InfoHash, PeerId};

/// Errors raised by handshakes and connection I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Timed out reading handshake")]
    ReadTimeout,

    #[error("Timed out sending handshake")]
    SendTimeout,

    #[error("Connection I/O timed out")]
    IoTimeout,

    #[error("Failed to dial {addr}: {reason}")]
    DialFailure {
        addr: std::net::SocketAddr,
        reason: String,
    },

    #[error("Unexpected peer identity: expected {expected}, got {actual}")]
    UnexpectedPeerIdentity { expected: PeerId, actual: PeerId },

    #[error("Info hash mismatch: expected {expected}, got {actual}")]
    InfoHashMismatch {
        expected: InfoHash,
        actual: InfoHash,
    },

    #[error("Connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BitfieldError> for ConnError {
    fn from(error: BitfieldError) -> Self {
        ConnError::MalformedMessage {
            reason: error.to_string(),
        }
    }
}

impl From<IdError> for ConnError {
    fn from(error: IdError) -> Self {
        ConnError::MalformedMessage {
            reason: error.to_string(),
        }
    }
}

/// Classification of connection failures for blacklisting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Peer sent bytes that do not decode
    Malformed,
    /// Handshake or steady-state I/O exceeded its bound
    Timeout,
    /// Peer could not be reached
    Dial,
    /// Peer claimed the wrong identity or torrent
    IdentityViolation,
    /// Local close, not the peer's fault
    Closed,
    /// Socket-level failure
    Io,
}

impl ErrorCategory {
    /// Determine error category from ConnError
    pub fn from_conn_error(error: &ConnError) -> Self {
        match error {
            ConnError::MalformedMessage { .. } => Self::Malformed,
            ConnError::ReadTimeout | ConnError::SendTimeout | ConnError::IoTimeout => {
                Self::Timeout
            }
            ConnError::DialFailure { .. } => Self::Dial,
            ConnError::UnexpectedPeerIdentity { .. } | ConnError::InfoHashMismatch { .. } => {
                Self::IdentityViolation
            }
            ConnError::Closed => Self::Closed,
            ConnError::Io(_) => Self::Io,
        }
    }

    /// Returns true if a failure of this category blacklists the
    /// (peer, torrent) pair for the cooldown period.
    pub fn blacklists(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Identifies one live connection.
///
/// `id` is unique per node, so a reconnect to the same peer for the same
/// torrent gets a different key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub id: u64,
    pub peer_id: PeerId,
    pub info_hash: InfoHash,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}({}, {})", self.id, self.peer_id, self.info_hash)
    }
}

/// Events a conn's receive task reports to its owner.
#[derive(Debug)]
pub enum ConnEvent {
    /// A decoded inbound message.
    Message { key: ConnKey, message: Message },
    /// The conn stopped. Sent exactly once per conn; `reason` is `None` for
    /// a local close or a clean EOF.
    Closed {
        key: ConnKey,
        reason: Option<ConnError>,
    },
}

/// Process-wide state shared by every conn of a node.
///
/// Built once at startup and passed down explicitly; dropping the last clone
/// tears it down.
#[derive(Debug, Clone)]
pub struct NodeContext {
    peer_id: PeerId,
    bandwidth: Arc<BandwidthLimiter>,
    next_conn_id: Arc<AtomicU64>,
}

impl NodeContext {
    pub fn new(peer_id: PeerId, bandwidth: &BandwidthConfig) -> Self {
        Self {
            peer_id,
            bandwidth: Arc::new(BandwidthLimiter::new(bandwidth)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Local peer identity.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Shared bandwidth limiter.
    pub fn bandwidth(&self) -> &Arc<BandwidthLimiter> {
        &self.bandwidth
    }

    pub(crate) fn next_conn_key(&self, peer_id: PeerId, info_hash: InfoHash) -> ConnKey {
        ConnKey {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            peer_id,
            info_hash,
        }
    }
}
