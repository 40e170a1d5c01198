//! Shoal Core - peer connection subsystem for P2P blob distribution
//!
//! Turns raw TCP streams between hosts into authenticated, rate-limited,
//! message-oriented channels bound to one torrent, and tracks the health of
//! every channel so misbehaving or unreachable peers are skipped for a while.

pub mod announce;
pub mod config;
pub mod conn;
pub mod connstate;
pub mod logging;
pub mod scheduler;
pub mod storage;
pub mod torrent;

// Re-export main types for convenient access
pub use config::ShoalConfig;
pub use conn::{Conn, ConnError, Handshaker, NodeContext};
pub use connstate::{BlacklistedConn, ConnState, ConnStateError};
pub use scheduler::{ReloadableScheduler, Scheduler, SchedulerError, SchedulerHandle};
pub use storage::StorageError;
pub use torrent::{Bitfield, Digest, InfoHash, PeerId, TorrentInfo};

/// Core errors that can bubble up from any Shoal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Connection error: {0}")]
    Conn(#[from] ConnError),

    #[error("Connection state error: {0}")]
    ConnState(#[from] ConnStateError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ShoalError::Conn(e) => match e {
                ConnError::DialFailure { addr, .. } => format!("Could not reach peer at {addr}"),
                ConnError::UnexpectedPeerIdentity { .. } => {
                    "Peer answered with a different identity".to_string()
                }
                _ => "Peer connection error occurred".to_string(),
            },
            ShoalError::ConnState(ConnStateError::Blacklisted { peer_id, .. }) => {
                format!("Peer {peer_id} is temporarily blacklisted")
            }
            ShoalError::ConnState(_) => "Connection limit reached".to_string(),
            ShoalError::Scheduler(e) => match e {
                SchedulerError::TorrentNotFound { digest } => {
                    format!("Blob {digest} not found")
                }
                SchedulerError::Shutdown => "Scheduler is not running".to_string(),
                _ => "Scheduler error occurred".to_string(),
            },
            ShoalError::Storage(_) => "Storage error occurred".to_string(),
            ShoalError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            ShoalError::Io(_) => "Network or file system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Configuration { .. }
                | ShoalError::Scheduler(SchedulerError::TorrentNotFound { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;
