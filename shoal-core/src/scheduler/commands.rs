//! Command definitions for the scheduler actor.

use serde::Serialize;
use tokio::sync::oneshot;

use super::SchedulerError;
use crate::announce::PeerInfo;
use crate::config::ShoalConfig;
use crate::conn::{Conn, ConnError, ConnOrigin, PendingConn};
use crate::connstate::BlacklistedConn;
use crate::torrent::{Digest, InfoHash, PeerId, TorrentInfo};

/// Commands sent by [`super::SchedulerHandle`] to the scheduler actor.
///
/// Each command carries a oneshot responder for the result.
pub enum SchedulerCommand {
    /// Start connecting to peers for a blob.
    Download {
        name: String,
        digest: Digest,
        responder: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// No-op round trip proving the actor loop is alive.
    Probe { responder: oneshot::Sender<()> },
    /// Hot-swap timeouts, bandwidth and blacklist settings.
    Reload {
        config: ShoalConfig,
        responder: oneshot::Sender<()>,
    },
    /// Close a torrent's conns and forget it.
    RemoveTorrent {
        digest: Digest,
        responder: oneshot::Sender<Result<(), SchedulerError>>,
    },
    BlacklistSnapshot {
        responder: oneshot::Sender<Vec<BlacklistedConn>>,
    },
    TorrentStats {
        digest: Digest,
        responder: oneshot::Sender<Result<TorrentStats, SchedulerError>>,
    },
    /// Close every conn and stop the actor.
    Stop { responder: oneshot::Sender<()> },
}

/// Results of work the actor delegated to spawned tasks.
pub(crate) enum InternalCommand {
    /// Torrent metadata and peers are ready for a download.
    DownloadReady {
        info: TorrentInfo,
        peers: Vec<PeerInfo>,
        responder: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// The listener read a handshake. `info` is set once an unknown torrent
    /// has been looked up in the archive.
    IncomingConn {
        pending: PendingConn,
        info: Option<TorrentInfo>,
    },
    /// An `initialize` or `establish` finished.
    HandshakeDone {
        peer_id: PeerId,
        info_hash: InfoHash,
        origin: ConnOrigin,
        result: Result<Conn, ConnError>,
    },
}

/// Per-torrent view of the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentStats {
    pub name: String,
    pub info_hash: InfoHash,
    pub digest: String,
    /// Peers with an active conn, sorted
    pub peers: Vec<PeerId>,
    pub piece_count: u32,
    pub complete: bool,
}
