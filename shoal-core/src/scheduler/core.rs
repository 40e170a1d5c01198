//! Scheduler state owned by the actor task.
//!
//! Everything here runs on the actor; slow work (archive lookups, announces,
//! handshakes) is spawned and reports back through the internal channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SchedulerError;
use super::commands::{InternalCommand, TorrentStats};
use crate::announce::{PeerInfo, PeerSource};
use crate::config::ShoalConfig;
use crate::conn::{
    Conn, ConnError, ConnEvent, ConnOrigin, ErrorCategory, Handshaker, NodeContext, PendingConn,
};
use crate::connstate::{BlacklistedConn, ConnState};
use crate::storage::TorrentArchive;
use crate::torrent::{Digest, InfoHash, PeerId, TorrentInfo};

pub(crate) struct SchedulerCore {
    handshaker: Handshaker,
    connstate: ConnState,
    archive: Arc<dyn TorrentArchive>,
    peer_source: Arc<dyn PeerSource>,
    internal: mpsc::UnboundedSender<InternalCommand>,
    namespace: String,
    torrents: HashMap<InfoHash, TorrentInfo>,
    digests: HashMap<Digest, InfoHash>,
    listener: Option<JoinHandle<()>>,
    stopped: bool,
}

/// Collaborators and shared state the core is built from.
pub(crate) struct CoreParts {
    pub config: ShoalConfig,
    pub handshaker: Handshaker,
    pub connstate: ConnState,
    pub archive: Arc<dyn TorrentArchive>,
    pub peer_source: Arc<dyn PeerSource>,
    pub internal: mpsc::UnboundedSender<InternalCommand>,
    pub listener: JoinHandle<()>,
}

impl SchedulerCore {
    pub fn new(parts: CoreParts) -> Self {
        Self {
            handshaker: parts.handshaker,
            connstate: parts.connstate,
            archive: parts.archive,
            peer_source: parts.peer_source,
            internal: parts.internal,
            namespace: parts.config.scheduler.namespace,
            torrents: HashMap::new(),
            digests: HashMap::new(),
            listener: Some(parts.listener),
            stopped: false,
        }
    }

    fn peer_id(&self) -> PeerId {
        self.handshaker.peer_id()
    }

    fn context(&self) -> &NodeContext {
        self.handshaker.context()
    }

    /// Resolves the torrent and its peers off the actor, then hands back a
    /// `DownloadReady`.
    pub fn download(
        &self,
        name: String,
        digest: Digest,
        responder: oneshot::Sender<Result<(), SchedulerError>>,
    ) {
        let archive = Arc::clone(&self.archive);
        let peer_source = Arc::clone(&self.peer_source);
        let internal = self.internal.clone();

        tokio::spawn(async move {
            let resolved = async {
                let info = archive.torrent_info(&name, &digest).await?;
                let peers = peer_source.announce(&name, info.info_hash()).await?;
                Ok::<_, SchedulerError>((info, peers))
            }
            .await;

            match resolved {
                Ok((info, peers)) => {
                    let _ = internal.send(InternalCommand::DownloadReady {
                        info,
                        peers,
                        responder,
                    });
                }
                Err(error) => {
                    warn!("Download of {} ({}) failed: {}", name, digest, error);
                    let _ = responder.send(Err(error));
                }
            }
        });
    }

    /// Registers the torrent and dials every eligible peer.
    pub fn start_download(&mut self, info: TorrentInfo, peers: Vec<PeerInfo>) {
        let info_hash = info.info_hash();
        self.register(info.clone());

        let now = self.connstate.now();
        let mut dialed = 0;
        for peer in peers {
            if peer.peer_id == self.peer_id() {
                continue;
            }
            if self.connstate.is_blacklisted(peer.peer_id, info_hash, now) {
                debug!("Skipping blacklisted {} for {}", peer.peer_id, info_hash);
                continue;
            }
            if let Err(error) = self.connstate.add_pending(peer.peer_id, info_hash) {
                debug!("Not dialing {}: {}", peer.peer_id, error);
                continue;
            }

            self.spawn_initialize(peer, info.clone());
            dialed += 1;
        }

        info!("Download of {} started, dialing {} peers", info, dialed);
    }

    fn spawn_initialize(&self, peer: PeerInfo, info: TorrentInfo) {
        let handshaker = self.handshaker.clone();
        let internal = self.internal.clone();
        let namespace = self.namespace.clone();

        tokio::spawn(async move {
            let result = handshaker
                .initialize(peer.peer_id, peer.addr, &info, &namespace)
                .await
                .map(|(conn, _remote_bitfield)| conn);
            let _ = internal.send(InternalCommand::HandshakeDone {
                peer_id: peer.peer_id,
                info_hash: info.info_hash(),
                origin: ConnOrigin::Local,
                result,
            });
        });
    }

    /// Admits an accepted handshake, resolving unknown torrents first.
    pub fn incoming_conn(&mut self, pending: PendingConn, info: Option<TorrentInfo>) {
        let info_hash = pending.info_hash();
        if let Some(info) = info {
            self.register(info);
        }

        let Some(info) = self.torrents.get(&info_hash).cloned() else {
            self.spawn_lookup(pending);
            return;
        };

        let peer_id = pending.peer_id();
        if let Err(error) = self.connstate.add_pending(peer_id, info_hash) {
            debug!("Rejecting inbound {} from {}: {}", peer_id, pending.remote_addr(), error);
            return;
        }

        let handshaker = self.handshaker.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = handshaker.establish(pending, &info).await;
            let _ = internal.send(InternalCommand::HandshakeDone {
                peer_id,
                info_hash,
                origin: ConnOrigin::Remote,
                result,
            });
        });
    }

    fn spawn_lookup(&self, pending: PendingConn) {
        let archive = Arc::clone(&self.archive);
        let internal = self.internal.clone();

        tokio::spawn(async move {
            match archive.lookup(pending.info_hash()).await {
                Ok(info) => {
                    let _ = internal.send(InternalCommand::IncomingConn {
                        pending,
                        info: Some(info),
                    });
                }
                Err(error) => {
                    debug!("Dropping inbound conn from {}: {}", pending.remote_addr(), error);
                    pending.close().await;
                }
            }
        });
    }

    /// Records the outcome of a handshake.
    pub async fn handshake_done(
        &mut self,
        peer_id: PeerId,
        info_hash: InfoHash,
        origin: ConnOrigin,
        result: Result<Conn, ConnError>,
    ) {
        let conn = match result {
            Ok(conn) => Arc::new(conn),
            Err(error) => {
                self.connstate.delete_pending(peer_id, info_hash);
                let category = ErrorCategory::from_conn_error(&error);
                warn!(
                    "{:?} handshake with {} for {} failed ({:?}): {}",
                    origin, peer_id, info_hash, category, error
                );
                if category.blacklists() {
                    self.connstate
                        .record_failure(peer_id, info_hash, error.to_string());
                }
                return;
            }
        };

        if self.stopped || !self.torrents.contains_key(&info_hash) {
            self.connstate.delete_pending(peer_id, info_hash);
            conn.close().await;
            return;
        }

        if let Err(error) = self.connstate.move_pending_to_active(Arc::clone(&conn)) {
            warn!("Discarding {}: {}", conn, error);
            conn.close().await;
            return;
        }

        info!("Added {}", conn);
    }

    /// Reacts to traffic and closures reported by conns.
    pub fn conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Message { key, message } => {
                debug!("Received {} from {}", message.kind(), key);
            }
            ConnEvent::Closed { key, reason } => {
                let removed = self.connstate.delete_active(key).is_some();
                debug!("{} closed (tracked={}): {:?}", key, removed, reason);

                if let Some(error) = reason {
                    if ErrorCategory::from_conn_error(&error).blacklists() {
                        self.connstate
                            .record_failure(key.peer_id, key.info_hash, error.to_string());
                    }
                }
            }
        }
    }

    pub fn reload(&mut self, mut config: ShoalConfig) {
        config.apply_defaults();
        self.handshaker.reload(config.conn);
        self.context().bandwidth().reconfigure(&config.bandwidth);
        self.connstate.set_config(config.connstate);
        self.namespace = config.scheduler.namespace;
        info!("Scheduler reloaded");
    }

    /// Closes a torrent's conns and forgets it.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::TorrentNotFound` - If no torrent has this digest
    pub async fn remove_torrent(&mut self, digest: &Digest) -> Result<(), SchedulerError> {
        let info_hash = self
            .digests
            .remove(digest)
            .ok_or_else(|| SchedulerError::TorrentNotFound {
                digest: digest.clone(),
            })?;
        self.torrents.remove(&info_hash);

        let conns = self.connstate.remove_torrent(info_hash);
        let closed = conns.len();
        join_all(conns.iter().map(|conn| conn.close())).await;

        info!("Removed torrent {} ({} conns closed)", digest, closed);
        Ok(())
    }

    pub fn blacklist_snapshot(&self) -> Vec<BlacklistedConn> {
        self.connstate.snapshot(self.connstate.now())
    }

    /// # Errors
    ///
    /// - `SchedulerError::TorrentNotFound` - If no torrent has this digest
    pub fn torrent_stats(&self, digest: &Digest) -> Result<TorrentStats, SchedulerError> {
        let info = self
            .digests
            .get(digest)
            .and_then(|hash| self.torrents.get(hash))
            .ok_or_else(|| SchedulerError::TorrentNotFound {
                digest: digest.clone(),
            })?;

        let mut peers: Vec<PeerId> = self
            .connstate
            .active_conns(info.info_hash())
            .iter()
            .map(|conn| conn.peer_id())
            .collect();
        peers.sort();

        Ok(TorrentStats {
            name: info.name().to_string(),
            info_hash: info.info_hash(),
            digest: info.digest().to_string(),
            peers,
            piece_count: info.piece_count(),
            complete: info.is_complete(),
        })
    }

    /// Closes every conn and stops the listener. Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(listener) = self.listener.take() {
            listener.abort();
        }

        let conns = self.connstate.all_active();
        join_all(conns.iter().map(|conn| conn.close())).await;
        for info_hash in self.torrents.keys() {
            self.connstate.remove_torrent(*info_hash);
        }

        info!("Scheduler stopped, closed {} conns", conns.len());
    }

    fn register(&mut self, info: TorrentInfo) {
        let info_hash = info.info_hash();
        self.digests.insert(info.digest().clone(), info_hash);
        self.torrents.insert(info_hash, info);
    }
}
