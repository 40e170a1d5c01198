//! Handshake protocol driving raw streams into authenticated conns.
//!
//! Accept side: Listening -> Pending (`accept`) -> Connected (`establish`).
//! Initiate side: Idle -> HandshakeSent -> Connected (`initialize`).
//! Any failure closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::connection::{Conn, ConnOrigin, ConnParts};
use super::handshake::HandshakeMessage;
use super::message::{read_message_with_timeout, send_message_with_timeout};
use super::{ConnError, ConnEvent, NodeContext};
use crate::config::ConnConfig;
use crate::torrent::{Bitfield, InfoHash, PeerId, TorrentInfo};

/// Inbound stream whose handshake has been read but not yet validated.
///
/// Dropping it closes the socket.
#[derive(Debug)]
pub struct PendingConn {
    handshake: HandshakeMessage,
    stream: TcpStream,
    remote_addr: SocketAddr,
}

impl PendingConn {
    /// Peer id the remote claims.
    pub fn peer_id(&self) -> PeerId {
        self.handshake.peer_id
    }

    pub fn name(&self) -> &str {
        &self.handshake.name
    }

    pub fn info_hash(&self) -> InfoHash {
        self.handshake.info_hash
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.handshake.bitfield
    }

    pub fn namespace(&self) -> &str {
        &self.handshake.namespace
    }

    pub fn handshake(&self) -> &HandshakeMessage {
        &self.handshake
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Rejects the pending conn, shutting down its socket.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Performs handshakes and builds conns bound to the node's shared state.
///
/// Config sits behind a shared lock so a reload applies to every later
/// handshake without touching live conns.
#[derive(Debug, Clone)]
pub struct Handshaker {
    config: Arc<RwLock<ConnConfig>>,
    context: NodeContext,
    events: mpsc::Sender<ConnEvent>,
}

impl Handshaker {
    /// Creates a handshaker whose conns report to `events`.
    pub fn new(mut config: ConnConfig, context: NodeContext, events: mpsc::Sender<ConnEvent>) -> Self {
        config.apply_defaults();
        Self {
            config: Arc::new(RwLock::new(config)),
            context,
            events,
        }
    }

    /// Snapshot of the current config.
    pub fn config(&self) -> ConnConfig {
        self.config.read().clone()
    }

    /// Replaces timeouts and limits for future handshakes and conns.
    pub fn reload(&self, mut config: ConnConfig) {
        config.apply_defaults();
        *self.config.write() = config;
    }

    pub fn peer_id(&self) -> PeerId {
        self.context.peer_id()
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    /// Reads the remote handshake from an inbound stream.
    ///
    /// # Errors
    ///
    /// - `ConnError::ReadTimeout` - If no handshake arrives within `handshake_timeout`
    /// - `ConnError::MalformedMessage` - If the handshake does not decode
    /// - `ConnError::Io` - If the stream fails or closes
    pub async fn accept(&self, mut stream: TcpStream) -> Result<PendingConn, ConnError> {
        let config = self.config();
        let remote_addr = stream.peer_addr()?;

        let message =
            read_message_with_timeout(&mut stream, config.handshake_timeout, config.max_frame_size)
                .await?;
        let handshake = HandshakeMessage::from_message(message)?;

        debug!(
            "Accepted handshake from {} (peer={}, hash={}, namespace={:?})",
            remote_addr, handshake.peer_id, handshake.info_hash, handshake.namespace
        );

        Ok(PendingConn {
            handshake,
            stream,
            remote_addr,
        })
    }

    /// Completes an inbound handshake by replying with the local one.
    ///
    /// The reply never carries a namespace.
    ///
    /// # Errors
    ///
    /// - `ConnError::InfoHashMismatch` - If the pending handshake names another torrent
    /// - `ConnError::SendTimeout` - If the reply is not written within `handshake_timeout`
    /// - `ConnError::Io` - If the write fails
    pub async fn establish(&self, pending: PendingConn, info: &TorrentInfo) -> Result<Conn, ConnError> {
        let config = self.config();
        let PendingConn {
            handshake,
            mut stream,
            remote_addr,
        } = pending;

        if handshake.info_hash != info.info_hash() {
            let _ = stream.shutdown().await;
            return Err(ConnError::InfoHashMismatch {
                expected: info.info_hash(),
                actual: handshake.info_hash,
            });
        }

        let local = HandshakeMessage::for_torrent(self.peer_id(), info, "");
        if let Err(error) =
            send_message_with_timeout(&mut stream, &local.to_message(), config.handshake_timeout)
                .await
        {
            let _ = stream.shutdown().await;
            return Err(error);
        }

        info!(
            "Established conn with {} at {} for {}",
            handshake.peer_id,
            remote_addr,
            info.name()
        );
        Ok(self.build_conn(stream, &config, handshake, info, ConnOrigin::Remote))
    }

    /// Dials `addr` and performs a full handshake for `info`.
    ///
    /// Returns the conn together with the remote's advertised bitfield.
    ///
    /// # Errors
    ///
    /// - `ConnError::DialFailure` - If the dial fails or exceeds `dial_timeout`
    /// - `ConnError::SendTimeout` / `ConnError::ReadTimeout` - If either handshake leg stalls
    /// - `ConnError::MalformedMessage` - If the reply does not decode
    /// - `ConnError::UnexpectedPeerIdentity` - If the remote is not `peer_id`
    /// - `ConnError::InfoHashMismatch` - If the remote replies for another torrent
    pub async fn initialize(
        &self,
        peer_id: PeerId,
        addr: SocketAddr,
        info: &TorrentInfo,
        namespace: &str,
    ) -> Result<(Conn, Bitfield), ConnError> {
        let config = self.config();

        let mut stream = match tokio::time::timeout(config.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                return Err(ConnError::DialFailure {
                    addr,
                    reason: error.to_string(),
                });
            }
            Err(_) => {
                return Err(ConnError::DialFailure {
                    addr,
                    reason: format!("timed out after {:?}", config.dial_timeout),
                });
            }
        };

        let remote = match self
            .full_handshake(&mut stream, peer_id, info, namespace, &config)
            .await
        {
            Ok(remote) => remote,
            Err(error) => {
                let _ = stream.shutdown().await;
                return Err(error);
            }
        };

        info!(
            "Initialized conn with {} at {} for {}",
            peer_id,
            addr,
            info.name()
        );
        let bitfield = remote.bitfield.clone();
        let conn = self.build_conn(stream, &config, remote, info, ConnOrigin::Local);
        Ok((conn, bitfield))
    }

    async fn full_handshake(
        &self,
        stream: &mut TcpStream,
        peer_id: PeerId,
        info: &TorrentInfo,
        namespace: &str,
        config: &ConnConfig,
    ) -> Result<HandshakeMessage, ConnError> {
        let local = HandshakeMessage::for_torrent(self.peer_id(), info, namespace);
        send_message_with_timeout(stream, &local.to_message(), config.handshake_timeout).await?;

        let reply =
            read_message_with_timeout(stream, config.handshake_timeout, config.max_frame_size)
                .await?;
        let remote = HandshakeMessage::from_message(reply)?;

        if remote.peer_id != peer_id {
            return Err(ConnError::UnexpectedPeerIdentity {
                expected: peer_id,
                actual: remote.peer_id,
            });
        }
        if remote.info_hash != info.info_hash() {
            return Err(ConnError::InfoHashMismatch {
                expected: info.info_hash(),
                actual: remote.info_hash,
            });
        }

        Ok(remote)
    }

    fn build_conn(
        &self,
        stream: TcpStream,
        config: &ConnConfig,
        remote: HandshakeMessage,
        info: &TorrentInfo,
        origin: ConnOrigin,
    ) -> Conn {
        let parts = ConnParts {
            key: self.context.next_conn_key(remote.peer_id, info.info_hash()),
            local_peer_id: self.peer_id(),
            name: info.name().to_string(),
            remote_bitfield: remote.bitfield,
            origin,
        };
        Conn::start(
            stream,
            parts,
            config,
            Arc::clone(self.context.bandwidth()),
            self.events.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::config::BandwidthConfig;
    use crate::conn::message::MessageCodec;
    use crate::conn::{ErrorCategory, Message};
    use crate::torrent::{Digest, PieceIndex};

    fn torrent(hash: u8, pieces: &[bool]) -> TorrentInfo {
        TorrentInfo::new(
            "layer.tar",
            InfoHash::new([hash; 20]),
            Digest::new("beef").unwrap(),
            Bitfield::from_bools(pieces),
        )
    }

    fn handshaker(peer: u8) -> (Handshaker, mpsc::Receiver<ConnEvent>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let context = NodeContext::new(PeerId::new([peer; 20]), &BandwidthConfig::unlimited());
        let config = ConnConfig {
            handshake_timeout: Duration::from_millis(300),
            ..ConnConfig::default()
        };
        (Handshaker::new(config, context, events_tx), events_rx)
    }

    #[tokio::test]
    async fn test_full_handshake_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seeder, _seeder_events) = handshaker(1);
        let (leecher, _leecher_events) = handshaker(2);
        let seeded = torrent(9, &[true, true, true]);
        let empty = torrent(9, &[false, false, false]);

        let server = tokio::spawn({
            let seeded = seeded.clone();
            async move {
                let (stream, _) = listener.accept().await.unwrap();
                let pending = seeder.accept(stream).await.unwrap();
                assert_eq!(pending.namespace(), "library/ubuntu");
                assert_eq!(pending.peer_id(), PeerId::new([2; 20]));
                seeder.establish(pending, &seeded).await.unwrap()
            }
        });

        let (conn, remote_bitfield) = leecher
            .initialize(PeerId::new([1; 20]), addr, &empty, "library/ubuntu")
            .await
            .unwrap();
        let accepted = server.await.unwrap();

        assert!(remote_bitfield.is_complete());
        assert_eq!(conn.origin(), ConnOrigin::Local);
        assert_eq!(accepted.origin(), ConnOrigin::Remote);
        assert!(!accepted.remote_bitfield().has(PieceIndex::new(0)));
        assert_eq!(conn.peer_id(), PeerId::new([1; 20]));
        assert_eq!(accepted.peer_id(), PeerId::new([2; 20]));
    }

    #[tokio::test]
    async fn test_accept_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (acceptor, _events) = handshaker(1);

        let _silent = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let result = acceptor.accept(stream).await;
        assert!(matches!(result, Err(ConnError::ReadTimeout)));
    }

    #[tokio::test]
    async fn test_accept_rejects_non_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (acceptor, _events) = handshaker(1);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&MessageCodec::serialize_message(&Message::Complete))
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let result = acceptor.accept(stream).await;
        assert!(matches!(result, Err(ConnError::MalformedMessage { .. })));
    }

    #[tokio::test]
    async fn test_establish_rejects_other_torrent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (acceptor, _events) = handshaker(1);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let offered = HandshakeMessage::for_torrent(PeerId::new([2; 20]), &torrent(5, &[true]), "");
        client.write_all(&offered.encode()).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let pending = acceptor.accept(stream).await.unwrap();
        let result = acceptor.establish(pending, &torrent(6, &[true])).await;

        let error = result.unwrap_err();
        assert!(matches!(error, ConnError::InfoHashMismatch { .. }));
        assert_eq!(
            ErrorCategory::from_conn_error(&error),
            ErrorCategory::IdentityViolation
        );
    }

    #[tokio::test]
    async fn test_initialize_reports_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (dialer, _events) = handshaker(1);
        let result = dialer
            .initialize(PeerId::new([2; 20]), addr, &torrent(1, &[true]), "")
            .await;

        assert!(matches!(result, Err(ConnError::DialFailure { addr: failed, .. }) if failed == addr));
    }

    #[tokio::test]
    async fn test_reload_applies_to_later_handshakes() {
        let (handshaker, _events) = handshaker(1);
        handshaker.reload(ConnConfig {
            handshake_timeout: Duration::from_secs(42),
            dial_timeout: Duration::ZERO,
            ..ConnConfig::default()
        });

        let config = handshaker.config();
        assert_eq!(config.handshake_timeout, Duration::from_secs(42));
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
    }
}
