//! Steady-state connection: framed, bandwidth-gated, timeout-bounded I/O.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, trace, warn};

use super::bandwidth::{BandwidthLimiter, Direction};
use super::message::{self, FRAME_HEADER_LEN, Message, MessageCodec};
use super::{ConnError, ConnEvent, ConnKey};
use crate::config::ConnConfig;
use crate::torrent::{Bitfield, InfoHash, PeerId};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOrigin {
    /// The remote peer dialed us.
    Remote,
    /// We dialed the remote peer.
    Local,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Connected,
    Closed,
}

/// Everything a conn needs to know about the completed handshake.
pub(crate) struct ConnParts {
    pub key: ConnKey,
    pub local_peer_id: PeerId,
    pub name: String,
    pub remote_bitfield: Bitfield,
    pub origin: ConnOrigin,
}

/// Authenticated channel to one peer for one torrent.
///
/// Built only by the handshaker. A background task reads frames and reports
/// them as [`ConnEvent`]s; sends go through a single writer lock so they are
/// delivered in call order. Dropping the conn closes it.
#[derive(Debug)]
pub struct Conn {
    key: ConnKey,
    local_peer_id: PeerId,
    name: String,
    remote_bitfield: Bitfield,
    origin: ConnOrigin,
    created_at: Instant,
    remote_addr: Option<SocketAddr>,
    io_timeout: Duration,
    bandwidth: Arc<BandwidthLimiter>,
    writer: Mutex<OwnedWriteHalf>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Conn {
    /// Wraps a handshaken stream and spawns its receive task.
    pub(crate) fn start(
        stream: TcpStream,
        parts: ConnParts,
        config: &ConnConfig,
        bandwidth: Arc<BandwidthLimiter>,
        events: mpsc::Sender<ConnEvent>,
    ) -> Self {
        let remote_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(receive_loop(
            reader,
            ReceiveContext {
                key: parts.key,
                io_timeout: config.io_timeout,
                max_frame_size: config.max_frame_size,
                bandwidth: Arc::clone(&bandwidth),
                events,
                shutdown: shutdown_rx,
                closed: Arc::clone(&closed),
            },
        ));

        debug!(
            "Started {} for {} ({:?})",
            parts.key, parts.name, parts.origin
        );

        Self {
            key: parts.key,
            local_peer_id: parts.local_peer_id,
            name: parts.name,
            remote_bitfield: parts.remote_bitfield,
            origin: parts.origin,
            created_at: Instant::now(),
            remote_addr,
            io_timeout: config.io_timeout,
            bandwidth,
            writer: Mutex::new(writer),
            closed,
            shutdown,
        }
    }

    /// Sends one message to the peer.
    ///
    /// Egress tokens are reserved for the whole frame before it is written.
    /// A concurrent `close` aborts the send and releases the writer. Any
    /// failure other than `Closed` closes the conn.
    ///
    /// # Errors
    ///
    /// - `ConnError::Closed` - If the conn was closed before or during the send
    /// - `ConnError::IoTimeout` - If reservation and write exceed `io_timeout`
    /// - `ConnError::Io` - If the write fails
    pub async fn send(&self, message: &Message) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        let mut shutdown = self.shutdown.subscribe();
        let frame = MessageCodec::serialize_message(message);
        let write = async {
            let mut writer = self.writer.lock().await;
            if self.is_closed() {
                return Err(ConnError::Closed);
            }
            self.bandwidth
                .wait(Direction::Egress, frame.len() as u64)
                .await;
            message::write_frame(&mut *writer, &frame).await
        };

        let result = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => Err(ConnError::Closed),
            result = tokio::time::timeout(self.io_timeout, write) => {
                result.unwrap_or(Err(ConnError::IoTimeout))
            }
        };

        match &result {
            Ok(()) => trace!("Sent {} on {}", message.kind(), self.key),
            Err(ConnError::Closed) => {}
            Err(error) => {
                warn!("Send on {} failed: {}", self.key, error);
                self.close().await;
            }
        }

        result
    }

    /// Closes the conn. Idempotent.
    ///
    /// Stops the receive task, which then emits the single `Closed` event,
    /// and shuts down the write half.
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);

        if let Ok(mut writer) = tokio::time::timeout(self.io_timeout, self.writer.lock()).await {
            let _ = writer.shutdown().await;
        }
        debug!("Closed {}", self.key);
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    /// Remote peer identity.
    pub fn peer_id(&self) -> PeerId {
        self.key.peer_id
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.key.info_hash
    }

    /// Torrent name negotiated in the handshake.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> ConnOrigin {
        self.origin
    }

    pub fn opened_by_remote(&self) -> bool {
        self.origin == ConnOrigin::Remote
    }

    pub fn status(&self) -> ConnStatus {
        if self.is_closed() {
            ConnStatus::Closed
        } else {
            ConnStatus::Connected
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote piece availability as advertised at handshake time.
    pub fn remote_bitfield(&self) -> &Bitfield {
        &self.remote_bitfield
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Conn(peer={}, hash={}, name={}, origin={:?})",
            self.key.peer_id, self.key.info_hash, self.name, self.origin
        )
    }
}

struct ReceiveContext {
    key: ConnKey,
    io_timeout: Duration,
    max_frame_size: u32,
    bandwidth: Arc<BandwidthLimiter>,
    events: mpsc::Sender<ConnEvent>,
    shutdown: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
}

async fn receive_loop(mut reader: OwnedReadHalf, mut ctx: ReceiveContext) {
    let reason = loop {
        let frame = tokio::select! {
            _ = ctx.shutdown.changed() => break None,
            result = tokio::time::timeout(
                ctx.io_timeout,
                read_frame(&mut reader, ctx.max_frame_size, &ctx.bandwidth),
            ) => result,
        };

        let message = match frame {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => {
                debug!("Peer closed {}", ctx.key);
                break None;
            }
            Ok(Err(error)) => break Some(error),
            Err(_) => break Some(ConnError::IoTimeout),
        };

        trace!("Received {} on {}", message.kind(), ctx.key);
        let event = ConnEvent::Message {
            key: ctx.key,
            message,
        };
        tokio::select! {
            _ = ctx.shutdown.changed() => break None,
            sent = ctx.events.send(event) => {
                if sent.is_err() {
                    break None;
                }
            }
        }
    };

    ctx.closed.store(true, Ordering::SeqCst);
    if let Some(error) = &reason {
        warn!("{} failed: {}", ctx.key, error);
    }
    let _ = ctx
        .events
        .send(ConnEvent::Closed {
            key: ctx.key,
            reason,
        })
        .await;
}

async fn read_frame(
    reader: &mut OwnedReadHalf,
    max_frame_size: u32,
    bandwidth: &BandwidthLimiter,
) -> Result<Option<Message>, ConnError> {
    let Some(length) = message::read_frame_len(reader, max_frame_size).await? else {
        return Ok(None);
    };
    bandwidth
        .wait(Direction::Ingress, (FRAME_HEADER_LEN as u64) + u64::from(length))
        .await;
    let body = message::read_frame_body(reader, length).await?;
    MessageCodec::deserialize_body(&body).map(Some)
}
