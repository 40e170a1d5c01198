//! Handle for communicating with the scheduler actor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use super::commands::{SchedulerCommand, TorrentStats};
use super::{ReloadableScheduler, Scheduler, SchedulerError};
use crate::config::ShoalConfig;
use crate::connstate::BlacklistedConn;
use crate::torrent::Digest;

/// Handle for communicating with the scheduler actor.
///
/// Cheap to clone and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
    listen_addr: SocketAddr,
    probe_timeout: Arc<RwLock<Duration>>,
}

impl SchedulerHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<SchedulerCommand>,
        listen_addr: SocketAddr,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            sender,
            listen_addr,
            probe_timeout: Arc::new(RwLock::new(probe_timeout)),
        }
    }

    /// Address the inbound listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Active peers and local completeness for one torrent.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::TorrentNotFound` - If the torrent is not registered
    /// - `SchedulerError::Shutdown` - If the scheduler has stopped
    pub async fn torrent_stats(&self, digest: &Digest) -> Result<TorrentStats, SchedulerError> {
        let (responder, rx) = oneshot::channel();
        self.send(SchedulerCommand::TorrentStats {
            digest: digest.clone(),
            responder,
        })
        .await?;

        rx.await.map_err(|_| SchedulerError::Shutdown)?
    }

    async fn send(&self, command: SchedulerCommand) -> Result<(), SchedulerError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SchedulerError::Shutdown)
    }
}

#[async_trait]
impl Scheduler for SchedulerHandle {
    async fn download(&self, name: &str, digest: &Digest) -> Result<(), SchedulerError> {
        let (responder, rx) = oneshot::channel();
        self.send(SchedulerCommand::Download {
            name: name.to_string(),
            digest: digest.clone(),
            responder,
        })
        .await?;

        rx.await.map_err(|_| SchedulerError::Shutdown)?
    }

    async fn probe(&self) -> Result<(), SchedulerError> {
        let timeout = *self.probe_timeout.read();
        let round_trip = async {
            let (responder, rx) = oneshot::channel();
            self.send(SchedulerCommand::Probe { responder }).await?;
            rx.await.map_err(|_| SchedulerError::Shutdown)
        };

        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| SchedulerError::ProbeTimeout { timeout })?
    }

    async fn remove_torrent(&self, digest: &Digest) -> Result<(), SchedulerError> {
        let (responder, rx) = oneshot::channel();
        self.send(SchedulerCommand::RemoveTorrent {
            digest: digest.clone(),
            responder,
        })
        .await?;

        rx.await.map_err(|_| SchedulerError::Shutdown)?
    }

    async fn stop(&self) {
        let (responder, rx) = oneshot::channel();
        if self.send(SchedulerCommand::Stop { responder }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn blacklist_snapshot(&self) -> Result<Vec<BlacklistedConn>, SchedulerError> {
        let (responder, rx) = oneshot::channel();
        self.send(SchedulerCommand::BlacklistSnapshot { responder })
            .await?;

        rx.await.map_err(|_| SchedulerError::Shutdown)
    }
}

#[async_trait]
impl ReloadableScheduler for SchedulerHandle {
    async fn reload(&self, mut config: ShoalConfig) -> Result<(), SchedulerError> {
        config.apply_defaults();
        *self.probe_timeout.write() = config.scheduler.probe_timeout;

        let (responder, rx) = oneshot::channel();
        self.send(SchedulerCommand::Reload { config, responder })
            .await?;

        rx.await.map_err(|_| SchedulerError::Shutdown)
    }
}
