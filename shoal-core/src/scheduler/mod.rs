//! Scheduler façade over handshakes, conns and the blacklist.
//!
//! The scheduler is an actor: a [`SchedulerHandle`] sends commands over a
//! channel and the actor task owns all torrent and conn state. It decides
//! whom to dial, admits inbound conns, and turns failures into blacklist
//! entries.

mod actor;
mod commands;
mod core;
mod handle;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

use std::time::Duration;

pub use actor::{spawn_scheduler, spawn_scheduler_with_clock};
use async_trait::async_trait;
pub use commands::TorrentStats;
pub use handle::SchedulerHandle;

use crate::announce::AnnounceError;
use crate::config::ShoalConfig;
use crate::conn::ConnError;
use crate::connstate::{BlacklistedConn, ConnStateError};
use crate::storage::StorageError;
use crate::torrent::Digest;

/// Errors returned by scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Torrent with digest {digest} not found")]
    TorrentNotFound { digest: Digest },

    #[error("Scheduler has shut down")]
    Shutdown,

    #[error("Scheduler did not answer probe within {timeout:?}")]
    ProbeTimeout { timeout: Duration },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Announce error: {0}")]
    Announce(#[from] AnnounceError),

    #[error("Connection error: {0}")]
    Conn(#[from] ConnError),

    #[error("Connection state error: {0}")]
    ConnState(#[from] ConnStateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the rest of the system performs on a scheduler.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Registers a blob's torrent and starts connecting to its peers.
    ///
    /// Returns once the torrent is registered and dials are under way.
    async fn download(&self, name: &str, digest: &Digest) -> Result<(), SchedulerError>;

    /// Checks that the scheduler is responsive.
    async fn probe(&self) -> Result<(), SchedulerError>;

    /// Closes a torrent's conns and forgets it.
    async fn remove_torrent(&self, digest: &Digest) -> Result<(), SchedulerError>;

    /// Closes everything and stops the scheduler. Safe to call repeatedly.
    async fn stop(&self);

    /// Currently blacklisted (peer, torrent) pairs.
    async fn blacklist_snapshot(&self) -> Result<Vec<BlacklistedConn>, SchedulerError>;
}

/// A scheduler whose settings can be swapped at runtime.
#[async_trait]
pub trait ReloadableScheduler: Scheduler {
    /// Applies new timeouts, bandwidth limits and blacklist cooldown.
    ///
    /// Live conns are kept.
    async fn reload(&self, config: ShoalConfig) -> Result<(), SchedulerError>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::announce::{PeerInfo, StaticPeerSource};
    use crate::config::BandwidthConfig;
    use crate::conn::{Direction, NodeContext};
    use crate::connstate::{Clock, ManualClock};
    use crate::storage::MemoryTorrentArchive;
    use crate::torrent::{Bitfield, PeerId};

    struct Node {
        peer_id: PeerId,
        handle: SchedulerHandle,
        archive: Arc<MemoryTorrentArchive>,
        peers: Arc<StaticPeerSource>,
        context: NodeContext,
    }

    async fn node(n: u8, clock: &ManualClock) -> Node {
        let peer_id = PeerId::new([n; 20]);
        let archive = Arc::new(MemoryTorrentArchive::new());
        let peers = Arc::new(StaticPeerSource::new());
        let context = NodeContext::new(peer_id, &BandwidthConfig::unlimited());
        let handle = spawn_scheduler_with_clock(
            ShoalConfig::for_testing(),
            context.clone(),
            archive.clone(),
            peers.clone(),
            Arc::new(clock.clone()),
        )
        .await
        .unwrap();

        Node {
            peer_id,
            handle,
            archive,
            peers,
            context,
        }
    }

    fn digest() -> Digest {
        Digest::new("0123456789abcdef").unwrap()
    }

    async fn wait_for_peers(handle: &SchedulerHandle, count: usize) -> TorrentStats {
        for _ in 0..100 {
            let stats = handle.torrent_stats(&digest()).await.unwrap();
            if stats.peers.len() == count {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {count} peers");
    }

    #[tokio::test]
    async fn test_download_connects_to_seeder() {
        let clock = ManualClock::default();
        let seeder = node(1, &clock).await;
        let leecher = node(2, &clock).await;

        seeder.archive.add_torrent("blob", digest(), Bitfield::full(16));
        let info = leecher.archive.add_torrent("blob", digest(), Bitfield::new(16));
        leecher.peers.add_peer(
            info.info_hash(),
            PeerInfo::new(seeder.peer_id, seeder.handle.listen_addr()),
        );

        leecher.handle.download("blob", &digest()).await.unwrap();

        let leecher_stats = wait_for_peers(&leecher.handle, 1).await;
        assert_eq!(leecher_stats.peers, vec![seeder.peer_id]);
        assert!(!leecher_stats.complete);

        // The seeder learned about the torrent from its archive.
        let seeder_stats = wait_for_peers(&seeder.handle, 1).await;
        assert_eq!(seeder_stats.peers, vec![leecher.peer_id]);
        assert!(seeder_stats.complete);

        seeder.handle.stop().await;
        leecher.handle.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_blacklisted() {
        let clock = ManualClock::default();
        let leecher = node(2, &clock).await;

        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let info = leecher.archive.add_torrent("blob", digest(), Bitfield::new(4));
        let ghost = PeerId::new([9; 20]);
        leecher
            .peers
            .add_peer(info.info_hash(), PeerInfo::new(ghost, dead_addr));

        leecher.handle.download("blob", &digest()).await.unwrap();

        let mut snapshot = Vec::new();
        for _ in 0..100 {
            snapshot = leecher.handle.blacklist_snapshot().await.unwrap();
            if !snapshot.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].peer_id, ghost);
        assert_eq!(snapshot[0].info_hash, info.info_hash());

        // Expired after the cooldown of the testing config.
        clock.advance(Duration::from_secs(6));
        assert!(leecher.handle.blacklist_snapshot().await.unwrap().is_empty());

        leecher.handle.stop().await;
    }

    #[tokio::test]
    async fn test_download_unknown_torrent() {
        let clock = ManualClock::default();
        let leecher = node(2, &clock).await;

        let result = leecher.handle.download("missing", &digest()).await;
        assert!(matches!(result, Err(SchedulerError::Storage(_))));

        let result = leecher.handle.remove_torrent(&digest()).await;
        assert!(matches!(result, Err(SchedulerError::TorrentNotFound { .. })));

        leecher.handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_fails_probe() {
        let clock = ManualClock::default();
        let node = node(1, &clock).await;

        node.handle.probe().await.unwrap();
        node.handle.stop().await;
        node.handle.stop().await;

        assert!(matches!(
            node.handle.probe().await,
            Err(SchedulerError::Shutdown)
        ));
        assert!(matches!(
            node.handle.blacklist_snapshot().await,
            Err(SchedulerError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_reload_applies_new_limits_and_cooldown() {
        let clock = ManualClock::default();
        let node = node(1, &clock).await;
        assert!(!node.context.bandwidth().is_enabled());

        let mut config = ShoalConfig::for_testing();
        config.connstate.blacklist_cooldown = Duration::from_secs(600);
        config.bandwidth = BandwidthConfig {
            enabled: true,
            egress_rate: 10,
            egress_burst: 10,
            ingress_rate: 10,
            ingress_burst: 10,
        };
        node.handle.reload(config).await.unwrap();

        let bandwidth = node.context.bandwidth();
        assert!(bandwidth.is_enabled());
        assert!(bandwidth.reserve(Direction::Egress, 1000) > Duration::from_secs(90));

        // A failure recorded after the reload uses the new cooldown.
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let info = node.archive.add_torrent("blob", digest(), Bitfield::new(4));
        let ghost = PeerId::new([9; 20]);
        node.peers
            .add_peer(info.info_hash(), PeerInfo::new(ghost, dead_addr));
        node.handle.download("blob", &digest()).await.unwrap();

        let mut snapshot = Vec::new();
        for _ in 0..100 {
            snapshot = node.handle.blacklist_snapshot().await.unwrap();
            if !snapshot.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot[0].expires_at - clock.now(),
            chrono::Duration::seconds(600)
        );

        // Still blocked well past the testing default of 5s.
        clock.advance(Duration::from_secs(60));
        assert_eq!(node.handle.blacklist_snapshot().await.unwrap().len(), 1);

        node.handle.stop().await;
    }
}
