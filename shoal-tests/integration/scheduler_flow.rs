//! Two schedulers dialing, admitting and blacklisting each other.

use std::sync::Arc;
use std::time::Duration;

use shoal_core::announce::{PeerInfo, StaticPeerSource};
use shoal_core::config::ShoalConfig;
use shoal_core::scheduler::{TorrentStats, spawn_scheduler};
use shoal_core::storage::MemoryTorrentArchive;
use shoal_core::{
    Bitfield, BlacklistedConn, Digest, NodeContext, PeerId, Scheduler, SchedulerError,
    SchedulerHandle,
};

struct Node {
    peer_id: PeerId,
    handle: SchedulerHandle,
    archive: Arc<MemoryTorrentArchive>,
    peers: Arc<StaticPeerSource>,
}

async fn start_node(n: u8) -> Node {
    let peer_id = PeerId::new([n; 20]);
    let config = ShoalConfig::for_testing();
    let archive = Arc::new(MemoryTorrentArchive::new());
    let peers = Arc::new(StaticPeerSource::new());
    let context = NodeContext::new(peer_id, &config.bandwidth);
    let handle = spawn_scheduler(config, context, archive.clone(), peers.clone())
        .await
        .unwrap();

    Node {
        peer_id,
        handle,
        archive,
        peers,
    }
}

fn digest() -> Digest {
    Digest::new("feedface").unwrap()
}

async fn wait_for_stats<F>(handle: &SchedulerHandle, done: F) -> TorrentStats
where
    F: Fn(&TorrentStats) -> bool,
{
    for _ in 0..100 {
        let stats = handle.torrent_stats(&digest()).await.unwrap();
        if done(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("torrent stats never reached the expected state");
}

async fn wait_for_blacklist(handle: &SchedulerHandle) -> Vec<BlacklistedConn> {
    for _ in 0..100 {
        let snapshot = handle.blacklist_snapshot().await.unwrap();
        if !snapshot.is_empty() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("blacklist stayed empty");
}

#[tokio::test]
async fn test_remove_torrent_closes_conns_on_both_sides() {
    let seeder = start_node(1).await;
    let leecher = start_node(2).await;

    seeder.archive.add_torrent("blob", digest(), Bitfield::full(8));
    let info = leecher
        .archive
        .add_torrent("blob", digest(), Bitfield::new(8));
    leecher.peers.add_peer(
        info.info_hash(),
        PeerInfo::new(seeder.peer_id, seeder.handle.listen_addr()),
    );

    leecher.handle.download("blob", &digest()).await.unwrap();
    wait_for_stats(&leecher.handle, |stats| stats.peers == vec![seeder.peer_id]).await;
    wait_for_stats(&seeder.handle, |stats| stats.peers == vec![leecher.peer_id]).await;

    leecher.handle.remove_torrent(&digest()).await.unwrap();

    assert!(matches!(
        leecher.handle.torrent_stats(&digest()).await,
        Err(SchedulerError::TorrentNotFound { .. })
    ));
    let seeder_stats = wait_for_stats(&seeder.handle, |stats| stats.peers.is_empty()).await;
    assert!(seeder_stats.complete);

    seeder.handle.stop().await;
    leecher.handle.stop().await;
}

#[tokio::test]
async fn test_wrong_identity_is_blacklisted_and_skipped() {
    let seeder = start_node(1).await;
    let leecher = start_node(2).await;

    seeder.archive.add_torrent("blob", digest(), Bitfield::full(4));
    let info = leecher
        .archive
        .add_torrent("blob", digest(), Bitfield::new(4));
    let impostor = PeerId::new([9; 20]);
    leecher.peers.add_peer(
        info.info_hash(),
        PeerInfo::new(impostor, seeder.handle.listen_addr()),
    );

    leecher.handle.download("blob", &digest()).await.unwrap();

    let snapshot = wait_for_blacklist(&leecher.handle).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].peer_id, impostor);
    assert_eq!(snapshot[0].info_hash, info.info_hash());
    assert!(snapshot[0].reason.contains("identity"), "{}", snapshot[0].reason);

    // A second download skips the blacklisted peer instead of redialing.
    leecher.handle.download("blob", &digest()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = leecher.handle.torrent_stats(&digest()).await.unwrap();
    assert!(stats.peers.is_empty());
    assert_eq!(leecher.handle.blacklist_snapshot().await.unwrap().len(), 1);

    seeder.handle.stop().await;
    leecher.handle.stop().await;
}

#[tokio::test]
async fn test_seeder_without_torrent_drops_inbound_conn() {
    let seeder = start_node(1).await;
    let leecher = start_node(2).await;

    let info = leecher
        .archive
        .add_torrent("blob", digest(), Bitfield::new(4));
    leecher.peers.add_peer(
        info.info_hash(),
        PeerInfo::new(seeder.peer_id, seeder.handle.listen_addr()),
    );

    leecher.handle.download("blob", &digest()).await.unwrap();

    let snapshot = wait_for_blacklist(&leecher.handle).await;
    assert_eq!(snapshot[0].peer_id, seeder.peer_id);
    assert!(matches!(
        seeder.handle.torrent_stats(&digest()).await,
        Err(SchedulerError::TorrentNotFound { .. })
    ));

    seeder.handle.stop().await;
    leecher.handle.stop().await;
}

#[tokio::test]
async fn test_probe_and_stop_through_trait_object() {
    let node = start_node(1).await;
    let scheduler: Arc<dyn Scheduler> = Arc::new(node.handle.clone());

    scheduler.probe().await.unwrap();
    scheduler.stop().await;
    scheduler.stop().await;

    assert!(scheduler.probe().await.is_err());
    assert!(matches!(
        node.handle.download("blob", &digest()).await,
        Err(SchedulerError::Shutdown)
    ));
}
