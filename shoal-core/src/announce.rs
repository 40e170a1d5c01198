//! Announce interface: where the scheduler learns about peers.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::torrent::{InfoHash, PeerId};

/// A peer returned by an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self { peer_id, addr }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnounceError {
    #[error("Announce for {info_hash} failed: {reason}")]
    Failed { info_hash: InfoHash, reason: String },
}

/// Source of peers for a torrent.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Announces interest in a torrent and returns known peers.
    ///
    /// # Errors
    ///
    /// - `AnnounceError::Failed` - If the peer source cannot be reached
    async fn announce(&self, name: &str, info_hash: InfoHash) -> Result<Vec<PeerInfo>, AnnounceError>;
}

/// Fixed peer lists, configured up front.
#[derive(Debug, Default)]
pub struct StaticPeerSource {
    peers: RwLock<HashMap<InfoHash, Vec<PeerInfo>>>,
}

impl StaticPeerSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer for a torrent, ignoring duplicates.
    pub fn add_peer(&self, info_hash: InfoHash, peer: PeerInfo) {
        let mut peers = self.peers.write();
        let list = peers.entry(info_hash).or_default();
        if !list.contains(&peer) {
            list.push(peer);
        }
    }

    /// Replaces the peer list for a torrent.
    pub fn set_peers(&self, info_hash: InfoHash, peers: Vec<PeerInfo>) {
        self.peers.write().insert(info_hash, peers);
    }
}

#[async_trait]
impl PeerSource for StaticPeerSource {
    async fn announce(&self, _name: &str, info_hash: InfoHash) -> Result<Vec<PeerInfo>, AnnounceError> {
        Ok(self.peers.read().get(&info_hash).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_peer_source() {
        let source = StaticPeerSource::new();
        let hash = InfoHash::new([1; 20]);
        let peer = PeerInfo::new(PeerId::new([2; 20]), "127.0.0.1:7000".parse().unwrap());

        assert!(source.announce("blob", hash).await.unwrap().is_empty());

        source.add_peer(hash, peer);
        source.add_peer(hash, peer);
        assert_eq!(source.announce("blob", hash).await.unwrap(), vec![peer]);

        source.set_peers(hash, Vec::new());
        assert!(source.announce("blob", hash).await.unwrap().is_empty());
    }
}
