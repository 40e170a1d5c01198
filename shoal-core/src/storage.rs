//! Torrent archive interface consumed by the scheduler.
//!
//! Piece storage itself lives outside this crate; the scheduler only needs
//! read-only snapshots of torrent metadata and local piece availability.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sha1::{Digest as _, Sha1};

use crate::torrent::{Bitfield, Digest, InfoHash, TorrentInfo};

/// Errors returned by torrent archives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Torrent {name} with digest {digest} not found")]
    TorrentNotFound { name: String, digest: Digest },

    #[error("No torrent with info hash {info_hash}")]
    UnknownInfoHash { info_hash: InfoHash },
}

/// Source of torrent snapshots.
#[async_trait]
pub trait TorrentArchive: Send + Sync {
    /// Returns the torrent for a blob, as requested by a download.
    ///
    /// # Errors
    ///
    /// - `StorageError::TorrentNotFound` - If the archive has no such blob
    async fn torrent_info(&self, name: &str, digest: &Digest) -> Result<TorrentInfo, StorageError>;

    /// Returns the torrent an inbound handshake refers to.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownInfoHash` - If no torrent has this info hash
    async fn lookup(&self, info_hash: InfoHash) -> Result<TorrentInfo, StorageError>;
}

/// In-memory archive for tests and the CLI.
#[derive(Debug, Default)]
pub struct MemoryTorrentArchive {
    torrents: RwLock<HashMap<InfoHash, TorrentInfo>>,
    by_digest: RwLock<HashMap<Digest, InfoHash>>,
}

impl MemoryTorrentArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a blob and returns its torrent snapshot.
    ///
    /// The info hash is derived from name, digest and piece count, so two
    /// archives registering the same blob agree on it.
    pub fn add_torrent(&self, name: &str, digest: Digest, bitfield: Bitfield) -> TorrentInfo {
        let info_hash = Self::info_hash_for(name, &digest, bitfield.len());
        let info = TorrentInfo::new(name, info_hash, digest.clone(), bitfield);

        self.torrents.write().insert(info_hash, info.clone());
        self.by_digest.write().insert(digest, info_hash);
        info
    }

    /// Replaces local piece availability for a known torrent.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnknownInfoHash` - If the torrent is not registered
    pub fn set_bitfield(&self, info_hash: InfoHash, bitfield: Bitfield) -> Result<(), StorageError> {
        let mut torrents = self.torrents.write();
        let info = torrents
            .get_mut(&info_hash)
            .ok_or(StorageError::UnknownInfoHash { info_hash })?;
        *info = TorrentInfo::new(info.name(), info_hash, info.digest().clone(), bitfield);
        Ok(())
    }

    /// Forgets a torrent. Returns its last snapshot.
    pub fn remove(&self, digest: &Digest) -> Option<TorrentInfo> {
        let info_hash = self.by_digest.write().remove(digest)?;
        self.torrents.write().remove(&info_hash)
    }

    /// Deterministic info hash for a blob.
    pub fn info_hash_for(name: &str, digest: &Digest, piece_count: u32) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        hasher.update(digest.as_str().as_bytes());
        hasher.update(piece_count.to_be_bytes());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());
        InfoHash::new(hash)
    }
}

#[async_trait]
impl TorrentArchive for MemoryTorrentArchive {
    async fn torrent_info(&self, name: &str, digest: &Digest) -> Result<TorrentInfo, StorageError> {
        let info_hash = self.by_digest.read().get(digest).copied();
        info_hash
            .and_then(|hash| self.torrents.read().get(&hash).cloned())
            .filter(|info| info.name() == name)
            .ok_or_else(|| StorageError::TorrentNotFound {
                name: name.to_string(),
                digest: digest.clone(),
            })
    }

    async fn lookup(&self, info_hash: InfoHash) -> Result<TorrentInfo, StorageError> {
        self.torrents
            .read()
            .get(&info_hash)
            .cloned()
            .ok_or(StorageError::UnknownInfoHash { info_hash })
    }
}
