//! Torrent identifiers and read-only torrent snapshots.
//!
//! Every connection is scoped to one torrent, keyed by its [`InfoHash`]. The
//! storage layer owns piece availability; this crate only reads snapshots of it
//! through [`TorrentInfo`].

mod bitfield;
mod peer_id;

use std::fmt;
use std::str::FromStr;

pub use bitfield::{Bitfield, BitfieldError};
pub use peer_id::PeerId;
use serde::{Serialize, Serializer};

/// Errors produced when parsing hex-encoded identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("Invalid {kind} length: expected {expected} hex characters, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid {kind} hex: {reason}")]
    InvalidHex { kind: &'static str, reason: String },
}

/// Decodes a 40-character hex string into 20 bytes.
pub(crate) fn decode_hex_20(kind: &'static str, value: &str) -> Result<[u8; 20], IdError> {
    if value.len() != 40 {
        return Err(IdError::InvalidLength {
            kind,
            expected: 40,
            actual: value.len(),
        });
    }

    let mut bytes = [0u8; 20];
    hex::decode_to_slice(value, &mut bytes).map_err(|e| IdError::InvalidHex {
        kind,
        reason: e.to_string(),
    })?;
    Ok(bytes)
}

/// SHA-1 hash identifying a unique torrent.
///
/// Primary key for all torrent-scoped state. Travels as a 40-character
/// lowercase hex string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub const fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses an info hash from its hex representation.
    ///
    /// # Errors
    ///
    /// - `IdError::InvalidLength` - If the string is not 40 characters
    /// - `IdError::InvalidHex` - If the string contains non-hex characters
    pub fn from_hex(value: &str) -> Result<Self, IdError> {
        decode_hex_20("info hash", value).map(Self)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Content digest of the blob a torrent distributes.
///
/// Callers address torrents by digest; the info hash is derived from the
/// torrent metadata by the storage layer. Stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parses a hex-encoded digest.
    ///
    /// # Errors
    ///
    /// - `IdError::InvalidLength` - If the string is empty or has odd length
    /// - `IdError::InvalidHex` - If the string contains non-hex characters
    pub fn new(hex_value: &str) -> Result<Self, IdError> {
        if hex_value.is_empty() || hex_value.len() % 2 != 0 {
            return Err(IdError::InvalidLength {
                kind: "digest",
                expected: hex_value.len().max(2).next_multiple_of(2),
                actual: hex_value.len(),
            });
        }

        hex::decode(hex_value).map_err(|e| IdError::InvalidHex {
            kind: "digest",
            reason: e.to_string(),
        })?;
        Ok(Self(hex_value.to_ascii_lowercase()))
    }

    /// Creates a digest from raw hash bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Returns the hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only snapshot of a torrent as seen by the storage layer.
///
/// The bitfield is captured at the moment the snapshot is taken; handshakes
/// advertise whatever snapshot they are given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    name: String,
    info_hash: InfoHash,
    digest: Digest,
    bitfield: Bitfield,
}

impl TorrentInfo {
    /// Creates a torrent snapshot.
    pub fn new(
        name: impl Into<String>,
        info_hash: InfoHash,
        digest: Digest,
        bitfield: Bitfield,
    ) -> Self {
        Self {
            name: name.into(),
            info_hash,
            digest,
            bitfield,
        }
    }

    /// Display name of the torrent.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Local piece availability at snapshot time.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn piece_count(&self) -> u32 {
        self.bitfield.len()
    }

    /// Returns true if every piece is available locally.
    pub fn is_complete(&self) -> bool {
        self.bitfield.is_complete()
    }
}

impl fmt::Display for TorrentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "torrent({}, hash={}, {}/{} pieces)",
            self.name,
            self.info_hash,
            self.bitfield.count_set(),
            self.bitfield.len()
        )
    }
}
