//! Peer identity

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha1::{Digest as _, Sha1};

use super::{IdError, decode_hex_20};

/// Client prefix stamped onto randomly generated peer ids.
const CLIENT_PREFIX: &[u8; 8] = b"-SH0001-";

/// Peer identifier.
///
/// 20 opaque bytes, unique per running instance and immutable once generated
/// at process start. Encoded as a 40-character hex string in handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub const fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a random peer ID carrying the Shoal client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }

    /// Derives a stable peer ID from the address a host announces on.
    ///
    /// Hosts that restart on the same address keep their identity.
    pub fn from_address(addr: SocketAddr) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(addr.to_string().as_bytes());
        let mut id = [0u8; 20];
        id.copy_from_slice(&hasher.finalize());
        Self(id)
    }

    /// Parses a peer ID from its hex representation.
    ///
    /// # Errors
    ///
    /// - `IdError::InvalidLength` - If the string is not 40 characters
    /// - `IdError::InvalidHex` - If the string contains non-hex characters
    pub fn from_hex(value: &str) -> Result<Self, IdError> {
        decode_hex_20("peer id", value).map(Self)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate();
        assert_eq!(&peer_id.as_bytes()[..8], CLIENT_PREFIX);

        let other = PeerId::generate();
        assert_ne!(peer_id, other);
    }

    #[test]
    fn test_peer_id_from_address_is_stable() {
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        assert_eq!(PeerId::from_address(addr), PeerId::from_address(addr));

        let other: SocketAddr = "10.0.0.1:6882".parse().unwrap();
        assert_ne!(PeerId::from_address(addr), PeerId::from_address(other));
    }

    #[test]
    fn test_peer_id_hex_round_trip() {
        let peer_id = PeerId::new([0xab; 20]);
        let encoded = peer_id.to_string();
        assert_eq!(encoded, "ab".repeat(20));
        assert_eq!(encoded.parse::<PeerId>(), Ok(peer_id));
    }

    #[test]
    fn test_peer_id_rejects_short_input() {
        let result = PeerId::from_hex("-SH0001-");
        assert!(matches!(
            result,
            Err(IdError::InvalidLength {
                kind: "peer id",
                ..
            })
        ));
    }
}
