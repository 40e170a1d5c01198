//! Handshake message and its mapping onto the wire `Bitfield` message.

use bytes::Bytes;

use super::ConnError;
use super::message::{Message, MessageCodec};
use crate::torrent::{Bitfield, InfoHash, PeerId, TorrentInfo};

/// First message exchanged on every connection.
///
/// Only the initiator fills in `namespace`; the acceptor always replies with
/// an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub peer_id: PeerId,
    pub name: String,
    pub info_hash: InfoHash,
    pub bitfield: Bitfield,
    pub namespace: String,
}

impl HandshakeMessage {
    /// Builds the handshake advertising `info` on behalf of `peer_id`.
    pub fn for_torrent(peer_id: PeerId, info: &TorrentInfo, namespace: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: info.name().to_string(),
            info_hash: info.info_hash(),
            bitfield: info.bitfield().clone(),
            namespace: namespace.into(),
        }
    }

    /// Converts to the wire message.
    pub fn to_message(&self) -> Message {
        Message::Bitfield {
            peer_id: self.peer_id.to_string(),
            name: self.name.clone(),
            info_hash: self.info_hash.to_string(),
            bitfield: Bytes::from(self.bitfield.to_bytes()),
            namespace: self.namespace.clone(),
        }
    }

    /// Parses a wire message into a handshake.
    ///
    /// Purely syntactic: identity and torrent checks belong to the handshaker.
    ///
    /// # Errors
    ///
    /// - `ConnError::MalformedMessage` - If the message is not a bitfield, or
    ///   its peer id, info hash or bitfield fails to parse
    pub fn from_message(message: Message) -> Result<Self, ConnError> {
        let kind = message.kind();
        let Message::Bitfield {
            peer_id,
            name,
            info_hash,
            bitfield,
            namespace,
        } = message
        else {
            return Err(ConnError::MalformedMessage {
                reason: format!("expected bitfield handshake, got {kind}"),
            });
        };

        Ok(Self {
            peer_id: peer_id.parse()?,
            name,
            info_hash: info_hash.parse()?,
            bitfield: Bitfield::from_bytes(&bitfield)?,
            namespace,
        })
    }

    /// Encodes to a complete wire frame.
    pub fn encode(&self) -> Vec<u8> {
        MessageCodec::serialize_message(&self.to_message())
    }

    /// Decodes from a complete wire frame.
    ///
    /// # Errors
    ///
    /// - `ConnError::MalformedMessage` - If the frame or its contents fail to parse
    pub fn decode(frame: &[u8]) -> Result<Self, ConnError> {
        Self::from_message(MessageCodec::deserialize_message(frame)?)
    }

    /// Returns true if the sender attached a namespace.
    pub fn has_namespace(&self) -> bool {
        !self.namespace.is_empty()
    }
}
