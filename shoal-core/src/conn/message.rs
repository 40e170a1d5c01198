//! Wire message framing, serialization and timed frame I/O.
//!
//! Every message travels as a frame: a big-endian `u32` body length followed
//! by the body. The body starts with a one-byte message type. Strings and
//! blobs are prefixed with a big-endian `u32` length.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ConnError;

const MSG_BITFIELD: u8 = 1;
const MSG_PIECE_REQUEST: u8 = 2;
const MSG_PIECE_PAYLOAD: u8 = 3;
const MSG_ANNOUNCE_PIECE: u8 = 4;
const MSG_CANCEL_PIECE: u8 = 5;
const MSG_ERROR: u8 = 6;
const MSG_COMPLETE: u8 = 7;

/// Size of the frame length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Messages exchanged between peers.
///
/// `Bitfield` doubles as the handshake; ids and hashes travel as hex strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Bitfield {
        peer_id: String,
        name: String,
        info_hash: String,
        bitfield: Bytes,
        namespace: String,
    },
    PieceRequest {
        index: u32,
        offset: u32,
        length: u32,
    },
    PiecePayload {
        index: u32,
        offset: u32,
        data: Bytes,
    },
    AnnouncePiece {
        index: u32,
    },
    CancelPiece {
        index: u32,
    },
    Error {
        index: u32,
        code: u8,
        message: String,
    },
    Complete,
}

impl Message {
    /// Short name of the message type for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Bitfield { .. } => "bitfield",
            Message::PieceRequest { .. } => "piece_request",
            Message::PiecePayload { .. } => "piece_payload",
            Message::AnnouncePiece { .. } => "announce_piece",
            Message::CancelPiece { .. } => "cancel_piece",
            Message::Error { .. } => "error",
            Message::Complete => "complete",
        }
    }
}

/// Message serialization utilities for the peer wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message into a complete frame, length prefix included.
    pub fn serialize_message(message: &Message) -> Vec<u8> {
        let body = Self::serialize_body(message);
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
        buf
    }

    /// Serializes a message body without the length prefix.
    pub fn serialize_body(message: &Message) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            Message::Bitfield {
                peer_id,
                name,
                info_hash,
                bitfield,
                namespace,
            } => {
                buf.put_u8(MSG_BITFIELD);
                put_blob(&mut buf, peer_id.as_bytes());
                put_blob(&mut buf, name.as_bytes());
                put_blob(&mut buf, info_hash.as_bytes());
                put_blob(&mut buf, bitfield);
                put_blob(&mut buf, namespace.as_bytes());
            }
            Message::PieceRequest {
                index,
                offset,
                length,
            } => {
                buf.put_u8(MSG_PIECE_REQUEST);
                buf.put_u32(*index);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::PiecePayload {
                index,
                offset,
                data,
            } => {
                buf.put_u8(MSG_PIECE_PAYLOAD);
                buf.put_u32(*index);
                buf.put_u32(*offset);
                put_blob(&mut buf, data);
            }
            Message::AnnouncePiece { index } => {
                buf.put_u8(MSG_ANNOUNCE_PIECE);
                buf.put_u32(*index);
            }
            Message::CancelPiece { index } => {
                buf.put_u8(MSG_CANCEL_PIECE);
                buf.put_u32(*index);
            }
            Message::Error {
                index,
                code,
                message,
            } => {
                buf.put_u8(MSG_ERROR);
                buf.put_u32(*index);
                buf.put_u8(*code);
                put_blob(&mut buf, message.as_bytes());
            }
            Message::Complete => {
                buf.put_u8(MSG_COMPLETE);
            }
        }

        buf
    }

    /// Deserializes a complete frame, length prefix included.
    ///
    /// # Errors
    ///
    /// - `ConnError::MalformedMessage` - If the frame is truncated, carries
    ///   extra bytes or its body does not decode
    pub fn deserialize_message(data: &[u8]) -> Result<Message, ConnError> {
        let Some((header, body)) = data.split_first_chunk::<FRAME_HEADER_LEN>() else {
            return Err(malformed("frame shorter than length prefix"));
        };

        let length = u32::from_be_bytes(*header) as usize;
        if body.len() != length {
            return Err(malformed(format!(
                "frame declares {length} bytes, carries {}",
                body.len()
            )));
        }

        Self::deserialize_body(body)
    }

    /// Deserializes a frame body.
    ///
    /// # Errors
    ///
    /// - `ConnError::MalformedMessage` - If the body is empty, truncated, has
    ///   trailing bytes, invalid UTF-8 or an unknown message type
    pub fn deserialize_body(body: &[u8]) -> Result<Message, ConnError> {
        let mut reader = BodyReader::new(body);
        let message_type = reader.get_u8()?;

        let message = match message_type {
            MSG_BITFIELD => Message::Bitfield {
                peer_id: reader.get_string("peer id")?,
                name: reader.get_string("name")?,
                info_hash: reader.get_string("info hash")?,
                bitfield: reader.get_blob()?,
                namespace: reader.get_string("namespace")?,
            },
            MSG_PIECE_REQUEST => Message::PieceRequest {
                index: reader.get_u32()?,
                offset: reader.get_u32()?,
                length: reader.get_u32()?,
            },
            MSG_PIECE_PAYLOAD => Message::PiecePayload {
                index: reader.get_u32()?,
                offset: reader.get_u32()?,
                data: reader.get_blob()?,
            },
            MSG_ANNOUNCE_PIECE => Message::AnnouncePiece {
                index: reader.get_u32()?,
            },
            MSG_CANCEL_PIECE => Message::CancelPiece {
                index: reader.get_u32()?,
            },
            MSG_ERROR => Message::Error {
                index: reader.get_u32()?,
                code: reader.get_u8()?,
                message: reader.get_string("error message")?,
            },
            MSG_COMPLETE => Message::Complete,
            other => return Err(malformed(format!("unknown message type {other}"))),
        };

        reader.finish()?;
        Ok(message)
    }
}

fn put_blob(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
}

fn malformed(reason: impl Into<String>) -> ConnError {
    ConnError::MalformedMessage {
        reason: reason.into(),
    }
}

/// Bounds-checked cursor over a frame body.
struct BodyReader<'a> {
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<(), ConnError> {
        if self.buf.remaining() < needed {
            return Err(malformed(format!(
                "truncated body: need {needed} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8, ConnError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn get_u32(&mut self) -> Result<u32, ConnError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn get_blob(&mut self) -> Result<Bytes, ConnError> {
        let length = self.get_u32()? as usize;
        self.ensure(length)?;
        Ok(self.buf.copy_to_bytes(length))
    }

    fn get_string(&mut self, field: &str) -> Result<String, ConnError> {
        let raw = self.get_blob()?;
        String::from_utf8(raw.to_vec()).map_err(|_| malformed(format!("{field} is not UTF-8")))
    }

    fn finish(self) -> Result<(), ConnError> {
        if self.buf.has_remaining() {
            return Err(malformed(format!(
                "{} trailing bytes after message",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Writes a serialized frame and flushes it.
///
/// # Errors
///
/// - `ConnError::Io` - If the write fails
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), ConnError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a frame length prefix.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte. Oversized frames are rejected before any body byte is read.
///
/// # Errors
///
/// - `ConnError::MalformedMessage` - If the frame exceeds `max_frame_size`
/// - `ConnError::Io` - If the stream fails or ends inside the header
pub async fn read_frame_len<R>(reader: &mut R, max_frame_size: u32) -> Result<Option<u32>, ConnError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ConnError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside frame header",
            )));
        }
        filled += read;
    }

    let length = u32::from_be_bytes(header);
    if length > max_frame_size {
        return Err(malformed(format!(
            "frame of {length} bytes exceeds limit of {max_frame_size}"
        )));
    }
    Ok(Some(length))
}

/// Reads a frame body of known length.
///
/// # Errors
///
/// - `ConnError::Io` - If the stream fails or ends early
pub async fn read_frame_body<R>(reader: &mut R, length: u32) -> Result<Vec<u8>, ConnError>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Sends one message, bounded by `timeout`.
///
/// # Errors
///
/// - `ConnError::SendTimeout` - If the write does not finish in time
/// - `ConnError::Io` - If the write fails
pub async fn send_message_with_timeout<W>(
    writer: &mut W,
    message: &Message,
    timeout: Duration,
) -> Result<(), ConnError>
where
    W: AsyncWrite + Unpin,
{
    let frame = MessageCodec::serialize_message(message);
    tokio::time::timeout(timeout, write_frame(writer, &frame))
        .await
        .map_err(|_| ConnError::SendTimeout)?
}

/// Reads one message, bounded by `timeout`.
///
/// # Errors
///
/// - `ConnError::ReadTimeout` - If no complete frame arrives in time
/// - `ConnError::MalformedMessage` - If the frame is oversized or undecodable
/// - `ConnError::Io` - If the stream fails or closes
pub async fn read_message_with_timeout<R>(
    reader: &mut R,
    timeout: Duration,
    max_frame_size: u32,
) -> Result<Message, ConnError>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let Some(length) = read_frame_len(reader, max_frame_size).await? else {
            return Err(ConnError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed before message",
            )));
        };
        let body = read_frame_body(reader, length).await?;
        MessageCodec::deserialize_body(&body)
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| ConnError::ReadTimeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Bitfield {
                peer_id: "ab".repeat(20),
                name: "layer.tar".to_string(),
                info_hash: "cd".repeat(20),
                bitfield: Bytes::from_static(&[0, 0, 0, 3, 0b1010_0000]),
                namespace: "library/ubuntu".to_string(),
            },
            Message::PieceRequest {
                index: 7,
                offset: 0,
                length: 16384,
            },
            Message::PiecePayload {
                index: 7,
                offset: 16384,
                data: Bytes::from(vec![0x55u8; 64]),
            },
            Message::AnnouncePiece { index: 3 },
            Message::CancelPiece { index: 3 },
            Message::Error {
                index: 9,
                code: 2,
                message: "piece unavailable".to_string(),
            },
            Message::Complete,
        ]
    }

    #[test]
    fn test_message_serialization() {
        for original in sample_messages() {
            let frame = MessageCodec::serialize_message(&original);
            let decoded = MessageCodec::deserialize_message(&frame).unwrap();
            assert_eq!(original, decoded, "{} did not survive", original.kind());
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = MessageCodec::serialize_message(&Message::AnnouncePiece { index: 258 });
        assert_eq!(frame, vec![0, 0, 0, 5, MSG_ANNOUNCE_PIECE, 0, 0, 1, 2]);

        let frame = MessageCodec::serialize_message(&Message::Complete);
        assert_eq!(frame, vec![0, 0, 0, 1, MSG_COMPLETE]);
    }

    #[test]
    fn test_unknown_message_type_is_malformed() {
        let result = MessageCodec::deserialize_body(&[42]);
        assert!(matches!(result, Err(ConnError::MalformedMessage { .. })));
    }

    #[test]
    fn test_empty_body_is_malformed() {
        let result = MessageCodec::deserialize_body(&[]);
        assert!(matches!(result, Err(ConnError::MalformedMessage { .. })));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut body = MessageCodec::serialize_body(&Message::CancelPiece { index: 1 });
        body.push(0);
        let result = MessageCodec::deserialize_body(&body);
        assert!(matches!(result, Err(ConnError::MalformedMessage { reason }) if reason.contains("trailing")));
    }

    #[test]
    fn test_truncated_blob_is_malformed() {
        let mut body = vec![MSG_PIECE_PAYLOAD];
        body.put_u32(0);
        body.put_u32(0);
        body.put_u32(100); // declares 100 bytes
        body.extend_from_slice(&[1, 2, 3]);

        let result = MessageCodec::deserialize_body(&body);
        assert!(matches!(result, Err(ConnError::MalformedMessage { .. })));
    }

    #[test]
    fn test_frame_length_mismatch_is_malformed() {
        let mut frame = MessageCodec::serialize_message(&Message::Complete);
        frame[3] = 9;
        assert!(MessageCodec::deserialize_message(&frame).is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&1024u32.to_be_bytes()).await.unwrap();

        let result = read_frame_len(&mut server, 512).await;
        assert!(matches!(result, Err(ConnError::MalformedMessage { .. })));
    }

    #[tokio::test]
    async fn test_clean_eof_before_header() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let result = read_frame_len(&mut server, 512).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_timed_round_trip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = Message::PieceRequest {
            index: 1,
            offset: 2,
            length: 3,
        };

        send_message_with_timeout(&mut client, &message, Duration::from_secs(1))
            .await
            .unwrap();
        let received = read_message_with_timeout(&mut server, Duration::from_secs(1), 1024)
            .await
            .unwrap();

        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_read_times_out_on_silent_peer() {
        let (_client, mut server) = tokio::io::duplex(64);

        let result = read_message_with_timeout(&mut server, Duration::from_millis(50), 1024).await;
        assert!(matches!(result, Err(ConnError::ReadTimeout)));
    }
}
