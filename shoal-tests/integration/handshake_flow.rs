//! Handshakes between two handshakers over loopback TCP.

use std::time::Duration;

use shoal_core::NodeContext;
use shoal_core::config::{BandwidthConfig, ShoalConfig};
use shoal_core::conn::message::{read_message_with_timeout, send_message_with_timeout};
use shoal_core::conn::{ConnError, ConnEvent, HandshakeMessage, Handshaker, Message};
use shoal_core::torrent::{Bitfield, Digest, InfoHash, PeerId, TorrentInfo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const SEEDER: PeerId = PeerId::new([1; 20]);
const LEECHER: PeerId = PeerId::new([2; 20]);

fn handshaker(peer_id: PeerId) -> (Handshaker, mpsc::Receiver<ConnEvent>) {
    let (events, receiver) = mpsc::channel(64);
    let context = NodeContext::new(peer_id, &BandwidthConfig::unlimited());
    let handshaker = Handshaker::new(ShoalConfig::for_testing().conn, context, events);
    (handshaker, receiver)
}

fn torrent(bitfield: Bitfield) -> TorrentInfo {
    TorrentInfo::new(
        "layer.tar",
        InfoHash::new([7; 20]),
        Digest::new("beef").unwrap(),
        bitfield,
    )
}

async fn next_event(events: &mut mpsc::Receiver<ConnEvent>) -> ConnEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for conn event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_handshake_then_message_exchange() {
    let (server, mut server_events) = handshaker(SEEDER);
    let (client, mut client_events) = handshaker(LEECHER);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seed = torrent(Bitfield::full(8));
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let pending = server.accept(stream).await.unwrap();
        assert_eq!(pending.peer_id(), LEECHER);
        assert_eq!(pending.namespace(), "library/app");
        assert_eq!(pending.bitfield().count_set(), 0);
        server.establish(pending, &seed).await.unwrap()
    });

    let (client_conn, remote_bitfield) = client
        .initialize(SEEDER, addr, &torrent(Bitfield::new(8)), "library/app")
        .await
        .unwrap();
    let server_conn = accept.await.unwrap();

    assert!(remote_bitfield.is_complete());
    assert!(server_conn.opened_by_remote());
    assert!(!client_conn.opened_by_remote());
    assert_eq!(client_conn.peer_id(), SEEDER);
    assert_eq!(server_conn.peer_id(), LEECHER);

    let request = Message::PieceRequest {
        index: 3,
        offset: 0,
        length: 1024,
    };
    client_conn.send(&request).await.unwrap();
    server_conn
        .send(&Message::AnnouncePiece { index: 5 })
        .await
        .unwrap();

    match next_event(&mut server_events).await {
        ConnEvent::Message { key, message } => {
            assert_eq!(key, server_conn.key());
            assert_eq!(message, request);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut client_events).await {
        ConnEvent::Message { message, .. } => {
            assert_eq!(message, Message::AnnouncePiece { index: 5 });
        }
        other => panic!("unexpected event: {other:?}"),
    }

    client_conn.close().await;
    match next_event(&mut server_events).await {
        ConnEvent::Closed { key, reason } => {
            assert_eq!(key, server_conn.key());
            assert!(reason.is_none(), "clean close reported {reason:?}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_identity_is_rejected_by_dialer() {
    let (server, mut server_events) = handshaker(SEEDER);
    let (client, _client_events) = handshaker(LEECHER);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seed = torrent(Bitfield::full(4));
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let pending = server.accept(stream).await.unwrap();
        server.establish(pending, &seed).await.unwrap()
    });

    let impostor = PeerId::new([9; 20]);
    let result = client
        .initialize(impostor, addr, &torrent(Bitfield::new(4)), "")
        .await;

    match result {
        Err(ConnError::UnexpectedPeerIdentity { expected, actual }) => {
            assert_eq!(expected, impostor);
            assert_eq!(actual, SEEDER);
        }
        other => panic!("expected identity error, got {other:?}"),
    }

    // The acceptor's conn ends once the dialer hangs up.
    let server_conn = accept.await.unwrap();
    match next_event(&mut server_events).await {
        ConnEvent::Closed { key, .. } => assert_eq!(key, server_conn.key()),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_acceptor_reply_never_carries_namespace() {
    let (server, _server_events) = handshaker(SEEDER);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seed = torrent(Bitfield::full(4));
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let pending = server.accept(stream).await.unwrap();
        assert!(pending.handshake().has_namespace());
        server.establish(pending, &seed).await.unwrap()
    });

    let timeout = Duration::from_secs(1);
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let hello = HandshakeMessage::for_torrent(LEECHER, &torrent(Bitfield::new(4)), "team/ns");
    send_message_with_timeout(&mut stream, &hello.to_message(), timeout)
        .await
        .unwrap();

    let reply = read_message_with_timeout(&mut stream, timeout, 1024 * 1024)
        .await
        .unwrap();
    let reply = HandshakeMessage::from_message(reply).unwrap();

    assert_eq!(reply.peer_id, SEEDER);
    assert_eq!(reply.info_hash, InfoHash::new([7; 20]));
    assert!(!reply.has_namespace());
    assert!(reply.bitfield.is_complete());

    let _server_conn = accept.await.unwrap();
}

#[tokio::test]
async fn test_dialer_times_out_on_silent_acceptor() {
    let (client, _events) = handshaker(LEECHER);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Accept the socket but never reply.
    let hold = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(stream);
    });

    let result = client
        .initialize(SEEDER, addr, &torrent(Bitfield::new(4)), "")
        .await;
    assert!(matches!(result, Err(ConnError::ReadTimeout)), "{result:?}");

    hold.abort();
}
