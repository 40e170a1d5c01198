//! Payload transfer over a conn whose node is egress-throttled.

use std::time::{Duration, Instant};

use bytes::Bytes;
use shoal_core::NodeContext;
use shoal_core::config::{BandwidthConfig, ShoalConfig};
use shoal_core::conn::{ConnEvent, Direction, Handshaker, Message};
use shoal_core::torrent::{Bitfield, Digest, InfoHash, PeerId, TorrentInfo};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const KIB: u64 = 1024;

fn torrent(bitfield: Bitfield) -> TorrentInfo {
    TorrentInfo::new(
        "blob",
        InfoHash::new([4; 20]),
        Digest::new("c0ffee").unwrap(),
        bitfield,
    )
}

#[tokio::test]
async fn test_throttled_payloads_arrive_in_order() {
    let throttled = BandwidthConfig {
        enabled: true,
        egress_rate: 32 * KIB,
        egress_burst: 32 * KIB,
        ..BandwidthConfig::default()
    };
    let seeder_context = NodeContext::new(PeerId::new([1; 20]), &throttled);
    let leecher_context = NodeContext::new(PeerId::new([2; 20]), &BandwidthConfig::unlimited());

    let (seeder_tx, _seeder_events) = mpsc::channel(64);
    let (leecher_tx, mut leecher_events) = mpsc::channel(64);
    let config = ShoalConfig::for_testing().conn;
    let seeder = Handshaker::new(config.clone(), seeder_context.clone(), seeder_tx);
    let leecher = Handshaker::new(config, leecher_context, leecher_tx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seed = torrent(Bitfield::full(5));
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let pending = seeder.accept(stream).await.unwrap();
        seeder.establish(pending, &seed).await.unwrap()
    });

    let (_leecher_conn, _) = leecher
        .initialize(PeerId::new([1; 20]), addr, &torrent(Bitfield::new(5)), "")
        .await
        .unwrap();
    let seeder_conn = accept.await.unwrap();

    let piece = Bytes::from(vec![0xAB; 16 * KIB as usize]);
    let started = Instant::now();
    for index in 0..5 {
        seeder_conn
            .send(&Message::PiecePayload {
                index,
                offset: 0,
                data: piece.clone(),
            })
            .await
            .unwrap();
    }
    let elapsed = started.elapsed();

    // 80 KiB against a 32 KiB burst at 32 KiB/s needs at least 1.5s.
    assert!(
        elapsed >= Duration::from_millis(1200),
        "sends finished too quickly: {elapsed:?}"
    );
    assert!(seeder_context.bandwidth().reserved_bytes(Direction::Egress) >= 80 * KIB);

    for expected in 0..5 {
        let event = tokio::time::timeout(Duration::from_secs(5), leecher_events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ConnEvent::Message {
                message: Message::PiecePayload { index, data, .. },
                ..
            } => {
                assert_eq!(index, expected);
                assert_eq!(data.len(), 16 * KIB as usize);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
