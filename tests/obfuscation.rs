//! End-to-end obfuscation behavior over real localhost sockets.

use std::sync::Arc;
use std::time::Duration;

use mirage::obfuscate::socket::{ObfuscatedSocket, PacketSocket};
use mirage::obfuscate::{ObfuscationConfig, ObfuscationEngine};
use tokio::net::UdpSocket;

fn quic_initial(len: usize) -> Vec<u8> {
    let mut p = vec![0u8; len];
    p[0] = 0b1100_0000;
    p
}

fn quic_one_rtt(len: usize) -> Vec<u8> {
    let mut p = vec![0u8; len];
    p[0] = 0b0100_0000;
    p
}

async fn obfuscated_pair(
    config: ObfuscationConfig,
) -> (ObfuscatedSocket, UdpSocket, std::net::SocketAddr) {
    let inner = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let engine = Arc::new(ObfuscationEngine::new(config));
    let socket = ObfuscatedSocket::new(inner, engine);
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest = receiver.local_addr().unwrap();
    (socket, receiver, dest)
}

async fn drain(receiver: &UdpSocket, count: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(count);
    let mut buf = vec![0u8; 4096];
    for _ in 0..count {
        let n = tokio::time::timeout(Duration::from_secs(3), receiver.recv(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        out.push(buf[..n].to_vec());
    }
    out
}

#[tokio::test]
async fn full_handshake_sequence_over_udp() {
    let config = ObfuscationConfig {
        i1: "<b 474554202f20485454502f312e31>".into(),
        jc_before_hs: 2,
        jc_after_i1: 1,
        jc_after_hs: 1,
        jmin: 50,
        jmax: 60,
        padding_min: 4,
        padding_max: 8,
        ..ObfuscationConfig::default()
    };
    let (socket, receiver, dest) = obfuscated_pair(config).await;

    // First Initial: 2 junk, the signature, 1 junk, then the packet itself.
    let initial = quic_initial(120);
    socket.send_to(&initial, dest).await.unwrap();
    let got = drain(&receiver, 5).await;

    for junk in [&got[0], &got[1], &got[3]] {
        assert!(
            (50..=60).contains(&junk.len()),
            "junk size {} outside configured bounds",
            junk.len()
        );
    }
    assert_eq!(got[2], b"GET / HTTP/1.1");
    assert!(got[4].len() >= initial.len() + 4 && got[4].len() <= initial.len() + 8);
    assert_eq!(&got[4][..initial.len()], &initial[..]);

    // Duplicate Initials never replay the sequence.
    for _ in 0..3 {
        socket.send_to(&initial, dest).await.unwrap();
    }
    let repeats = drain(&receiver, 3).await;
    for pkt in &repeats {
        assert_eq!(&pkt[..initial.len()], &initial[..]);
    }

    // First short-header packet triggers the trailing junk, once.
    let data = quic_one_rtt(200);
    socket.send_to(&data, dest).await.unwrap();
    let got = drain(&receiver, 2).await;
    assert!((50..=60).contains(&got[0].len()));
    assert_eq!(&got[1][..data.len()], &data[..]);

    socket.send_to(&data, dest).await.unwrap();
    let got = drain(&receiver, 1).await;
    assert_eq!(&got[0][..data.len()], &data[..]);
}

#[tokio::test]
async fn noop_config_is_byte_transparent() {
    let (socket, receiver, dest) = obfuscated_pair(ObfuscationConfig::default()).await;

    for len in [21, 200, 1200] {
        let packet = quic_initial(len);
        socket.send_to(&packet, dest).await.unwrap();
        let got = drain(&receiver, 1).await;
        assert_eq!(got[0], packet);
    }
}

#[tokio::test]
async fn padded_packets_stay_under_mtu_budget() {
    let config = ObfuscationConfig {
        padding_min: 100,
        padding_max: 300,
        random_padding: true,
        ..ObfuscationConfig::default()
    };
    let (socket, receiver, dest) = obfuscated_pair(config).await;

    for len in [100, 1000, 1150, 1199] {
        let packet = quic_one_rtt(len);
        socket.send_to(&packet, dest).await.unwrap();
        let got = drain(&receiver, 1).await;
        assert!(got[0].len() <= 1200, "padded to {} bytes", got[0].len());
        assert!(got[0].len() >= len);
    }
}

#[tokio::test]
async fn mimicked_traffic_carries_protocol_header() {
    // Mimicry alone does not defeat the no-op bypass; the junk count keeps
    // the engine engaged without emitting decoys for a short-header packet.
    let config = ObfuscationConfig {
        mimic_protocol: "stun".into(),
        jc_before_hs: 1,
        ..ObfuscationConfig::default()
    };
    let (socket, receiver, dest) = obfuscated_pair(config).await;

    let packet = quic_one_rtt(64);
    socket.send_to(&packet, dest).await.unwrap();
    let got = drain(&receiver, 1).await;
    assert_eq!(got[0].len(), packet.len() + 20);
    assert_eq!(&got[0][4..8], &0x2112_A442u32.to_be_bytes());
    assert_eq!(&got[0][20..], &packet[..]);
}

#[tokio::test]
async fn mimic_alone_keeps_the_bypass() {
    // With every count and size at zero the config is a no-op even when a
    // mimic protocol is named, so packets pass through untouched.
    let config = ObfuscationConfig {
        mimic_protocol: "stun".into(),
        ..ObfuscationConfig::default()
    };
    assert!(config.is_noop());
    let (socket, receiver, dest) = obfuscated_pair(config).await;

    let packet = quic_one_rtt(64);
    socket.send_to(&packet, dest).await.unwrap();
    let got = drain(&receiver, 1).await;
    assert_eq!(got[0], packet);
}
