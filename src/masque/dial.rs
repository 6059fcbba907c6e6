//! Dial boundary between the adapter and the QUIC stack.
//!
//! The adapter never touches quinn directly; it hands a [`PacketSocket`]
//! and a client config to a [`TunnelDialer`] and gets back an [`IpFlow`].
//! The concrete [`DatagramDialer`] drives quinn over the supplied socket
//! through a channel bridge, so obfuscated (possibly delayed) sends happen
//! in order without blocking quinn's synchronous transmit path.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, Endpoint, EndpointConfig, UdpPoller};
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub use crate::obfuscate::socket::PacketSocket;

/// Context id prefixing each datagram: 0 carries an IP packet, 1 carries an
/// ICMP message from the relay.
pub const CONTEXT_ID_IP: u64 = 0;
pub const CONTEXT_ID_ICMP: u64 = 1;

/// Established IP flow through the relay.
#[async_trait]
pub trait IpFlow: Send + Sync {
    /// Next IP packet from the relay.
    async fn read_packet(&self) -> Result<Bytes>;
    /// Send an IP packet; any ICMP message the relay has queued comes back
    /// inline.
    async fn write_packet(&self, packet: &[u8]) -> Result<Option<Bytes>>;
    async fn close(&self) -> Result<()>;
}

pub struct DialOutcome {
    pub flow: Box<dyn IpFlow>,
    /// Status returned by the relay for the connect request.
    pub status: u16,
}

/// How the adapter reaches the relay. Tests substitute their own dialer;
/// production uses [`DatagramDialer`].
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(
        &self,
        config: quinn::ClientConfig,
        uri: &str,
        remote: SocketAddr,
        server_name: &str,
        socket: Arc<dyn PacketSocket>,
    ) -> Result<DialOutcome>;
}

/// Bounded check that the endpoint is reachable over UDP at all, before any
/// handshake cost is paid.
pub async fn probe_udp_reachability(remote: SocketAddr, timeout: Duration) -> Result<()> {
    let bind: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = tokio::net::UdpSocket::bind(bind)
        .await
        .context("binding UDP probe socket")?;
    tokio::time::timeout(timeout, socket.connect(remote))
        .await
        .map_err(|_| anyhow::anyhow!("UDP probe to {remote} timed out"))?
        .with_context(|| format!("endpoint {remote} is not reachable over UDP"))?;
    Ok(())
}

// --- QUIC varint, RFC 9000 §16 ---

pub fn encode_varint(value: u64, out: &mut BytesMut) {
    match value {
        0..=0x3f => out.extend_from_slice(&[value as u8]),
        0x40..=0x3fff => out.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes()),
        0x4000..=0x3fff_ffff => {
            out.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes())
        }
        _ => out.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes()),
    }
}

pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1 << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for byte in &buf[1..len] {
        value = (value << 8) | u64::from(*byte);
    }
    Some((value, len))
}

// --- quinn over a PacketSocket ---

/// Implements quinn's socket trait on top of a [`PacketSocket`].
///
/// quinn's transmit hook is synchronous while obfuscated sends are async
/// and may sleep, so transmits are queued to a pump task that performs the
/// sends strictly in order. Inbound datagrams flow through a second pump
/// into `poll_recv`.
pub struct BridgedSocket {
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    inbound: std::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl BridgedSocket {
    pub fn new(socket: Arc<dyn PacketSocket>) -> Result<Self> {
        let local_addr = socket.local_addr()?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(Vec<u8>, SocketAddr)>();
        let out_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            while let Some((packet, dest)) = outbound_rx.recv().await {
                if let Err(err) = out_socket.send_to(&packet, dest).await {
                    warn!(%dest, error = %err, "outbound send failed");
                }
            }
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        if inbound_tx.send((buf[..n].to_vec(), from)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "inbound receive failed, stopping pump");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            outbound: outbound_tx,
            inbound: std::sync::Mutex::new(inbound_rx),
        })
    }
}

impl std::fmt::Debug for BridgedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedSocket")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct AlwaysWritable;

impl UdpPoller for AlwaysWritable {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        // The pump queue is unbounded; transmits are never backpressured.
        Poll::Ready(Ok(()))
    }
}

impl AsyncUdpSocket for BridgedSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(AlwaysWritable)
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.outbound
            .send((transmit.contents.to_vec(), transmit.destination))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "send pump gone"))
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut inbound = match self.inbound.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "inbound queue poisoned",
                )))
            }
        };
        match inbound.poll_recv(cx) {
            Poll::Ready(Some((packet, from))) => {
                let buf = &mut bufs[0];
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                meta[0] = RecvMeta {
                    addr: from,
                    len,
                    stride: len,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "receive pump gone",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

// --- the concrete dialer ---

/// Dials the relay and speaks the datagram capsule protocol: a one-shot
/// connect request on a bidirectional stream, then IP packets as context-id
/// framed QUIC datagrams.
pub struct DatagramDialer;

#[async_trait]
impl TunnelDialer for DatagramDialer {
    async fn dial(
        &self,
        config: quinn::ClientConfig,
        uri: &str,
        remote: SocketAddr,
        server_name: &str,
        socket: Arc<dyn PacketSocket>,
    ) -> Result<DialOutcome> {
        let bridge = Arc::new(BridgedSocket::new(socket)?);
        let mut endpoint = Endpoint::new_with_abstract_socket(
            EndpointConfig::default(),
            None,
            bridge,
            Arc::new(quinn::TokioRuntime),
        )
        .context("creating QUIC endpoint")?;
        endpoint.set_default_client_config(config);

        let connection = endpoint
            .connect(remote, server_name)
            .context("initiating QUIC connection")?
            .await
            .context("QUIC handshake failed")?;
        debug!(%remote, "QUIC connection established");

        let status = connect_request(&connection, uri).await?;
        let flow = CapsuleFlow::new(endpoint, connection);
        Ok(DialOutcome {
            flow: Box::new(flow),
            status,
        })
    }
}

/// Send the connect URI as a length-prefixed request and read the two-byte
/// status the relay answers with.
async fn connect_request(connection: &quinn::Connection, uri: &str) -> Result<u16> {
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .context("opening connect stream")?;

    if uri.len() > u16::MAX as usize {
        bail!("connect URI too long");
    }
    let mut request = BytesMut::with_capacity(2 + uri.len());
    request.extend_from_slice(&(uri.len() as u16).to_be_bytes());
    request.extend_from_slice(uri.as_bytes());
    send.write_all(&request).await.context("sending connect request")?;
    send.finish()?;

    let mut status = [0u8; 2];
    recv.read_exact(&mut status)
        .await
        .context("reading connect status")?;
    Ok(u16::from_be_bytes(status))
}

/// [`IpFlow`] over QUIC datagrams with context-id capsule framing.
///
/// ICMP capsules observed by the read side are stashed and surfaced on the
/// next `write_packet`, so the writer direction can deliver them without a
/// second read loop.
pub struct CapsuleFlow {
    // Kept alive for the lifetime of the flow; dropping it kills the
    // connection.
    endpoint: Endpoint,
    connection: quinn::Connection,
    icmp_tx: mpsc::UnboundedSender<Bytes>,
    icmp_rx: std::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl CapsuleFlow {
    fn new(endpoint: Endpoint, connection: quinn::Connection) -> Self {
        let (icmp_tx, icmp_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            connection,
            icmp_tx,
            icmp_rx: std::sync::Mutex::new(icmp_rx),
        }
    }

    fn pending_icmp(&self) -> Option<Bytes> {
        self.icmp_rx.lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl IpFlow for CapsuleFlow {
    async fn read_packet(&self) -> Result<Bytes> {
        loop {
            let datagram = self
                .connection
                .read_datagram()
                .await
                .context("tunnel connection closed")?;
            let Some((context_id, prefix)) = decode_varint(&datagram) else {
                trace!(len = datagram.len(), "dropping unframed datagram");
                continue;
            };
            let payload = datagram.slice(prefix..);
            match context_id {
                CONTEXT_ID_IP => return Ok(payload),
                CONTEXT_ID_ICMP => {
                    let _ = self.icmp_tx.send(payload);
                }
                other => trace!(context_id = other, "ignoring unknown capsule context"),
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<Option<Bytes>> {
        let mut framed = BytesMut::with_capacity(packet.len() + 1);
        encode_varint(CONTEXT_ID_IP, &mut framed);
        framed.extend_from_slice(packet);
        self.connection
            .send_datagram(framed.freeze())
            .context("sending tunnel datagram")?;
        Ok(self.pending_icmp())
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(0u32.into(), b"closing");
        self.endpoint.wait_idle().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_encoding_matches_known_vectors() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (37, &[0x25]),
            (15293, &[0x7b, 0xbd]),
            (494_878_333, &[0x9d, 0x7f, 0x3e, 0x7d]),
            (
                151_288_809_941_952_652,
                &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c],
            ),
        ];
        for (value, encoded) in cases {
            let mut out = BytesMut::new();
            encode_varint(*value, &mut out);
            assert_eq!(&out[..], *encoded, "encoding {value}");
            assert_eq!(decode_varint(encoded), Some((*value, encoded.len())));
        }
    }

    #[test]
    fn varint_decoding_rejects_truncation() {
        assert_eq!(decode_varint(&[]), None);
        assert_eq!(decode_varint(&[0x7b]), None);
        assert_eq!(decode_varint(&[0xc2, 0x19]), None);
    }

    #[tokio::test]
    async fn bridged_socket_forwards_both_directions() {
        let inner = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let bridge = Arc::new(
            BridgedSocket::new(inner.clone() as Arc<dyn PacketSocket>).unwrap(),
        );
        assert_eq!(
            AsyncUdpSocket::local_addr(&*bridge).unwrap(),
            inner.local_addr().unwrap()
        );

        let transmit = Transmit {
            destination: peer_addr,
            ecn: None,
            contents: b"ping",
            segment_size: None,
            src_ip: None,
        };
        bridge.try_send(&transmit).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).await.unwrap();
        let mut storage = [0u8; 64];
        let mut meta = [RecvMeta::default()];
        let received = std::future::poll_fn(|cx| {
            let mut bufs = [IoSliceMut::new(&mut storage)];
            bridge.poll_recv(cx, &mut bufs, &mut meta)
        })
        .await
        .unwrap();
        assert_eq!(received, 1);
        assert_eq!(meta[0].len, 4);
        assert_eq!(meta[0].addr, peer_addr);
        assert_eq!(&storage[..4], b"pong");
    }

    #[tokio::test]
    async fn udp_probe_succeeds_against_local_listener() {
        let listener = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe_udp_reachability(listener.local_addr().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
    }
}
