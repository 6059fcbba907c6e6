//! UDP socket decorator that routes sends through the obfuscation engine.

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use super::ObfuscationEngine;

/// Outer datagram transport the tunnel runs over. Abstracted so the QUIC
/// layer cannot tell an obfuscated socket from a plain one, and so tests
/// can substitute in-memory channels.
#[async_trait]
pub trait PacketSocket: Send + Sync + 'static {
    async fn send_to(&self, packet: &[u8], dest: SocketAddr) -> Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> Result<SocketAddr>;
}

#[async_trait]
impl PacketSocket for UdpSocket {
    async fn send_to(&self, packet: &[u8], dest: SocketAddr) -> Result<()> {
        UdpSocket::send_to(self, packet, dest).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}

/// [`PacketSocket`] that applies the obfuscation engine on the way out.
///
/// Inbound traffic passes straight through. When the active config is a
/// no-op the engine is skipped entirely, so an all-zero config costs
/// nothing over a bare socket.
pub struct ObfuscatedSocket {
    socket: Arc<UdpSocket>,
    engine: Arc<ObfuscationEngine>,
}

impl ObfuscatedSocket {
    pub fn new(socket: Arc<UdpSocket>, engine: Arc<ObfuscationEngine>) -> Self {
        Self { socket, engine }
    }

    pub fn engine(&self) -> &Arc<ObfuscationEngine> {
        &self.engine
    }
}

#[async_trait]
impl PacketSocket for ObfuscatedSocket {
    async fn send_to(&self, packet: &[u8], dest: SocketAddr) -> Result<()> {
        // Checked per send: the config may be swapped at runtime.
        if self.engine.config().is_noop() {
            self.socket.send_to(packet, dest).await?;
            return Ok(());
        }
        self.engine.send(&self.socket, packet, dest).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscate::ObfuscationConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn noop_config_bypasses_engine() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let engine = Arc::new(ObfuscationEngine::new(ObfuscationConfig::default()));
        let obf = ObfuscatedSocket::new(socket, engine);

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        // An Initial through a no-op config must arrive alone and verbatim.
        let mut packet = vec![0u8; 48];
        packet[0] = 0b1100_0000;
        obf.send_to(&packet, dest).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &packet[..]);
    }

    #[tokio::test]
    async fn live_config_swap_takes_effect_without_rebind() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let engine = Arc::new(ObfuscationEngine::new(ObfuscationConfig::default()));
        let obf = ObfuscatedSocket::new(socket, engine);

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();
        let mut buf = [0u8; 2048];

        let mut packet = vec![0u8; 48];
        packet[0] = 0b0100_0000;
        obf.send_to(&packet, dest).await.unwrap();
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 48);

        obf.engine().update_config(ObfuscationConfig {
            padding_min: 10,
            padding_max: 10,
            ..ObfuscationConfig::default()
        });
        obf.send_to(&packet, dest).await.unwrap();
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 58, "swapped-in padding must apply to the next send");
    }
}
