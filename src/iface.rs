//! Virtual network interface seam.
//!
//! The crate does not implement a TUN device; whatever feeds IP packets in
//! and accepts them back implements this trait. [`ChannelInterface`] is the
//! in-memory implementation used by the self-test path and the tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait TunInterface: Send + Sync {
    /// Read one IP packet into `buf`, returning its length.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;
    /// Deliver one IP packet to the interface.
    async fn write_packet(&self, packet: &[u8]) -> Result<()>;
}

/// Channel-backed interface: packets pushed through the handle come out of
/// `read_packet`, packets written land in the handle's outbound queue.
pub struct ChannelInterface {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

/// Driver side of a [`ChannelInterface`].
pub struct ChannelInterfaceHandle {
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelInterface {
    pub fn pair() -> (Self, ChannelInterfaceHandle) {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: tokio::sync::Mutex::new(inject_rx),
                outgoing: written_tx,
            },
            ChannelInterfaceHandle {
                inject: inject_tx,
                written: tokio::sync::Mutex::new(written_rx),
            },
        )
    }
}

#[async_trait]
impl TunInterface for ChannelInterface {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(packet) => {
                if packet.len() > buf.len() {
                    bail!("packet of {} bytes exceeds read buffer", packet.len());
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => bail!("interface closed"),
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        if self.outgoing.send(packet.to_vec()).is_err() {
            bail!("interface closed");
        }
        Ok(())
    }
}

impl ChannelInterfaceHandle {
    /// Push a packet for the forwarding loops to pick up.
    pub fn inject(&self, packet: &[u8]) -> Result<()> {
        if self.inject.send(packet.to_vec()).is_err() {
            bail!("interface closed");
        }
        Ok(())
    }

    /// Next packet the loops delivered to the interface.
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.written.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_flow_both_ways() {
        let (iface, handle) = ChannelInterface::pair();

        handle.inject(b"abc").unwrap();
        let mut buf = [0u8; 16];
        let n = iface.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        iface.write_packet(b"def").await.unwrap();
        assert_eq!(handle.next_written().await.unwrap(), b"def");
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected() {
        let (iface, handle) = ChannelInterface::pair();
        handle.inject(&[0u8; 32]).unwrap();
        let mut buf = [0u8; 8];
        assert!(iface.read_packet(&mut buf).await.is_err());
    }
}
