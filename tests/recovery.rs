//! Supervisor recovery: a broken tunnel is rebuilt through the factory and
//! forwarding resumes without restarting the loops.

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use mirage::forward::{self, AdapterFactory, TunnelSession};
use mirage::iface::ChannelInterface;
use mirage::masque::dial::IpFlow;
use mirage::masque::MasqueAdapter;

/// Flow that either works (recording writes) or fails every call the way a
/// dead connection does.
struct ScriptedFlow {
    healthy: bool,
    written: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ScriptedFlow {
    fn broken() -> Self {
        Self {
            healthy: false,
            written: None,
        }
    }

    fn healthy(written: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            healthy: true,
            written: Some(written),
        }
    }
}

#[async_trait]
impl IpFlow for ScriptedFlow {
    async fn read_packet(&self) -> Result<Bytes> {
        if self.healthy {
            // A quiet but live tunnel.
            std::future::pending::<()>().await;
            unreachable!()
        }
        bail!("use of closed network connection")
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<Option<Bytes>> {
        if self.healthy {
            if let Some(written) = &self.written {
                let _ = written.send(packet.to_vec());
            }
            return Ok(None);
        }
        bail!("use of closed network connection")
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Fails the first `failures` create calls, then hands out healthy
/// adapters.
struct FlakyFactory {
    failures: u32,
    attempts: Arc<AtomicU32>,
    written: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl AdapterFactory for FlakyFactory {
    async fn create(&self) -> Result<MasqueAdapter> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            bail!("relay handshake failed");
        }
        Ok(MasqueAdapter::from_parts(
            Box::new(ScriptedFlow::healthy(self.written.clone())),
            "172.16.0.2".into(),
            String::new(),
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn factory_failures_are_retried_until_recovery() {
    let (written_tx, mut written_rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicU32::new(0));
    let factory = FlakyFactory {
        failures: 2,
        attempts: Arc::clone(&attempts),
        written: written_tx,
    };

    let broken = MasqueAdapter::from_parts(
        Box::new(ScriptedFlow::broken()),
        "172.16.0.2".into(),
        String::new(),
    );
    let session = TunnelSession::new(broken, Box::new(factory));
    let (iface, handle) = ChannelInterface::pair();

    let runner = tokio::spawn(forward::run(Arc::clone(&session), Arc::new(iface)));

    // First packet hits the dead flow and flips the broken flag.
    handle.inject(b"trigger").unwrap();

    // Recovery: 1s settle, then backoffs of 2s/4s/6s; the third create
    // succeeds. Paused time makes this instant.
    tokio::time::timeout(Duration::from_secs(120), async {
        while session.is_broken() || attempts.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session never recovered");
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "exactly two failures then success");

    // Forwarding resumes through the replacement adapter.
    handle.inject(b"after-recovery").unwrap();
    let forwarded = tokio::time::timeout(Duration::from_secs(30), written_rx.recv())
        .await
        .expect("packet never reached the new adapter")
        .unwrap();
    assert_eq!(forwarded, b"after-recovery");

    session.shutdown().await.unwrap();
    let _ = runner.await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_failures_trigger_a_single_recovery_run() {
    let (written_tx, _written_rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicU32::new(0));
    let factory = FlakyFactory {
        failures: 0,
        attempts: Arc::clone(&attempts),
        written: written_tx,
    };

    let broken = MasqueAdapter::from_parts(
        Box::new(ScriptedFlow::broken()),
        "172.16.0.2".into(),
        String::new(),
    );
    let session = TunnelSession::new(broken, Box::new(factory));
    let (iface, handle) = ChannelInterface::pair();
    let runner = tokio::spawn(forward::run(Arc::clone(&session), Arc::new(iface)));

    // Both loops observe the dead flow around the same time; the reader
    // fails on its own, the writer via the injected packet.
    handle.inject(b"x").unwrap();

    tokio::time::timeout(Duration::from_secs(60), async {
        while session.is_broken() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session never recovered");

    // One settle window later no second run has started.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    session.shutdown().await.unwrap();
    let _ = runner.await;
}
