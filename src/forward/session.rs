//! Shared state for a supervised tunnel session.

use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::masque::MasqueAdapter;

/// Builds a replacement adapter during recovery. Production wires this to
/// a fresh `MasqueAdapter::establish`; tests substitute scripted factories.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(&self) -> Result<MasqueAdapter>;
}

/// One tunnel under supervision.
///
/// The adapter sits in a swap cell so recovery can replace it while the
/// forwarding loops keep running; they pick up the new adapter on their
/// next iteration. The broken flag pauses both directions together, and
/// the single-slot down channel collapses repeated failure signals into
/// one recovery run.
pub struct TunnelSession {
    adapter: ArcSwap<MasqueAdapter>,
    factory: Box<dyn AdapterFactory>,
    broken: AtomicBool,
    down_tx: mpsc::Sender<()>,
    down_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    cancel: CancellationToken,
}

impl TunnelSession {
    pub fn new(adapter: MasqueAdapter, factory: Box<dyn AdapterFactory>) -> Arc<Self> {
        let (down_tx, down_rx) = mpsc::channel(1);
        Arc::new(Self {
            adapter: ArcSwap::from_pointee(adapter),
            factory,
            broken: AtomicBool::new(false),
            down_tx,
            down_rx: std::sync::Mutex::new(Some(down_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Current adapter snapshot. Loops call this per packet so a swapped-in
    /// replacement takes effect immediately.
    pub fn adapter(&self) -> Arc<MasqueAdapter> {
        self.adapter.load_full()
    }

    /// Install a recovered adapter and resume both directions.
    pub fn replace_adapter(&self, adapter: MasqueAdapter) {
        self.adapter.store(Arc::new(adapter));
        self.broken.store(false, Ordering::SeqCst);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Flip the broken flag; only the first flip emits a down signal, so
    /// both loops erroring at once trigger a single recovery run.
    pub fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::SeqCst) {
            self.signal_down();
        }
    }

    /// Non-blocking; a pending signal is never duplicated.
    pub fn signal_down(&self) {
        let _ = self.down_tx.try_send(());
    }

    /// The down-signal receiver; the recovery task takes it exactly once.
    pub(crate) fn take_down_signal(&self) -> Option<mpsc::Receiver<()>> {
        self.down_rx.lock().ok()?.take()
    }

    pub(crate) fn factory(&self) -> &dyn AdapterFactory {
        self.factory.as_ref()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loops and close the live adapter.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.adapter().close().await
    }
}
