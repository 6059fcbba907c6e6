//! Packet forwarding between the virtual interface and the tunnel, with
//! automatic recovery when the connection drops.

pub mod session;

pub use session::{AdapterFactory, TunnelSession};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::iface::TunInterface;
use crate::masque::MasqueAdapter;

const BROKEN_PAUSE: Duration = Duration::from_millis(100);
const READ_ERROR_PAUSE: Duration = Duration::from_millis(500);
const SETTLE_DELAY: Duration = Duration::from_secs(1);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_DELAY: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 5;

/// Whether an error means the tunnel connection itself is gone, as opposed
/// to a single bad packet. Matches on the error text because the failures
/// surface from several layers with no common type.
pub fn is_connection_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_lowercase();
    ["closed", "connection reset", "broken pipe", "unreachable"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// Run the two forwarding loops and the recovery task until the session is
/// cancelled, then close the adapter.
pub async fn run(session: Arc<TunnelSession>, iface: Arc<dyn TunInterface>) -> anyhow::Result<()> {
    info!("starting tunnel forwarding");
    let outbound = tokio::spawn(iface_to_tunnel(Arc::clone(&session), Arc::clone(&iface)));
    let inbound = tokio::spawn(tunnel_to_iface(Arc::clone(&session), Arc::clone(&iface)));
    let recover = tokio::spawn(recovery(Arc::clone(&session)));

    session.cancel_token().cancelled().await;
    let _ = tokio::join!(outbound, inbound, recover);
    session.adapter().close().await
}

/// Interface to tunnel. Read errors are logged and skipped; a connection
/// error on the tunnel side pauses forwarding and wakes recovery.
async fn iface_to_tunnel(session: Arc<TunnelSession>, iface: Arc<dyn TunInterface>) {
    let cancel = session.cancel_token();
    let mut buf = vec![0u8; 65536];
    loop {
        if session.is_broken() {
            if sleep_or_cancel(&cancel, BROKEN_PAUSE).await {
                return;
            }
            continue;
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = iface.read_packet(&mut buf) => match read {
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "interface read failed");
                    continue;
                }
            },
        };

        let adapter = session.adapter();
        match adapter.write_with_icmp(&buf[..n]).await {
            Ok(Some(icmp)) => {
                debug!(len = icmp.len(), "delivering ICMP response");
                if let Err(err) = iface.write_packet(&icmp).await {
                    warn!(error = %err, "interface write failed");
                }
            }
            Ok(None) => {}
            Err(err) if is_connection_error(&err) => {
                warn!(error = %err, "connection error on tunnel write");
                session.mark_broken();
            }
            Err(err) => warn!(error = %err, len = n, "tunnel write failed"),
        }
    }
}

/// Tunnel to interface. Connection errors back off to avoid a hot loop on
/// a dead connection; a run of other errors backs off too.
async fn tunnel_to_iface(session: Arc<TunnelSession>, iface: Arc<dyn TunInterface>) {
    let cancel = session.cancel_token();
    let mut consecutive_errors = 0u32;
    loop {
        if session.is_broken() {
            if sleep_or_cancel(&cancel, BROKEN_PAUSE).await {
                return;
            }
            continue;
        }

        let adapter = session.adapter();
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            read = adapter.read() => read,
        };

        match packet {
            Ok(packet) => {
                consecutive_errors = 0;
                if let Err(err) = iface.write_packet(&packet).await {
                    warn!(error = %err, len = packet.len(), "interface write failed");
                }
            }
            Err(err) if is_connection_error(&err) => {
                warn!(error = %err, "connection error on tunnel read");
                session.mark_broken();
                if sleep_or_cancel(&cancel, READ_ERROR_PAUSE).await {
                    return;
                }
            }
            Err(err) => {
                consecutive_errors += 1;
                warn!(error = %err, consecutive_errors, "tunnel read failed");
                if consecutive_errors > 10 && sleep_or_cancel(&cancel, BROKEN_PAUSE).await {
                    return;
                }
            }
        }
    }
}

/// Recovery task: wait for a down signal, rebuild the adapter with growing
/// backoff, verify it, and swap it in. Retried indefinitely; after a full
/// round of failures the signal is re-armed.
async fn recovery(session: Arc<TunnelSession>) {
    let cancel = session.cancel_token();
    let Some(mut down_rx) = session.take_down_signal() else {
        return;
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            signal = down_rx.recv() => {
                if signal.is_none() {
                    return;
                }
            }
        }
        warn!("tunnel connection lost, starting recovery");

        // Let in-flight errors settle before churning the adapter.
        if sleep_or_cancel(&cancel, SETTLE_DELAY).await {
            return;
        }

        let mut recovered = false;
        for attempt in 1..=MAX_ATTEMPTS {
            let backoff = Duration::from_secs(2) * attempt;
            info!(attempt, ?backoff, "reconnection attempt");
            if sleep_or_cancel(&cancel, backoff).await {
                return;
            }

            let _ = session.adapter().close().await;

            let candidate = match session.factory().create().await {
                Ok(adapter) => adapter,
                Err(err) => {
                    warn!(attempt, error = %err, "adapter rebuild failed");
                    continue;
                }
            };

            if verify_adapter(&candidate).await {
                info!(attempt, "tunnel re-established");
                session.replace_adapter(candidate);
                recovered = true;
                break;
            }
            warn!(attempt, "rebuilt tunnel failed verification");
            let _ = candidate.close().await;
        }

        if !recovered {
            error!("all reconnection attempts failed, connection remains broken");
            if sleep_or_cancel(&cancel, RETRY_DELAY).await {
                return;
            }
            session.signal_down();
        }
    }
}

/// A bounded read on the fresh adapter. A quiet tunnel times out and that
/// is fine; only a read failing with a connection error rejects it.
async fn verify_adapter(adapter: &MasqueAdapter) -> bool {
    match tokio::time::timeout(VERIFY_TIMEOUT, adapter.read()).await {
        Err(_elapsed) => true,
        Ok(Ok(_)) => true,
        Ok(Err(err)) => !is_connection_error(&err),
    }
}

/// True when the token fired.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
