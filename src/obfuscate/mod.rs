//! Traffic obfuscation for the tunnel's outer UDP flow.
//!
//! The engine rewrites outgoing datagrams so the QUIC handshake does not
//! present its usual wire signature: decoy junk packets and signature
//! templates around the Initial, padding and protocol mimicry on the
//! steady-state flow, and optional fragmentation of oversized Initials.
//! Inbound traffic is never touched.

pub mod classify;
pub mod config;
pub mod mimic;
pub mod socket;
pub mod template;

use anyhow::Result;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

pub use classify::{classify, PacketKind};
pub use config::ObfuscationConfig;
pub use mimic::MimicProtocol;

/// Where a destination stands in its QUIC handshake. Tracked per remote
/// address so each new path gets its own decoy sequence.
#[derive(Debug, Default)]
struct HandshakeState {
    /// First Initial observed; the pre-handshake sequence has run.
    initial_seen: bool,
    /// First 1-RTT packet observed; the post-handshake junk has run.
    post_done: bool,
}

/// Applies an [`ObfuscationConfig`] to outgoing datagrams.
///
/// The active config can be swapped at runtime without disturbing
/// in-flight sends; per-destination handshake state survives the swap.
pub struct ObfuscationEngine {
    config: ArcSwap<ObfuscationConfig>,
    states: DashMap<SocketAddr, HandshakeState>,
    mimic: ArcSwap<Option<MimicProtocol>>,
}

impl ObfuscationEngine {
    pub fn new(config: ObfuscationConfig) -> Self {
        let mimic = MimicProtocol::parse(&config.mimic_protocol);
        if !config.mimic_protocol.is_empty() && mimic.is_none() {
            warn!(protocol = %config.mimic_protocol, "unknown mimic protocol, disabled");
        }
        Self {
            config: ArcSwap::from_pointee(config),
            states: DashMap::new(),
            mimic: ArcSwap::from_pointee(mimic),
        }
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> Arc<ObfuscationConfig> {
        self.config.load_full()
    }

    /// Replace the active configuration. Handshake state is kept; a
    /// destination mid-handshake continues under the new parameters.
    pub fn update_config(&self, config: ObfuscationConfig) {
        self.mimic
            .store(Arc::new(MimicProtocol::parse(&config.mimic_protocol)));
        self.config.store(Arc::new(config));
    }

    /// Forget the handshake state for a destination so the next Initial
    /// runs the full decoy sequence again.
    pub fn reset(&self, dest: SocketAddr) {
        self.states.remove(&dest);
    }

    /// Obfuscate and send one datagram.
    ///
    /// Fragmented Initials return after the first fragment is on the wire;
    /// the remainder goes out from a background task so the caller is not
    /// blocked on inter-fragment delays.
    pub async fn send(
        &self,
        socket: &Arc<UdpSocket>,
        packet: &[u8],
        dest: SocketAddr,
    ) -> Result<()> {
        let cfg = self.config.load_full();
        let kind = classify(packet);

        let (run_pre, run_post) = {
            let mut state = self.states.entry(dest).or_default();
            match kind {
                PacketKind::Initial if !state.initial_seen => {
                    state.initial_seen = true;
                    (true, false)
                }
                PacketKind::OneRtt if !state.post_done => {
                    state.post_done = true;
                    (false, true)
                }
                _ => (false, false),
            }
        };

        if run_pre {
            debug!(%dest, "first Initial, running pre-handshake sequence");
            self.pre_handshake(socket, dest, &cfg).await;
            if !cfg.handshake_delay.is_zero() {
                tokio::time::sleep(cfg.handshake_delay).await;
            }
        } else if run_post {
            debug!(%dest, "handshake complete, sending trailing junk");
            self.send_junk_burst(socket, dest, cfg.jc_after_hs, &cfg).await;
        }

        if cfg.fragment_initial
            && kind == PacketKind::Initial
            && cfg.fragment_size > 0
            && packet.len() > cfg.fragment_size
        {
            return self.send_fragmented(socket, packet, dest, &cfg).await;
        }

        let mut out = packet.to_vec();
        self.pad(&mut out, &cfg);
        if let Some(proto) = **self.mimic.load() {
            out = mimic::wrap(proto, &out);
        }

        self.packet_delay(&cfg).await;
        socket.send_to(&out, dest).await?;
        trace!(%dest, len = out.len(), ?kind, "sent obfuscated datagram");
        Ok(())
    }

    /// Decoy sequence around the first Initial: junk, signature templates,
    /// more junk. Decoy failures of any kind only log; neither a bad
    /// signature nor a failed filler datagram may stop the handshake.
    async fn pre_handshake(&self, socket: &Arc<UdpSocket>, dest: SocketAddr, cfg: &ObfuscationConfig) {
        self.send_junk_burst(socket, dest, cfg.jc_before_hs, cfg).await;

        self.send_template(socket, dest, &cfg.i1, cfg).await;
        self.send_junk_burst(socket, dest, cfg.jc_after_i1, cfg).await;

        for template in [&cfg.i2, &cfg.i3, &cfg.i4, &cfg.i5] {
            self.send_template(socket, dest, template, cfg).await;
        }

        self.send_junk_burst(socket, dest, cfg.jc_during_hs, cfg).await;
    }

    async fn send_template(
        &self,
        socket: &Arc<UdpSocket>,
        dest: SocketAddr,
        template: &str,
        cfg: &ObfuscationConfig,
    ) {
        if template.is_empty() {
            return;
        }
        match template::expand_template(template) {
            Ok(payload) if !payload.is_empty() => {
                if let Err(err) = socket.send_to(&payload, dest).await {
                    warn!(%dest, error = %err, "signature packet send failed");
                    return;
                }
                self.junk_delay(cfg).await;
            }
            Ok(_) => {}
            Err(err) => warn!(%dest, error = %err, "skipping malformed signature template"),
        }
    }

    async fn send_junk_burst(
        &self,
        socket: &Arc<UdpSocket>,
        dest: SocketAddr,
        count: usize,
        cfg: &ObfuscationConfig,
    ) {
        for _ in 0..count {
            let junk = self.generate_junk(cfg);
            if let Err(err) = socket.send_to(&junk, dest).await {
                warn!(%dest, error = %err, "junk packet send failed");
                continue;
            }
            self.junk_delay(cfg).await;
        }
    }

    /// Random filler datagram, sized in `[jmin, jmax]` and stamped with the
    /// mimic header so decoys and real traffic look alike.
    fn generate_junk(&self, cfg: &ObfuscationConfig) -> Vec<u8> {
        let mut size = if cfg.jmax > cfg.jmin {
            OsRng.gen_range(cfg.jmin..=cfg.jmax)
        } else {
            cfg.jmin
        };
        if size == 0 && !cfg.allow_zero_size {
            size = 1;
        }
        let mut junk = vec![0u8; size];
        OsRng.fill_bytes(&mut junk);
        if let Some(proto) = **self.mimic.load() {
            mimic::stamp_junk(proto, &mut junk);
        }
        junk
    }

    /// Append random padding without crossing the MTU budget. Tiny packets
    /// (under 16 bytes, typically acks and probes) are left alone so their
    /// timing profile stays plausible.
    fn pad(&self, packet: &mut Vec<u8>, cfg: &ObfuscationConfig) {
        if cfg.padding_max == 0 || packet.len() < 16 {
            return;
        }
        let want = if cfg.random_padding && cfg.padding_max > cfg.padding_min {
            OsRng.gen_range(cfg.padding_min..=cfg.padding_max)
        } else {
            cfg.padding_max
        };
        let room = config::MAX_PADDED_SIZE.saturating_sub(packet.len());
        let pad = want.min(room);
        if pad == 0 {
            return;
        }
        let start = packet.len();
        packet.resize(start + pad, 0);
        OsRng.fill_bytes(&mut packet[start..]);
    }

    async fn send_fragmented(
        &self,
        socket: &Arc<UdpSocket>,
        packet: &[u8],
        dest: SocketAddr,
        cfg: &ObfuscationConfig,
    ) -> Result<()> {
        let size = cfg.fragment_size;
        let (first, rest) = packet.split_at(size);
        socket.send_to(first, dest).await?;
        debug!(%dest, total = packet.len(), size, "fragmenting Initial packet");

        let rest = rest.to_vec();
        let socket = Arc::clone(socket);
        let delay = cfg.fragment_delay;
        tokio::spawn(async move {
            for chunk in rest.chunks(size) {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Err(err) = socket.send_to(chunk, dest).await {
                    warn!(%dest, error = %err, "fragment send failed");
                    return;
                }
            }
        });
        Ok(())
    }

    async fn packet_delay(&self, cfg: &ObfuscationConfig) {
        let delay = if cfg.random_delay && cfg.delay_max > cfg.delay_min {
            random_in(cfg.delay_min, cfg.delay_max)
        } else {
            cfg.packet_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn junk_delay(&self, cfg: &ObfuscationConfig) {
        if cfg.junk_interval.is_zero() {
            return;
        }
        let delay = if cfg.junk_random {
            random_in(Duration::ZERO, cfg.junk_interval * 2)
        } else {
            cfg.junk_interval
        };
        tokio::time::sleep(delay).await;
    }
}

fn random_in(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_nanos() as u64;
    min + Duration::from_nanos(OsRng.gen_range(0..=span))
}
