//! MASQUE tunnel adapter: registration, dial, and the packet interface
//! the forwarding loops use.

pub mod credentials;
pub mod dial;
pub mod register;
pub mod tls;

use anyhow::{bail, Context, Result};
use base64::prelude::*;
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::obfuscate::socket::{ObfuscatedSocket, PacketSocket};
use crate::obfuscate::{ObfuscationConfig, ObfuscationEngine};
use credentials::TunnelCredentials;
use dial::{DatagramDialer, IpFlow, TunnelDialer};
use tls::DeviceIdentity;

/// SNI presented to the relay; matches what the consumer client sends so
/// the ClientHello does not stand out.
pub const DEFAULT_SNI: &str = "consumer-masque.cloudflareclient.com";
/// URI carried in the connect request.
pub const CONNECT_URI: &str = "https://cloudflareaccess.com";
pub const DEFAULT_PORT: u16 = 443;

/// Relay fleet ranges, used when scanning for an alternative endpoint.
pub const DEFAULT_V4_CIDRS: &[&str] = &[
    "162.159.192.0/24",
    "162.159.193.0/24",
    "162.159.195.0/24",
    "162.159.196.0/24",
    "162.159.198.0/24",
];
pub const DEFAULT_V6_CIDRS: &[&str] = &["2606:4700:d0::/48", "2606:4700:d1::/48"];

const UDP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything `establish` needs; defaults give a working consumer setup.
#[derive(Clone, Default)]
pub struct EstablishConfig {
    /// Credential file location; platform config dir when unset.
    pub credentials_path: Option<PathBuf>,
    /// Endpoint override, host or host:port. Overriding disables pinning.
    pub endpoint: Option<String>,
    pub sni: Option<String>,
    /// Device name sent at enrollment.
    pub device_name: Option<String>,
    /// License key to adopt instead of the one registration hands out.
    pub license: Option<String>,
    /// Managed-account token forwarded as a bearer credential.
    pub team_token: Option<String>,
    pub use_ipv6: bool,
    pub obfuscation: Option<ObfuscationConfig>,
}

/// Live tunnel: one IP flow plus the addresses the relay assigned us.
pub struct MasqueAdapter {
    flow: Box<dyn IpFlow>,
    closed: AtomicBool,
    local_ipv4: String,
    local_ipv6: String,
}

impl MasqueAdapter {
    /// Full establishment: credentials (registering if needed), endpoint
    /// resolution, TLS identity, UDP pre-check, obfuscated dial, status
    /// check.
    pub async fn establish(config: EstablishConfig) -> Result<Self> {
        Self::establish_with_dialer(config, &DatagramDialer).await
    }

    pub async fn establish_with_dialer(
        config: EstablishConfig,
        dialer: &dyn TunnelDialer,
    ) -> Result<Self> {
        let path = config
            .credentials_path
            .clone()
            .unwrap_or_else(credentials::default_credentials_path);
        let creds = load_or_register(&path, &config).await?;

        let registered = if config.use_ipv6 && !creds.endpoint_v6.is_empty() {
            creds.endpoint_v6.clone()
        } else {
            creds.endpoint_v4.clone()
        };
        let endpoint_host = config.endpoint.clone().unwrap_or_else(|| registered.clone());
        let endpoint_addr = ensure_port(&endpoint_host, DEFAULT_PORT);
        let remote = resolve_endpoint(&endpoint_addr).await?;

        let pinned = pinned_key(config.endpoint.as_deref(), &registered, &creds)?;
        let sni = config.sni.clone().unwrap_or_else(|| DEFAULT_SNI.to_string());
        info!(endpoint = %endpoint_addr, %sni, pinned = pinned.is_some(), "establishing tunnel");

        let identity = DeviceIdentity::from_private_key_b64(&creds.private_key)?;
        let tls_config = tls::build_tls_config(&identity, pinned)?;
        let quic_config = tls::build_quic_config(tls_config)?;

        dial::probe_udp_reachability(remote, UDP_PROBE_TIMEOUT).await?;

        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = Arc::new(UdpSocket::bind(bind).await.context("binding tunnel socket")?);
        let packet_socket: Arc<dyn PacketSocket> = match config.obfuscation.clone() {
            Some(obf) => {
                debug!("wire obfuscation enabled");
                let engine = Arc::new(ObfuscationEngine::new(obf));
                Arc::new(ObfuscatedSocket::new(socket, engine))
            }
            None => socket,
        };

        let outcome = tokio::time::timeout(
            DIAL_TIMEOUT,
            dialer.dial(quic_config, CONNECT_URI, remote, &sni, packet_socket),
        )
        .await
        .map_err(|_| anyhow::anyhow!("tunnel dial to {remote} timed out"))??;

        if outcome.status != 200 {
            let _ = outcome.flow.close().await;
            bail!("tunnel rejected with status {}", outcome.status);
        }
        info!(ipv4 = %creds.ipv4, ipv6 = %creds.ipv6, "tunnel established");

        Ok(Self {
            flow: outcome.flow,
            closed: AtomicBool::new(false),
            local_ipv4: creds.ipv4,
            local_ipv6: creds.ipv6,
        })
    }

    /// Build an adapter around an existing flow. Used by the self-test path
    /// and the recovery tests.
    pub fn from_parts(flow: Box<dyn IpFlow>, local_ipv4: String, local_ipv6: String) -> Self {
        Self {
            flow,
            closed: AtomicBool::new(false),
            local_ipv4,
            local_ipv6,
        }
    }

    /// Next IP packet from the tunnel.
    pub async fn read(&self) -> Result<Bytes> {
        self.flow.read_packet().await
    }

    /// Send an IP packet, discarding any inline ICMP response.
    pub async fn write(&self, packet: &[u8]) -> Result<()> {
        self.flow.write_packet(packet).await?;
        Ok(())
    }

    /// Send an IP packet and surface the relay's ICMP response if one
    /// arrived.
    pub async fn write_with_icmp(&self, packet: &[u8]) -> Result<Option<Bytes>> {
        self.flow.write_packet(packet).await
    }

    /// Idempotent; the second and later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flow.close().await
    }

    /// Addresses the relay assigned to this device.
    pub fn local_addresses(&self) -> (&str, &str) {
        (&self.local_ipv4, &self.local_ipv6)
    }
}

async fn load_or_register(
    path: &std::path::Path,
    config: &EstablishConfig,
) -> Result<TunnelCredentials> {
    if path.exists() {
        match TunnelCredentials::load(path) {
            Ok(creds) if creds.is_complete() => {
                info!(?path, "loaded existing credentials");
                return Ok(creds);
            }
            Ok(_) => warn!(?path, "credentials incomplete, re-registering"),
            Err(err) => warn!(?path, error = %err, "credentials unreadable, re-registering"),
        }
        std::fs::remove_file(path).with_context(|| format!("removing stale credentials {path:?}"))?;
    }

    info!(?path, "registering new device");
    let device_name = config.device_name.as_deref().unwrap_or("mirage");
    let team_token = config.team_token.as_deref().unwrap_or("");

    let account = register::register("PC", "en_US", team_token, true).await?;
    let identity = DeviceIdentity::generate()?;
    let enrolled = register::enroll_key(&account, &identity.public_key_der(), device_name).await?;

    let peer = enrolled
        .config
        .peers
        .first()
        .context("enrollment response has no relay peers")?;
    let mut creds = TunnelCredentials {
        private_key: identity.private_key_b64(),
        endpoint_v4: register::strip_port_suffix(&peer.endpoint.v4).to_string(),
        endpoint_v6: register::strip_port_suffix(&peer.endpoint.v6).to_string(),
        endpoint_pub_key: peer.public_key.clone(),
        license: enrolled.account.license.clone(),
        device_id: enrolled.id.clone(),
        access_token: account.token.clone(),
        ipv4: enrolled.config.interface.addresses.v4.clone(),
        ipv6: enrolled.config.interface.addresses.v6.clone(),
    };
    if let Some(license) = &config.license {
        creds.license = license.clone();
    }

    creds.save(path)?;
    // Read back to catch a bad write before anything depends on it.
    let reloaded = TunnelCredentials::load(path)?;
    if !reloaded.is_complete() {
        bail!("saved credentials failed verification");
    }
    info!(device_id = %reloaded.device_id, "device registered");
    Ok(reloaded)
}

/// Pinning applies to the registered endpoint only. Dialing somewhere else
/// means the registered key cannot be expected to match, so pinning is
/// dropped with a warning rather than failing the connection.
fn pinned_key(
    override_host: Option<&str>,
    registered: &str,
    creds: &TunnelCredentials,
) -> Result<Option<Vec<u8>>> {
    if let Some(host) = override_host {
        let bare = register::strip_port_suffix(host);
        if bare != registered {
            warn!(custom = %bare, %registered, "custom endpoint, disabling key pinning");
            return Ok(None);
        }
    }
    if creds.endpoint_pub_key.is_empty() {
        warn!("no relay key on record, pinning unavailable");
        return Ok(None);
    }
    let spki = BASE64_STANDARD
        .decode(&creds.endpoint_pub_key)
        .context("decoding pinned relay key")?;
    Ok(Some(spki))
}

/// Append the default port unless the host already carries one. Bare IPv6
/// literals get bracketed.
fn ensure_port(host: &str, port: u16) -> String {
    if host.starts_with('[') {
        if host.contains("]:") {
            return host.to_string();
        }
        return format!("{host}:{port}");
    }
    match host.matches(':').count() {
        0 => format!("{host}:{port}"),
        1 => host.to_string(),
        _ => format!("[{host}]:{port}"),
    }
}

async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint)
        .await
        .with_context(|| format!("resolving endpoint {endpoint}"))?
        .next()
        .with_context(|| format!("endpoint {endpoint} resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_is_appended_when_missing() {
        assert_eq!(ensure_port("162.159.198.1", 443), "162.159.198.1:443");
        assert_eq!(ensure_port("162.159.198.1:8443", 443), "162.159.198.1:8443");
        assert_eq!(
            ensure_port("2606:4700:d0::1", 443),
            "[2606:4700:d0::1]:443"
        );
        assert_eq!(
            ensure_port("[2606:4700:d0::1]:8443", 443),
            "[2606:4700:d0::1]:8443"
        );
        assert_eq!(ensure_port("[2606:4700:d0::1]", 443), "[2606:4700:d0::1]:443");
        assert_eq!(ensure_port("relay.example", 443), "relay.example:443");
    }

    #[test]
    fn pinning_decision() {
        let mut creds = TunnelCredentials::default();
        creds.endpoint_pub_key = BASE64_STANDARD.encode(b"spki-bytes");

        // No override: pin to the registered key.
        let pin = pinned_key(None, "162.159.198.1", &creds).unwrap();
        assert_eq!(pin.as_deref(), Some(&b"spki-bytes"[..]));

        // Override matching the registered endpoint keeps the pin.
        let pin = pinned_key(Some("162.159.198.1:443"), "162.159.198.1", &creds).unwrap();
        assert!(pin.is_some());

        // Custom endpoint drops it.
        let pin = pinned_key(Some("10.0.0.1"), "162.159.198.1", &creds).unwrap();
        assert!(pin.is_none());

        // No key on record: nothing to pin.
        creds.endpoint_pub_key.clear();
        let pin = pinned_key(None, "162.159.198.1", &creds).unwrap();
        assert!(pin.is_none());
    }

    #[test]
    fn garbage_pinned_key_is_an_error() {
        let mut creds = TunnelCredentials::default();
        creds.endpoint_pub_key = "not base64!!".into();
        assert!(pinned_key(None, "162.159.198.1", &creds).is_err());
    }
}
