//! mirage client binary: establish the tunnel and keep it forwarding.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mirage::forward::{self, AdapterFactory, TunnelSession};
use mirage::iface::ChannelInterface;
use mirage::masque::{EstablishConfig, MasqueAdapter};
use mirage::obfuscate::ObfuscationConfig;

#[derive(Parser, Debug)]
#[command(name = "mirage", about = "Censorship-resistant MASQUE tunnel client")]
struct Args {
    /// Credentials file (defaults to the platform config directory)
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Relay endpoint override, host or host:port. Disables key pinning.
    #[arg(long)]
    endpoint: Option<String>,

    /// SNI to present in the handshake
    #[arg(long)]
    sni: Option<String>,

    /// Device name sent at registration
    #[arg(long, default_value = "mirage")]
    device_name: String,

    /// License key to adopt after registration
    #[arg(long)]
    license: Option<String>,

    /// Managed-account token
    #[arg(long)]
    team_token: Option<String>,

    /// Prefer the IPv6 relay endpoint
    #[arg(long)]
    ipv6: bool,

    /// Obfuscation config file (JSON)
    #[arg(long)]
    obfuscation: Option<PathBuf>,

    /// Obfuscation preset: none, minimal, light, medium, heavy, stealth,
    /// gfw, firewall
    #[arg(long, conflicts_with = "obfuscation")]
    preset: Option<String>,

    /// Write a named preset to a file and exit
    #[arg(long, num_args = 2, value_names = ["NAME", "PATH"])]
    export_preset: Option<Vec<String>>,
}

struct EstablishFactory {
    config: EstablishConfig,
}

#[async_trait]
impl AdapterFactory for EstablishFactory {
    async fn create(&self) -> Result<MasqueAdapter> {
        MasqueAdapter::establish(self.config.clone()).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install ring CryptoProvider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    if let Some(parts) = &args.export_preset {
        let (name, path) = (&parts[0], &parts[1]);
        ObfuscationConfig::export_preset(name, path)
            .with_context(|| format!("exporting preset {name}"))?;
        info!(%name, %path, "preset written");
        return Ok(());
    }

    let obfuscation = match (&args.obfuscation, &args.preset) {
        (Some(path), _) => Some(ObfuscationConfig::load(path)?),
        (None, Some(name)) => Some(ObfuscationConfig::preset(name)?),
        (None, None) => None,
    };

    let config = EstablishConfig {
        credentials_path: args.credentials.clone(),
        endpoint: args.endpoint.clone(),
        sni: args.sni.clone(),
        device_name: Some(args.device_name.clone()),
        license: args.license.clone(),
        team_token: args.team_token.clone(),
        use_ipv6: args.ipv6,
        obfuscation,
    };

    let adapter = MasqueAdapter::establish(config.clone()).await?;
    let (ipv4, ipv6) = adapter.local_addresses();
    info!(%ipv4, %ipv6, "tunnel up");

    let session = TunnelSession::new(adapter, Box::new(EstablishFactory { config }));
    let (iface, _handle) = ChannelInterface::pair();

    let runner = tokio::spawn(forward::run(Arc::clone(&session), Arc::new(iface)));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    if let Err(err) = session.shutdown().await {
        warn!(error = %err, "shutdown was not clean");
    }
    let _ = runner.await;
    Ok(())
}
