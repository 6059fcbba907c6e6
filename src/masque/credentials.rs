//! Device credential persistence.
//!
//! Credentials come back from registration and are written as JSON so they
//! survive restarts; a device keeps its identity and endpoint assignment
//! between runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to dial the relay as a registered device.
///
/// `private_key` is the device's base64 PKCS#8 DER EC key; the relay knows
/// the matching public key via enrollment. `endpoint_pub_key` is the relay's
/// base64 SPKI DER, used for certificate pinning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelCredentials {
    pub private_key: String,
    pub endpoint_v4: String,
    pub endpoint_v6: String,
    pub endpoint_pub_key: String,
    pub license: String,
    pub device_id: String,
    pub access_token: String,
    pub ipv4: String,
    pub ipv6: String,
}

impl TunnelCredentials {
    /// A credential file is usable only if the fields the dial path depends
    /// on are present. Anything less gets re-registered.
    pub fn is_complete(&self) -> bool {
        !self.private_key.is_empty() && !self.endpoint_v4.is_empty() && !self.device_id.is_empty()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading credentials {path:?}"))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing credentials {path:?}"))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating config directory {dir:?}"))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing credentials {path:?}"))
    }
}

/// Default credential location: `$XDG_CONFIG_HOME/mirage/credentials.json`,
/// falling back to `$HOME/.config`, then the working directory.
pub fn default_credentials_path() -> PathBuf {
    config_dir().join("credentials.json")
}

fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("mirage");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".config").join("mirage");
    }
    PathBuf::from(".mirage")
}
