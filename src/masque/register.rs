//! Device registration against the account API.
//!
//! Two calls: `register` creates the device record and yields the access
//! token, `enroll_key` binds the device's EC public key so the relay will
//! accept its client certificate. Both go over plain HTTPS; the tunnel is
//! not involved yet.

use anyhow::{bail, Context, Result};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::debug;

const API_BASE: &str = "https://api.cloudflareclient.com";
const API_VERSION: &str = "v0a4005";
const CLIENT_VERSION: &str = "a-6.30-3596";
const USER_AGENT: &str = "okhttp/3.12.1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Account record as returned by the API; only the fields the tunnel needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub account: AccountInfo,
    #[serde(default)]
    pub config: DeviceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub license: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub addresses: Addresses,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Addresses {
    #[serde(default)]
    pub v4: String,
    #[serde(default)]
    pub v6: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerConfig {
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub endpoint: PeerEndpoint,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerEndpoint {
    #[serde(default)]
    pub v4: String,
    #[serde(default)]
    pub v6: String,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    key: &'a str,
    install_id: &'a str,
    fcm_token: &'a str,
    tos: String,
    model: &'a str,
    locale: &'a str,
}

#[derive(Serialize)]
struct EnrollRequest<'a> {
    key: String,
    device_name: &'a str,
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .context("building registration HTTP client")
}

/// Create a new device record. `team_token` is optional and becomes a
/// bearer credential for managed accounts; `accept_tos` stamps the terms
/// acceptance, which the API requires for consumer registrations.
pub async fn register(
    model: &str,
    locale: &str,
    team_token: &str,
    accept_tos: bool,
) -> Result<AccountData> {
    let url = format!("{API_BASE}/{API_VERSION}/reg");
    debug!(%url, model, locale, "registering device");

    let body = RegisterRequest {
        key: "",
        install_id: "",
        fcm_token: "",
        tos: if accept_tos {
            humantime::format_rfc3339(SystemTime::now()).to_string()
        } else {
            String::new()
        },
        model,
        locale,
    };

    let mut req = http_client()?
        .post(&url)
        .header("CF-Client-Version", CLIENT_VERSION)
        .json(&body);
    if !team_token.is_empty() {
        req = req.bearer_auth(team_token);
    }

    let resp = req.send().await.context("registration request failed")?;
    let account: AccountData = parse_response(resp).await?;
    if account.id.is_empty() || account.token.is_empty() {
        bail!("registration response missing device id or token");
    }
    debug!(device_id = %account.id, "device registered");
    Ok(account)
}

/// Bind the device's EC public key (SPKI DER) to the registered account.
/// Returns the updated record carrying the relay endpoint assignment.
pub async fn enroll_key(
    account: &AccountData,
    public_key_der: &[u8],
    device_name: &str,
) -> Result<AccountData> {
    let url = format!("{API_BASE}/{API_VERSION}/reg/{}", account.id);
    debug!(%url, device_name, "enrolling device key");

    let body = EnrollRequest {
        key: BASE64_STANDARD.encode(public_key_der),
        device_name,
    };

    let resp = http_client()?
        .patch(&url)
        .header("CF-Client-Version", CLIENT_VERSION)
        .bearer_auth(&account.token)
        .json(&body)
        .send()
        .await
        .context("key enrollment request failed")?;

    let mut updated: AccountData = parse_response(resp).await?;
    if updated.token.is_empty() {
        updated.token = account.token.clone();
    }
    validate_enrollment(&updated)?;
    Ok(updated)
}

async fn parse_response(resp: reqwest::Response) -> Result<AccountData> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("account API returned HTTP {status}: {body}");
    }
    resp.json().await.context("decoding account API response")
}

/// An enrollment that came back without the fields the dial path needs is
/// treated as a hard failure, not something to limp along with.
pub fn validate_enrollment(account: &AccountData) -> Result<()> {
    if account.id.is_empty() {
        bail!("enrollment response missing device id");
    }
    let peer = match account.config.peers.first() {
        Some(peer) => peer,
        None => bail!("enrollment response has no relay peers"),
    };
    if peer.endpoint.v4.is_empty() {
        bail!("enrollment response missing relay endpoint");
    }
    if peer.public_key.is_empty() {
        bail!("enrollment response missing relay public key");
    }
    Ok(())
}

/// Endpoints arrive as "host:port"; credentials store the bare host and the
/// dial path appends the port it wants.
pub fn strip_port_suffix(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match endpoint.rsplit_once(':') {
        // A second colon in the host means a bare IPv6 literal, not a port.
        Some((host, port))
            if !host.is_empty()
                && !host.contains(':')
                && !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            host
        }
        _ => endpoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_validation_catches_missing_fields() {
        let mut account = AccountData {
            id: "t.1".into(),
            ..AccountData::default()
        };
        assert!(validate_enrollment(&account).is_err(), "no peers");

        account.config.peers.push(PeerConfig {
            public_key: "MFkw".into(),
            endpoint: PeerEndpoint {
                v4: "192.0.2.1:443".into(),
                v6: String::new(),
            },
        });
        assert!(validate_enrollment(&account).is_ok());

        account.config.peers[0].endpoint.v4.clear();
        assert!(validate_enrollment(&account).is_err(), "no endpoint");

        account.id.clear();
        assert!(validate_enrollment(&account).is_err(), "no id");
    }

    #[test]
    fn response_shape_decodes() {
        let json = r#"{
            "id": "t.9f2c",
            "token": "secret",
            "account": {"license": "lic-123", "premium_data": 0},
            "config": {
                "interface": {"addresses": {"v4": "172.16.0.2", "v6": "2606:4700::2"}},
                "peers": [{
                    "public_key": "MFkwEwYH",
                    "endpoint": {"v4": "162.159.198.1:443", "v6": "[2606:4700:103::1]:443"}
                }]
            }
        }"#;
        let account: AccountData = serde_json::from_str(json).unwrap();
        assert_eq!(account.id, "t.9f2c");
        assert_eq!(account.account.license, "lic-123");
        assert_eq!(account.config.peers[0].endpoint.v4, "162.159.198.1:443");
        assert_eq!(account.config.interface.addresses.v4, "172.16.0.2");
    }

    #[test]
    fn port_suffix_stripping() {
        assert_eq!(strip_port_suffix("162.159.198.1:443"), "162.159.198.1");
        assert_eq!(strip_port_suffix("[2606:4700:103::1]:443"), "2606:4700:103::1");
        assert_eq!(strip_port_suffix("162.159.198.1"), "162.159.198.1");
        assert_eq!(strip_port_suffix("2606:4700:103::1"), "2606:4700:103::1");
    }
}
