//! Obfuscation parameters and presets.
//!
//! The configuration is immutable once built; runtime reconfiguration swaps
//! a whole snapshot (see the engine). Files are plain JSON with durations in
//! human-readable form ("5ms", "2s") so presets can be hand-edited.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Packets are never padded past this total size; staying under the usual
/// QUIC minimum-MTU budget avoids IP fragmentation on the wire.
pub const MAX_PADDED_SIZE: usize = 1200;

/// Knobs controlling how outgoing tunnel datagrams are disguised.
///
/// Every field defaults to its zero/disabled value; a default-constructed
/// config is a no-op and the transport bypasses the engine entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    /// Signature packet templates sent around the handshake (see
    /// [`crate::obfuscate::template`]). `i1` leads, `i2`..`i5` follow.
    pub i1: String,
    pub i2: String,
    pub i3: String,
    pub i4: String,
    pub i5: String,

    /// Split oversized Initial packets into chunks of this size.
    pub fragment_size: usize,
    /// Enable fragmentation of Initial packets specifically.
    pub fragment_initial: bool,
    /// Pause between fragments.
    #[serde(with = "duration_str")]
    pub fragment_delay: Duration,

    /// Padding bounds per packet; `random_padding` picks uniformly in
    /// `[padding_min, padding_max]`, otherwise `padding_max` is used.
    pub padding_min: usize,
    pub padding_max: usize,
    pub random_padding: bool,

    /// Advisory total junk-packet count. Only consulted by the bypass
    /// check; the phase counts below drive the actual volume.
    pub jc: usize,
    /// Junk packet size bounds.
    pub jmin: usize,
    pub jmax: usize,

    /// Junk packets per handshake phase.
    pub jc_before_hs: usize,
    pub jc_after_i1: usize,
    pub jc_during_hs: usize,
    pub jc_after_hs: usize,
    /// Spacing between junk packets; `junk_random` jitters it in
    /// `[0, 2*junk_interval)`.
    #[serde(with = "duration_str")]
    pub junk_interval: Duration,
    pub junk_random: bool,
    /// Permit zero-length junk datagrams.
    pub allow_zero_size: bool,

    /// Disguise protocol: "dns", "https"/"h3", "dtls", "stun" or empty.
    pub mimic_protocol: String,
    /// Reserved for caller-supplied wrappers; carried but not interpreted.
    pub custom_wrapper: bool,

    /// Pause before the real Initial is released.
    #[serde(with = "duration_str")]
    pub handshake_delay: Duration,
    /// Fixed inter-packet delay when `random_delay` is off.
    #[serde(with = "duration_str")]
    pub packet_delay: Duration,
    pub random_delay: bool,
    #[serde(with = "duration_str")]
    pub delay_min: Duration,
    #[serde(with = "duration_str")]
    pub delay_max: Duration,

    /// Secondary fingerprint-resistance knobs. These round-trip through
    /// config files but are not wired into the send path.
    pub sni_fragmentation: bool,
    pub sni_fragment: usize,
    pub fake_alpn: Vec<String>,
    pub reversed_order: bool,
    pub duplicate_packets: bool,
    pub use_timestamp: bool,
    pub use_nonce: bool,
    pub randomize_initial: bool,
    pub fake_loss: f32,
}

impl ObfuscationConfig {
    /// True when every option that would alter traffic is disabled; the
    /// transport then passes packets through untouched with no added
    /// latency.
    pub fn is_noop(&self) -> bool {
        self.jc == 0
            && self.jc_before_hs == 0
            && self.jc_after_i1 == 0
            && self.jc_during_hs == 0
            && self.jc_after_hs == 0
            && self.padding_max == 0
            && !self.fragment_initial
            && self.i1.is_empty()
            && self.i2.is_empty()
    }

    /// Load a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading obfuscation config {path:?}"))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing obfuscation config {path:?}"))
    }

    /// Save the config as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing obfuscation config {path:?}"))
    }

    /// Look up a named preset.
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Self::default()),
            "minimal" => Ok(Self::minimal()),
            "light" => Ok(Self::light()),
            "medium" => Ok(Self::medium()),
            "heavy" => Ok(Self::heavy()),
            "stealth" => Ok(Self::stealth()),
            "gfw" => Ok(Self::gfw()),
            "firewall" => Ok(Self::firewall()),
            other => bail!("unknown obfuscation preset: {other}"),
        }
    }

    /// Write a preset out as a JSON file for hand customization.
    pub fn export_preset(name: &str, path: impl AsRef<Path>) -> Result<()> {
        Self::preset(name)?.save(path)
    }

    /// Light junk coverage only; least likely to disturb the handshake.
    pub fn minimal() -> Self {
        Self {
            jc: 12,
            jc_before_hs: 4,
            jc_after_i1: 4,
            jc_during_hs: 4,
            jc_after_hs: 3,
            junk_interval: Duration::from_millis(5),
            allow_zero_size: true,
            ..Self::default()
        }
    }

    /// A few realistic-sized junk packets plus an HTTP-looking signature.
    pub fn light() -> Self {
        Self {
            i1: "<b 474554202f20485454502f312e31><r 8>".into(),
            jc: 8,
            jc_before_hs: 2,
            jc_after_i1: 1,
            jc_during_hs: 2,
            jc_after_hs: 3,
            jmin: 40,
            jmax: 120,
            junk_interval: Duration::from_millis(3),
            junk_random: true,
            handshake_delay: Duration::from_millis(5),
            random_delay: true,
            delay_min: Duration::from_millis(1),
            delay_max: Duration::from_millis(5),
            sni_fragmentation: true,
            use_nonce: true,
            randomize_initial: true,
            ..Self::default()
        }
    }

    /// Balanced default: HTTP/3-flavoured signature, moderate junk and
    /// padding.
    pub fn medium() -> Self {
        Self {
            i1: "<b 0d0a0d0a><t><r 16>".into(),
            fragment_size: 512,
            fragment_initial: true,
            fragment_delay: Duration::from_millis(2),
            padding_min: 16,
            padding_max: 64,
            random_padding: true,
            jc: 5,
            jmin: 64,
            jmax: 256,
            jc_before_hs: 2,
            jc_after_i1: 1,
            jc_during_hs: 1,
            jc_after_hs: 1,
            junk_interval: Duration::from_millis(5),
            junk_random: true,
            mimic_protocol: "h3".into(),
            handshake_delay: Duration::from_millis(10),
            random_delay: true,
            delay_min: Duration::from_millis(1),
            delay_max: Duration::from_millis(10),
            sni_fragmentation: true,
            sni_fragment: 32,
            use_timestamp: true,
            use_nonce: true,
            randomize_initial: true,
            ..Self::default()
        }
    }

    /// Maximum cover at the cost of handshake latency.
    pub fn heavy() -> Self {
        Self {
            i1: "<b 0d0a0d0a><t><r 32>".into(),
            i2: "<b 474554202f20485454502f312e31><r 16>".into(),
            i3: "<r 64>".into(),
            fragment_size: 1280,
            fragment_initial: true,
            fragment_delay: Duration::from_millis(3),
            padding_min: 3,
            padding_max: 12,
            random_padding: true,
            jc: 10,
            jmin: 128,
            jmax: 512,
            jc_before_hs: 3,
            jc_after_i1: 2,
            jc_during_hs: 2,
            jc_after_hs: 3,
            junk_interval: Duration::from_millis(8),
            junk_random: true,
            handshake_delay: Duration::from_millis(20),
            random_delay: true,
            delay_min: Duration::from_millis(2),
            delay_max: Duration::from_millis(15),
            sni_fragmentation: true,
            sni_fragment: 16,
            use_timestamp: true,
            use_nonce: true,
            randomize_initial: true,
            ..Self::default()
        }
    }

    /// Looks like ordinary HTTPS: TLS ClientHello lead-in, small steady
    /// padding.
    pub fn stealth() -> Self {
        Self {
            i1: "<b 160301><r 2><b 0100>".into(),
            padding_min: 16,
            padding_max: 18,
            jc: 3,
            jmin: 40,
            jmax: 200,
            jc_before_hs: 1,
            jc_after_i1: 1,
            jc_after_hs: 1,
            junk_interval: Duration::from_millis(10),
            handshake_delay: Duration::from_millis(15),
            random_delay: true,
            delay_min: Duration::from_millis(5),
            delay_max: Duration::from_millis(25),
            ..Self::default()
        }
    }

    /// Tuned against aggressive stateful DPI.
    pub fn gfw() -> Self {
        Self {
            i1: "<b 0d0a0d0a><t><r 24>".into(),
            i2: "<r 48>".into(),
            fragment_size: 1200,
            fragment_delay: Duration::from_millis(3),
            padding_min: 8,
            padding_max: 12,
            random_padding: true,
            jc: 8,
            jmin: 64,
            jmax: 384,
            jc_before_hs: 3,
            jc_after_i1: 2,
            jc_during_hs: 2,
            jc_after_hs: 1,
            junk_interval: Duration::from_millis(3),
            junk_random: true,
            handshake_delay: Duration::from_millis(25),
            random_delay: true,
            delay_min: Duration::from_millis(1),
            delay_max: Duration::from_millis(20),
            sni_fragmentation: true,
            sni_fragment: 8,
            use_timestamp: true,
            use_nonce: true,
            randomize_initial: true,
            fake_loss: 0.02,
            ..Self::default()
        }
    }

    /// Lighter variant of the same pattern for simple enterprise firewalls.
    pub fn firewall() -> Self {
        Self {
            i1: "<b 0d0a0d0a><t><r 24>".into(),
            i2: "<r 48>".into(),
            fragment_size: 1200,
            fragment_delay: Duration::from_millis(2),
            padding_min: 2,
            padding_max: 6,
            jc: 6,
            jmin: 48,
            jmax: 190,
            jc_before_hs: 2,
            jc_after_i1: 2,
            jc_during_hs: 2,
            jc_after_hs: 2,
            junk_interval: Duration::from_millis(4),
            junk_random: true,
            handshake_delay: Duration::from_millis(5),
            random_delay: true,
            delay_min: Duration::from_millis(2),
            delay_max: Duration::from_millis(12),
            sni_fragment: 12,
            use_nonce: true,
            fake_loss: 0.01,
            ..Self::default()
        }
    }
}

/// Serialize `Duration` fields as humantime strings ("10ms") instead of
/// numeric nanoseconds, so config files stay readable.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_noop() {
        assert!(ObfuscationConfig::default().is_noop());
    }

    #[test]
    fn any_junk_phase_defeats_bypass() {
        let mut cfg = ObfuscationConfig::default();
        cfg.jc_after_hs = 1;
        assert!(!cfg.is_noop());

        let mut cfg = ObfuscationConfig::default();
        cfg.i1 = "<r 8>".into();
        assert!(!cfg.is_noop());

        let mut cfg = ObfuscationConfig::default();
        cfg.padding_max = 4;
        assert!(!cfg.is_noop());
    }

    #[test]
    fn durations_serialize_as_strings() {
        let json = serde_json::to_string(&ObfuscationConfig::medium()).unwrap();
        assert!(json.contains("\"handshake_delay\":\"10ms\""));
        assert!(json.contains("\"junk_interval\":\"5ms\""));
    }

    #[test]
    fn file_round_trip_is_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obfuscation.json");

        for name in ["none", "minimal", "light", "medium", "heavy", "stealth", "gfw", "firewall"] {
            let cfg = ObfuscationConfig::preset(name).unwrap();
            cfg.save(&path).unwrap();
            let loaded = ObfuscationConfig::load(&path).unwrap();
            assert_eq!(cfg, loaded, "preset {name} must round-trip");
        }
    }

    #[test]
    fn export_preset_rejects_unknown_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.json");
        assert!(ObfuscationConfig::export_preset("bogus", &path).is_err());
        assert!(ObfuscationConfig::export_preset("gfw", &path).is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: ObfuscationConfig =
            serde_json::from_str(r#"{"jc_before_hs": 2, "junk_interval": "7ms"}"#).unwrap();
        assert_eq!(cfg.jc_before_hs, 2);
        assert_eq!(cfg.junk_interval, Duration::from_millis(7));
        assert_eq!(cfg.padding_max, 0);
    }
}
