//! Signature packet templates.
//!
//! A template is a short tag string compiled into concrete bytes each time a
//! signature packet is sent, so that repeated handshakes do not produce
//! byte-identical decoys. Supported tags:
//!
//! - `<b HEX>`  literal bytes from hex (optional `0x` prefix, spaces ignored)
//! - `<c>`      4-byte big-endian Unix-second counter
//! - `<t>`      4-byte big-endian Unix-second timestamp
//! - `<r N>`    N cryptographically random bytes (N capped at 1000)
//! - `<n>`      8-byte nonce from the high-resolution clock
//! - `<x K>`    XOR everything produced so far with the 8-bit key K
//!
//! Tags expand left to right in a single pass. Whitespace between the tag
//! letter and its argument is optional (`<b 0d0a>` and `<b0d0a>` are the
//! same); unknown tag letters are skipped so configs stay
//! forward-compatible.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on a single `<r N>` expansion.
const MAX_RANDOM_RUN: usize = 1000;

/// Expand a signature template into wire bytes.
///
/// An empty template yields an empty result. Only a malformed `<b>` hex
/// payload is an error; malformed numeric arguments fall back to zero.
pub fn expand_template(template: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let Some(end) = template[i..].find('>').map(|off| i + off) else {
            break;
        };
        let body = template[i + 1..end].trim();
        i = end + 1;

        // The tag is the first character; the argument may follow with or
        // without whitespace, as in <b 0d0a> and <b0d0a>.
        let mut chars = body.chars();
        let Some(tag) = chars.next() else {
            continue;
        };
        let arg = chars.as_str().trim();

        match tag {
            'b' => expand_hex(arg, &mut out)?,
            'c' | 't' => out.extend_from_slice(&unix_seconds().to_be_bytes()),
            'r' => {
                let n = arg.parse::<usize>().unwrap_or(0).min(MAX_RANDOM_RUN);
                if n > 0 {
                    let start = out.len();
                    out.resize(start + n, 0);
                    OsRng.fill_bytes(&mut out[start..]);
                }
            }
            'n' => out.extend_from_slice(&clock_nonce().to_be_bytes()),
            'x' => {
                let key = arg.parse::<u8>().unwrap_or(0);
                for byte in &mut out {
                    *byte ^= key;
                }
            }
            // Unknown tag letters are ignored, not errors.
            _ => {}
        }
    }

    Ok(out)
}

fn expand_hex(arg: &str, out: &mut Vec<u8>) -> Result<()> {
    if arg.is_empty() {
        return Ok(());
    }
    let cleaned: String = arg
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let decoded = hex::decode(&cleaned)
        .with_context(|| format!("invalid hex in <b> tag: {arg:?}"))?;
    out.extend_from_slice(&decoded);
    Ok(())
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn clock_nonce() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
