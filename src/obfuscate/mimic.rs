//! Protocol-mimicry wrappers.
//!
//! Each wrapper prepends a minimal but well-formed header of a benign
//! protocol so that a DPI classifier keying on leading bytes sees something
//! unremarkable. Junk packets are stamped in place instead so their size
//! distribution is preserved.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Wire protocol to disguise tunnel datagrams as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimicProtocol {
    Dns,
    Https,
    Dtls,
    Stun,
}

impl MimicProtocol {
    /// Parse the config spelling; `https` and `h3` are the same disguise.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "dns" => Some(Self::Dns),
            "https" | "h3" => Some(Self::Https),
            "dtls" => Some(Self::Dtls),
            "stun" => Some(Self::Stun),
            _ => None,
        }
    }
}

/// STUN magic cookie (RFC 5389).
const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

/// Prepend a fake protocol header to a real packet.
pub fn wrap(protocol: MimicProtocol, packet: &[u8]) -> Vec<u8> {
    match protocol {
        MimicProtocol::Dns => wrap_dns(packet),
        MimicProtocol::Https => wrap_https(packet),
        MimicProtocol::Dtls => wrap_dtls(packet),
        MimicProtocol::Stun => wrap_stun(packet),
    }
}

/// 12-byte DNS header: random transaction id, standard-query flags, one
/// question.
fn wrap_dns(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + packet.len());
    out.extend_from_slice(&OsRng.gen::<u16>().to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0u8; 6]);
    out.extend_from_slice(packet);
    out
}

/// 5-byte TLS application-data record header with a correct length field.
fn wrap_https(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + packet.len());
    out.extend_from_slice(&[0x17, 0x03, 0x03]);
    out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    out.extend_from_slice(packet);
    out
}

/// 13-byte DTLS 1.2 record header: random epoch, zero sequence, real length.
fn wrap_dtls(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(13 + packet.len());
    out.extend_from_slice(&[0x17, 0xfe, 0xfd]);
    out.extend_from_slice(&OsRng.gen::<u16>().to_be_bytes());
    out.extend_from_slice(&[0u8; 6]);
    out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    out.extend_from_slice(packet);
    out
}

/// 20-byte STUN binding request with the magic cookie and a random
/// transaction id.
fn wrap_stun(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + packet.len());
    out.extend_from_slice(&0x0001u16.to_be_bytes());
    out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    out.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    let mut txid = [0u8; 12];
    OsRng.fill_bytes(&mut txid);
    out.extend_from_slice(&txid);
    out.extend_from_slice(packet);
    out
}

/// Overwrite the leading bytes of a junk packet so it resembles the
/// configured protocol without changing its length. Packets too short for
/// the header are left untouched.
pub fn stamp_junk(protocol: MimicProtocol, junk: &mut [u8]) {
    match protocol {
        MimicProtocol::Dns => {
            if junk.len() >= 12 {
                junk[..2].copy_from_slice(&OsRng.gen::<u16>().to_be_bytes());
                junk[2..4].copy_from_slice(&0x0100u16.to_be_bytes());
            }
        }
        MimicProtocol::Https => {
            if junk.len() >= 5 {
                junk[0] = 0x17;
                junk[1] = 0x03;
                junk[2] = 0x03;
            }
        }
        MimicProtocol::Dtls => {
            if junk.len() >= 13 {
                junk[0] = 0x17;
                junk[1] = 0xfe;
                junk[2] = 0xfd;
            }
        }
        MimicProtocol::Stun => {
            if junk.len() >= 20 {
                junk[..2].copy_from_slice(&0x0001u16.to_be_bytes());
                junk[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_h3_alias() {
        assert_eq!(MimicProtocol::parse("h3"), Some(MimicProtocol::Https));
        assert_eq!(MimicProtocol::parse("https"), Some(MimicProtocol::Https));
        assert_eq!(MimicProtocol::parse(""), None);
        assert_eq!(MimicProtocol::parse("smtp"), None);
    }

    #[test]
    fn https_record_length_matches_payload() {
        let wrapped = wrap(MimicProtocol::Https, &[0xaa; 300]);
        assert_eq!(wrapped.len(), 305);
        assert_eq!(wrapped[0], 0x17);
        assert_eq!(u16::from_be_bytes([wrapped[3], wrapped[4]]), 300);
    }

    #[test]
    fn dns_header_is_standard_query() {
        let wrapped = wrap(MimicProtocol::Dns, b"payload");
        assert_eq!(wrapped.len(), 12 + 7);
        assert_eq!(&wrapped[2..4], &[0x01, 0x00]);
        assert_eq!(&wrapped[4..6], &[0x00, 0x01]);
    }

    #[test]
    fn stun_header_carries_magic_cookie() {
        let wrapped = wrap(MimicProtocol::Stun, &[1, 2, 3]);
        assert_eq!(wrapped.len(), 23);
        assert_eq!(&wrapped[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
    }

    #[test]
    fn dtls_header_is_thirteen_bytes() {
        let wrapped = wrap(MimicProtocol::Dtls, &[0u8; 40]);
        assert_eq!(wrapped.len(), 53);
        assert_eq!(&wrapped[..3], &[0x17, 0xfe, 0xfd]);
        assert_eq!(u16::from_be_bytes([wrapped[11], wrapped[12]]), 40);
    }

    #[test]
    fn stamping_preserves_length() {
        let mut junk = vec![0u8; 64];
        stamp_junk(MimicProtocol::Stun, &mut junk);
        assert_eq!(junk.len(), 64);
        assert_eq!(&junk[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());

        let mut tiny = vec![0u8; 4];
        stamp_junk(MimicProtocol::Stun, &mut tiny);
        assert_eq!(tiny, vec![0u8; 4]);
    }
}
