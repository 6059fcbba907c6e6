//! QUIC packet classification from raw header bytes.
//!
//! The obfuscation engine only needs to know which phase of the handshake a
//! datagram belongs to; it never decrypts or parses beyond the first header
//! byte. Classification follows RFC 9000 header encoding: long-header
//! packets carry their type in bits 4-5 of the first byte, anything with the
//! high bit clear is a short-header (1-RTT) packet.

/// Coarse QUIC packet category derived from the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    OneRtt,
    VersionNegotiation,
    Unknown,
}

/// Classify a raw datagram by its QUIC header bits.
///
/// Pure and lock-free; safe to call from any task. Datagrams too short to
/// carry a long header (fewer than 5 bytes) classify as `Unknown`.
pub fn classify(packet: &[u8]) -> PacketKind {
    let Some(&first) = packet.first() else {
        return PacketKind::Unknown;
    };

    // Long header: fixed bit aside, type lives in bits 4-5.
    if first & 0x80 != 0 {
        if packet.len() < 5 {
            return PacketKind::Unknown;
        }
        return match (first >> 4) & 0x03 {
            0x00 => PacketKind::Initial,
            0x01 => PacketKind::ZeroRtt,
            0x02 => PacketKind::Handshake,
            _ => PacketKind::Retry,
        };
    }

    // Short header carries application data after the handshake.
    PacketKind::OneRtt
}
