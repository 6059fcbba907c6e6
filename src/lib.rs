//! # mirage
//!
//! Censorship-resistant IP tunnel client speaking MASQUE (Connect-IP over
//! QUIC) with wire-level traffic obfuscation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Client                            │
//! │  ┌───────────┐   ┌─────────────────┐   ┌─────────────┐  │
//! │  │ interface │───│ forwarding loops │───│ MasqueAdapter│ │
//! │  └───────────┘   │  + recovery task │   └──────┬──────┘  │
//! │                  └─────────────────┘          │          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │         QUIC datagrams (capsule framing)           │  │
//! │  └────────────────────────┬───────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  ObfuscatedSocket: junk, padding, mimicry, frags   │  │
//! │  └────────────────────────┬───────────────────────────┘  │
//! └───────────────────────────┼──────────────────────────────┘
//!                             │ UDP
//!                             ↓
//!                           relay
//! ```
//!
//! ## Stealth features
//!
//! - **Handshake camouflage**: decoy junk and signature packets around the
//!   QUIC Initial
//! - **Protocol mimicry**: DNS/TLS/DTLS/STUN framing on the wire
//! - **Padding and jitter**: size and timing normalization
//! - **Initial fragmentation**: splits the handshake fingerprint

pub mod forward;
pub mod iface;
pub mod masque;
pub mod obfuscate;
