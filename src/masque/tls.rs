//! Device identity certificate, pinned verifier, and QUIC client config.

use anyhow::{Context, Result};
use base64::prelude::*;
use quinn::{ClientConfig as QuinnClientConfig, TransportConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use x509_parser::prelude::FromDer;

/// The relay speaks MASQUE over HTTP/3.
const ALPN: &[u8] = b"h3";

/// EC P-256 keypair plus a self-signed certificate presented as the client
/// identity. The relay matches on the enrolled public key, not the cert
/// chain, so the certificate itself carries no trust.
pub struct DeviceIdentity {
    key_pair: rcgen::KeyPair,
    cert_der: CertificateDer<'static>,
}

impl DeviceIdentity {
    pub fn generate() -> Result<Self> {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .context("generating device key pair")?;
        Self::with_key_pair(key_pair)
    }

    /// Rebuild the identity from the stored base64 PKCS#8 DER key.
    pub fn from_private_key_b64(encoded: &str) -> Result<Self> {
        let der = BASE64_STANDARD
            .decode(encoded)
            .context("decoding stored private key")?;
        let key_pair =
            rcgen::KeyPair::try_from(der.as_slice()).context("parsing stored private key")?;
        Self::with_key_pair(key_pair)
    }

    fn with_key_pair(key_pair: rcgen::KeyPair) -> Result<Self> {
        let mut params = rcgen::CertificateParams::new(Vec::default())
            .context("building certificate parameters")?;
        params.serial_number = Some(rcgen::SerialNumber::from(0u64));
        // Short-lived throwaway cert; the relay only pins the key.
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::hours(24);
        let cert = params
            .self_signed(&key_pair)
            .context("self-signing device certificate")?;
        let cert_der = cert.der().clone();
        Ok(Self { key_pair, cert_der })
    }

    /// SPKI DER, the form the enrollment call expects.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.key_pair.public_key_der()
    }

    pub fn private_key_b64(&self) -> String {
        BASE64_STANDARD.encode(self.key_pair.serialize_der())
    }

    fn client_auth_parts(&self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let key = PrivatePkcs8KeyDer::from(self.key_pair.serialize_der());
        (vec![self.cert_der.clone()], PrivateKeyDer::from(key))
    }
}

/// Build the rustls client config: TLS 1.3 only, client cert attached,
/// server verified against the pinned relay key when one is supplied and
/// the webpki roots otherwise.
pub fn build_tls_config(
    identity: &DeviceIdentity,
    pinned_spki: Option<Vec<u8>>,
) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let (certs, key) = identity.client_auth_parts();

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let mut config = match pinned_spki {
        Some(spki) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier::new(spki, provider)))
            .with_client_auth_cert(certs, key)?,
        None => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(roots)
                .with_client_auth_cert(certs, key)?
        }
    };
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Quinn config tuned for the relay path: fixed MTU sized for the relay's
/// 1242-byte budget with discovery off, a 30s keep-alive against NAT
/// timeouts, and datagram support on.
pub fn build_quic_config(tls: rustls::ClientConfig) -> Result<QuinnClientConfig> {
    let mut transport = TransportConfig::default();
    transport.initial_mtu(1242);
    transport.min_mtu(1242);
    transport.mtu_discovery_config(None);
    transport.keep_alive_interval(Some(Duration::from_secs(30)));
    transport.max_idle_timeout(Some(Duration::from_secs(60).try_into()?));
    transport.max_concurrent_bidi_streams(10u32.into());
    transport.max_concurrent_uni_streams(5u32.into());
    transport.datagram_receive_buffer_size(Some(65536));
    transport.datagram_send_buffer_size(65536);

    let mut config = QuinnClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls)?,
    ));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Accepts exactly one server: the certificate whose SubjectPublicKeyInfo
/// matches the key handed out at enrollment. Names and chains are ignored,
/// signatures are still verified.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    expected_spki: Vec<u8>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl PinnedServerVerifier {
    pub fn new(expected_spki: Vec<u8>, provider: Arc<rustls::crypto::CryptoProvider>) -> Self {
        Self {
            expected_spki,
            provider,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(format!("malformed server certificate: {e}")))?;
        if cert.public_key().raw != self.expected_spki.as_slice() {
            return Err(rustls::Error::General(
                "server key does not match pinned relay key".into(),
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
