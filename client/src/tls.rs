//! # Client TLS Setup
//!
//! Tunnel servers typically run self-signed certificates, so the default
//! connector accepts any certificate. When a `--cert-pin` fingerprint is
//! configured, the leaf certificate must instead hash (SHA-256 over the
//! DER encoding) to exactly that value; anything else refuses the
//! connection.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct};
use sha2::{Digest, Sha256};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

/// Builds the connector used for the control channel and back-channels.
pub fn build_connector(cert_pin: Option<&str>) -> anyhow::Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let verifier: Arc<dyn ServerCertVerifier> = match cert_pin {
        Some(pin) => {
            info!("certificate pinning enabled");
            Arc::new(PinnedCertVerifier::new(provider.clone(), pin)?)
        }
        None => Arc::new(InsecureCertVerifier(provider.clone())),
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Extracts the TLS server name from a `host:port` address.
pub fn server_name(addr: &str) -> anyhow::Result<ServerName<'static>> {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    ServerName::try_from(host.to_string())
        .map_err(|_| anyhow::anyhow!("invalid server name: {}", host))
}

/// Accepts any server certificate. Signatures are still verified so the
/// session is encrypted against passive observers; there is simply no
/// identity check.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
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
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Requires the leaf certificate's SHA-256 fingerprint to match the
/// configured pin.
#[derive(Debug)]
struct PinnedCertVerifier {
    provider: Arc<CryptoProvider>,
    expected: [u8; 32],
}

impl PinnedCertVerifier {
    fn new(provider: Arc<CryptoProvider>, pin: &str) -> anyhow::Result<Self> {
        let expected = decode_fingerprint(pin)
            .ok_or_else(|| anyhow::anyhow!("cert pin must be 64 hex characters"))?;
        Ok(Self { provider, expected })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
        if actual == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!("server certificate fingerprint mismatch");
            Err(rustls::Error::General(
                "certificate fingerprint mismatch".into(),
            ))
        }
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn decode_fingerprint(pin: &str) -> Option<[u8; 32]> {
    hex::decode(pin.trim()).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_decodes() {
        let pin = "00ff".repeat(16);
        let decoded = decode_fingerprint(&pin).unwrap();
        assert_eq!(decoded[0], 0x00);
        assert_eq!(decoded[1], 0xff);
    }

    #[test]
    fn bad_fingerprints_are_rejected() {
        assert!(decode_fingerprint("abcd").is_none());
        assert!(decode_fingerprint(&"zz".repeat(32)).is_none());
    }

    #[test]
    fn server_name_drops_the_port() {
        assert!(server_name("example.com:8882").is_ok());
        assert!(server_name("127.0.0.1:8882").is_ok());
    }
}
