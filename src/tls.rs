//! Process-wide TLS configurations shared by every session.
//!
//! One pair per process: a connector config for the upstream leg (no peer
//! verification; the upstream is pinned by address) and an acceptor config
//! for the client leg, backed by a self-signed certificate generated at
//! startup. Both are immutable once built and cheap to share.

use std::sync::Arc;

use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

/// Certificate validity window in days.
const CERT_VALIDITY_DAYS: i64 = 365;

/// The client-side and server-side TLS configurations for the proxy.
pub struct TlsContextPair {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
}

impl TlsContextPair {
    /// Builds both configurations. Failure here is fatal at process start.
    pub fn new() -> Result<Self, TlsInitError> {
        let client = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier::NoVerifier))
            .with_no_client_auth();

        let server = Self::self_signed_server_config()?;

        info!("TLS contexts initialized");
        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }

    /// Server config with a fresh self-signed certificate, CN `localhost`,
    /// valid for one year from now. Clients of the proxy never verify it;
    /// it exists so the handshake has a credential to present.
    fn self_signed_server_config() -> Result<ServerConfig, TlsInitError> {
        let key_pair = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "localhost");
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;
        let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key.into())?;
        Ok(config)
    }

    /// Connector for the proxy-to-upstream leg.
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    /// Acceptor for the client-to-proxy leg.
    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

mod verifier {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any upstream certificate. The upstream's identity is pinned
    /// by its configured address, not by its certificate.
    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// TLS initialization error types.
#[derive(Debug)]
pub enum TlsInitError {
    Keygen(rcgen::Error),
    Install(rustls::Error),
}

impl std::fmt::Display for TlsInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsInitError::Keygen(e) => write!(f, "certificate generation failed: {}", e),
            TlsInitError::Install(e) => write!(f, "credential installation failed: {}", e),
        }
    }
}

impl std::error::Error for TlsInitError {}

impl From<rcgen::Error> for TlsInitError {
    fn from(e: rcgen::Error) -> Self {
        TlsInitError::Keygen(e)
    }
}

impl From<rustls::Error> for TlsInitError {
    fn from(e: rustls::Error) -> Self {
        TlsInitError::Install(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_pair_builds() {
        let pair = TlsContextPair::new().unwrap();
        // Both handles must be independently cloneable for per-session use.
        let _ = pair.connector().clone();
        let _ = pair.acceptor().clone();
    }
}
