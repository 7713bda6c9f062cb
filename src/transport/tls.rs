//! Mutual-TLS client configuration.
//!
//! The client always presents its [`Identity`](super::Identity). How much of the
//! daemon's certificate is checked depends on [`PeerVerification`]:
//!
//! | level          | certificate present | chain to roots | hostname |
//! |----------------|---------------------|----------------|----------|
//! | `PresenceOnly` | yes                 | no             | no       |
//! | `TrustedChain` | yes                 | yes            | no       |
//! | `Strict`       | yes                 | yes            | yes      |
//!
//! Every level also verifies the handshake signature, so the peer must hold the
//! key of the certificate it presents.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::Deserialize;

use super::Endpoint;
use crate::error::{DaemonError, Result};

/// How strictly the daemon's certificate is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerVerification {
    /// Any certificate, as long as one is presented.
    PresenceOnly,
    /// Chain must lead to a configured root; the name is not checked.
    ///
    /// Daemons with a private CA issue certificates for a fixed name that
    /// rarely matches the host being dialled.
    #[default]
    TrustedChain,
    /// Full WebPKI validation including the hostname.
    Strict,
}

impl PeerVerification {
    /// Whether this level needs at least one trusted root.
    pub fn requires_roots(self) -> bool {
        !matches!(self, PeerVerification::PresenceOnly)
    }
}

/// Build the rustls client configuration for `endpoint`.
pub fn client_config(endpoint: &Endpoint) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = server_verifier(endpoint.verification(), endpoint.roots(), &provider)?;
    let identity = endpoint.identity();

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.cert_chain().to_vec(), identity.key().clone_key())?;

    Ok(config)
}

/// Build the verifier for a verification level.
pub fn server_verifier(
    verification: PeerVerification,
    roots: &[CertificateDer<'static>],
    provider: &Arc<CryptoProvider>,
) -> Result<Arc<dyn ServerCertVerifier>> {
    if verification == PeerVerification::PresenceOnly {
        return Ok(Arc::new(PresenceOnly {
            algorithms: provider.signature_verification_algorithms,
        }));
    }

    if roots.is_empty() {
        return Err(DaemonError::Connection(format!(
            "{:?} verification needs at least one trusted root",
            verification
        )));
    }
    let mut store = RootCertStore::empty();
    for root in roots {
        store.add(root.clone())?;
    }
    let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(store), provider.clone())
        .build()
        .map_err(|e| DaemonError::Connection(format!("invalid trusted roots: {}", e)))?;

    match verification {
        PeerVerification::Strict => Ok(webpki),
        _ => Ok(Arc::new(IgnoreName { inner: webpki })),
    }
}

#[derive(Debug)]
struct PresenceOnly {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PresenceOnly {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref().is_empty() {
            return Err(rustls::Error::InvalidCertificate(CertificateError::BadEncoding));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct IgnoreName {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))
            | Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext {
                ..
            })) => {
                tracing::debug!(?server_name, "accepting certificate issued for another name");
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
