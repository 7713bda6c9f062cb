//! Connection target and client credentials.

use std::fmt;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_tungstenite::tungstenite::http::Uri;

use super::PeerVerification;
use crate::error::{DaemonError, Result};

/// Default daemon port when the URI does not carry one.
pub const DEFAULT_WSS_PORT: u16 = 443;

/// Client certificate chain and private key presented during the handshake.
///
/// Loading these from disk is up to the caller; this is the ready-made
/// credential.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Create an identity from DER-encoded material.
    ///
    /// The leaf certificate comes first in `cert_chain`.
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        if cert_chain.is_empty() {
            return Err(DaemonError::Connection(
                "client identity needs at least one certificate".to_string(),
            ));
        }
        Ok(Self { cert_chain, key })
    }

    /// Certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Private key matching the leaf certificate.
    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("certificates", &self.cert_chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Where to connect and how to authenticate.
///
/// Immutable once built; share it behind an `Arc` if several clients dial the
/// same daemon.
#[derive(Debug, Clone)]
pub struct Endpoint {
    uri: String,
    host: String,
    port: u16,
    identity: Identity,
    roots: Vec<CertificateDer<'static>>,
    verification: PeerVerification,
}

impl Endpoint {
    /// Create an endpoint for a `wss://host[:port][/path]` URI.
    pub fn new(uri: &str, identity: Identity) -> Result<Self> {
        let parsed: Uri = uri
            .parse()
            .map_err(|e| DaemonError::Connection(format!("invalid URI '{}': {}", uri, e)))?;

        match parsed.scheme_str() {
            Some("wss") => {}
            other => {
                return Err(DaemonError::Connection(format!(
                    "unsupported scheme {:?} in '{}', expected wss",
                    other.unwrap_or(""),
                    uri
                )))
            }
        }
        let host = parsed
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DaemonError::Connection(format!("no host in '{}'", uri)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed.port_u16().unwrap_or(DEFAULT_WSS_PORT);

        Ok(Self {
            uri: uri.to_string(),
            host,
            port,
            identity,
            roots: Vec::new(),
            verification: PeerVerification::default(),
        })
    }

    /// Trust `root` when validating the daemon's chain.
    pub fn with_root(mut self, root: CertificateDer<'static>) -> Self {
        self.roots.push(root);
        self
    }

    /// Trust every certificate in `roots`.
    pub fn with_roots(mut self, roots: impl IntoIterator<Item = CertificateDer<'static>>) -> Self {
        self.roots.extend(roots);
        self
    }

    /// Set the peer verification level.
    pub fn with_verification(mut self, verification: PeerVerification) -> Self {
        self.verification = verification;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn roots(&self) -> &[CertificateDer<'static>] {
        &self.roots
    }

    pub fn verification(&self) -> PeerVerification {
        self.verification
    }
}
