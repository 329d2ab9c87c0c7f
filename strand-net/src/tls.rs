//! TLS configuration for clients and servers.
//!
//! Certificates and keys are read from PEM files. Client configs verify the
//! server against the trust file, or accept any certificate when
//! `trust_all` is set.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strand_core::{Error, Result};

/// Client certificate policy for servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    /// Do not ask for a client certificate
    #[default]
    None,
    /// Ask for a certificate but accept clients without one
    Request,
    /// Reject clients without a trusted certificate
    Required,
}

/// TLS settings shared by clients and servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM certificate chain presented to the peer
    pub cert_path: Option<PathBuf>,
    /// PEM private key for `cert_path`
    pub key_path: Option<PathBuf>,
    /// PEM certificates trusted when verifying the peer
    pub trust_path: Option<PathBuf>,
    /// Accept any server certificate (clients only)
    pub trust_all: bool,
    pub client_auth: ClientAuth,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(path.into());
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn trust_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_path = Some(path.into());
        self
    }

    pub fn trust_all(mut self, trust_all: bool) -> Self {
        self.trust_all = trust_all;
        self
    }

    pub fn client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }

    /// Check that the settings can produce a client config.
    pub fn validate_client(&self) -> Result<()> {
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(Error::Config(
                "client certificate and key must be set together".into(),
            ));
        }
        if !self.trust_all && self.trust_path.is_none() {
            return Err(Error::Config(
                "TLS client needs trust_path or trust_all".into(),
            ));
        }
        Ok(())
    }

    /// Check that the settings can produce a server config.
    pub fn validate_server(&self) -> Result<()> {
        if self.cert_path.is_none() || self.key_path.is_none() {
            return Err(Error::Config(
                "TLS server needs cert_path and key_path".into(),
            ));
        }
        if self.client_auth != ClientAuth::None && self.trust_path.is_none() {
            return Err(Error::Config(
                "client authentication needs trust_path".into(),
            ));
        }
        Ok(())
    }

    /// Build a rustls client config.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        self.validate_client()?;
        let provider = Arc::new(ring::default_provider());

        let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?;

        let builder = if self.trust_all {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier { provider }))
        } else {
            builder.with_root_certificates(self.root_store()?)
        };

        let config = match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(|e| Error::Tls(format!("invalid client certificate: {}", e)))?,
            _ => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }

    /// Build a rustls server config.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        self.validate_server()?;
        let provider = Arc::new(ring::default_provider());

        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?;

        let builder = match self.client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Request | ClientAuth::Required => {
                let verifier = WebPkiClientVerifier::builder_with_provider(
                    Arc::new(self.root_store()?),
                    provider,
                );
                let verifier = if self.client_auth == ClientAuth::Request {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                let verifier = verifier
                    .build()
                    .map_err(|e| Error::Tls(format!("invalid client verifier: {}", e)))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let (Some(cert), Some(key)) = (&self.cert_path, &self.key_path) else {
            return Err(Error::Config("TLS server needs cert_path and key_path".into()));
        };
        let config = builder
            .with_single_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| Error::Tls(format!("invalid server certificate: {}", e)))?;
        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let path = self
            .trust_path
            .as_ref()
            .ok_or_else(|| Error::Config("trust_path is not set".into()))?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("invalid trusted certificate: {}", e)))?;
        }
        Ok(roots)
    }
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::Tls(format!("failed to open certificate file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let chain = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificates: {}", e)))?;
    if chain.is_empty() {
        return Err(Error::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(chain)
}

/// Load private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("failed to open key file {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("failed to read private key: {}", e)))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

/// Accepts every server certificate; signatures are still checked.
#[derive(Debug)]
struct TrustAllVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
