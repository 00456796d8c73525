//! Server certificate sourcing for the in-band TLS upgrade.

use std::sync::Arc;

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Source of the TLS configuration presented to postgres clients.
/// Consulted once at startup.
pub trait TlsProvider: Send + Sync {
    fn server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>>;
}

/// PEM key/certificate pair from disk.
pub struct FileTlsProvider {
    key_path: String,
    cert_path: String,
}

impl FileTlsProvider {
    pub fn new(key_path: &str, cert_path: &str) -> Self {
        Self {
            key_path: key_path.to_owned(),
            cert_path: cert_path.to_owned(),
        }
    }
}

impl TlsProvider for FileTlsProvider {
    fn server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let key = {
            let key_bytes = std::fs::read(&self.key_path)
                .with_context(|| format!("failed to read TLS key at '{}'", self.key_path))?;
            rustls_pemfile::private_key(&mut &key_bytes[..])
                .with_context(|| format!("failed to parse TLS key at '{}'", self.key_path))?
                .with_context(|| format!("no private key found in '{}'", self.key_path))?
        };

        let cert_chain = {
            let cert_bytes = std::fs::read(&self.cert_path)
                .with_context(|| format!("failed to read TLS cert at '{}'", self.cert_path))?;
            rustls_pemfile::certs(&mut &cert_bytes[..])
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| {
                    format!("failed to parse certificate chain at '{}'", self.cert_path)
                })?
        };

        server_config(cert_chain, key)
    }
}

/// Freshly generated self-signed certificate, for development setups where
/// no real certificate is at hand.
pub struct SelfSignedTlsProvider;

impl TlsProvider for SelfSignedTlsProvider {
    fn server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
            .context("failed to generate a self-signed certificate")?;

        let cert = certified.cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

        server_config(vec![cert], key.into())
    }
}

/// Build the server config used by the acceptor. TLS 1.2 stays enabled for
/// older client libraries.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
    .context("ring should support TLS1.2 and TLS1.3")?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .context("invalid certificate/key pair")?;

    Ok(Arc::new(config))
}
