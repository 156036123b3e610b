//! Rustls-backed server-side TLS upgrade.

use crate::traits::{BoxedIo, TlsUpgrade, TransportError};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// TLS upgrader built from PEM certificate and key files.
pub struct RustlsUpgrade {
    acceptor: TlsAcceptor,
}

impl RustlsUpgrade {
    /// Load certificate chain and private key from PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read or parsed, or if the
    /// material does not form a usable server identity.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        let cert_file = std::fs::File::open(cert_path.as_ref())?;
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut io::BufReader::new(cert_file))
                .collect::<Result<_, _>>()
                .map_err(|e| TransportError::TlsMaterial(e.to_string()))?;

        let key_file = std::fs::File::open(key_path.as_ref())?;
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut io::BufReader::new(key_file))
                .map_err(|e| TransportError::TlsMaterial(e.to_string()))?
                .ok_or_else(|| TransportError::TlsMaterial("no private key found".into()))?;

        let provider = Arc::new(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsMaterial(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsMaterial(e.to_string()))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl TlsUpgrade for RustlsUpgrade {
    async fn upgrade(&self, io: BoxedIo) -> io::Result<BoxedIo> {
        let stream = self.acceptor.accept(io).await?;
        debug!("TLS handshake completed");
        Ok(Box::new(stream))
    }
}
