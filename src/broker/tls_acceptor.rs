//! TLS acceptor for the broker listener

use crate::error::{IotCoreError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::debug;

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Server-side TLS configuration
#[derive(Debug)]
pub struct TlsAcceptorConfig {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    /// ALPN protocols to advertise
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl TlsAcceptorConfig {
    #[must_use]
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, private_key: PrivateKeyDer<'static>) -> Self {
        Self {
            cert_chain,
            private_key,
            alpn_protocols: vec![b"mqtt".to_vec()],
        }
    }

    /// Loads certificate chain and key from PEM files
    ///
    /// # Errors
    ///
    /// See [`Self::load_cert_chain_from_file`] and
    /// [`Self::load_private_key_from_file`].
    pub async fn from_pem_files(cert_file: impl AsRef<Path>, key_file: impl AsRef<Path>) -> Result<Self> {
        let cert_chain = Self::load_cert_chain_from_file(cert_file).await?;
        let private_key = Self::load_private_key_from_file(key_file).await?;
        Ok(Self::new(cert_chain, private_key))
    }

    /// Loads a server certificate chain from a PEM file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds no certificate
    pub async fn load_cert_chain_from_file(
        path: impl AsRef<Path>,
    ) -> Result<Vec<CertificateDer<'static>>> {
        let path = path.as_ref();
        let cert_pem = tokio::fs::read(path).await?;
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .filter_map(std::result::Result::ok)
            .collect();

        if certs.is_empty() {
            return Err(IotCoreError::Configuration(format!(
                "No certificates found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    /// Loads the server private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds no private key
    pub async fn load_private_key_from_file(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>> {
        let path = path.as_ref();
        let key_pem = tokio::fs::read(path).await?;
        rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| IotCoreError::Configuration(format!("Failed to parse {}: {e}", path.display())))?
            .ok_or_else(|| {
                IotCoreError::Configuration(format!("No private key found in {}", path.display()))
            })
    }

    /// Builds a rustls `ServerConfig` offering TLS 1.3 and 1.2 only
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate and key do not form a usable
    /// identity
    pub fn build_server_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_no_client_auth()
        .with_single_cert(self.cert_chain.clone(), self.private_key.clone_key())
        .map_err(|e| IotCoreError::Configuration(format!("Failed to configure server cert: {e}")))?;

        config.alpn_protocols.clone_from(&self.alpn_protocols);
        Ok(config)
    }

    /// # Errors
    ///
    /// See [`Self::build_server_config`].
    pub fn build_acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.build_server_config()?)))
    }
}

/// Runs the server side of the TLS handshake, bounded by `limit`
///
/// # Errors
///
/// Returns `Timeout` or `ConnectionError` if the handshake does not complete
pub async fn accept_tls_connection(
    acceptor: &TlsAcceptor,
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    limit: Duration,
) -> Result<TlsStream<TcpStream>> {
    debug!("Starting TLS handshake with {peer_addr}");
    let stream = tokio::time::timeout(limit, acceptor.accept(tcp_stream))
        .await?
        .map_err(|e| IotCoreError::ConnectionError(format!("TLS handshake failed: {e}")))?;

    let version = stream.get_ref().1.protocol_version();
    debug!(addr = %peer_addr, ?version, "TLS handshake completed");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;
    use std::io::Write;

    fn self_signed() -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap()
    }

    #[test]
    fn test_build_with_generated_identity() {
        let certified = self_signed();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        let config = TlsAcceptorConfig::new(vec![certified.cert.der().clone()], key);
        let server_config = config.build_server_config().unwrap();
        assert_eq!(server_config.alpn_protocols, vec![b"mqtt".to_vec()]);
    }

    #[test]
    fn test_build_rejects_garbage() {
        let cert = CertificateDer::from(vec![0x30, 0x82, 0x01, 0x00]);
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(vec![0x30, 0x48, 0x02, 0x01]));
        assert!(TlsAcceptorConfig::new(vec![cert], key)
            .build_server_config()
            .is_err());
    }

    #[tokio::test]
    async fn test_load_pem_files() {
        let certified = self_signed();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(certified.cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let config = TlsAcceptorConfig::from_pem_files(cert_file.path(), key_file.path())
            .await
            .unwrap();
        assert_eq!(config.cert_chain.len(), 1);
        assert!(config.build_acceptor().is_ok());

        assert!(TlsAcceptorConfig::load_private_key_from_file(cert_file.path())
            .await
            .is_err());
    }
}
