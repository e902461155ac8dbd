use crate::error::{IotCoreError, Result};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};

/// TLS versions a device will negotiate. Nothing below 1.2 is offered.
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Splits a broker endpoint into host and port
///
/// Only TLS schemes are accepted (`mqtts://`, `ssl://`); a bare `host:port`
/// is treated as TLS too. Plain `mqtt://` and `tcp://` are rejected because
/// the credential must never travel in clear text.
///
/// # Errors
///
/// Returns `Configuration` for a plain-text scheme, an empty host or an
/// invalid port.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let rest = if let Some(rest) = endpoint.strip_prefix("mqtts://") {
        rest
    } else if let Some(rest) = endpoint.strip_prefix("ssl://") {
        rest
    } else if endpoint.starts_with("mqtt://") || endpoint.starts_with("tcp://") {
        return Err(IotCoreError::Configuration(format!(
            "endpoint '{endpoint}' is not TLS; use mqtts:// or ssl://"
        )));
    } else {
        endpoint
    };

    let (host, port) = match rest.rfind(':') {
        Some(colon_pos) => {
            let port_str = &rest[colon_pos + 1..];
            let port = port_str.parse::<u16>().map_err(|_| {
                IotCoreError::Configuration(format!("Invalid port: {port_str}"))
            })?;
            (&rest[..colon_pos], port)
        }
        None => (rest, 8883),
    };

    if host.is_empty() {
        return Err(IotCoreError::Configuration(format!(
            "endpoint '{endpoint}' has no host"
        )));
    }
    Ok((host.to_string(), port))
}

/// Reads every certificate in a PEM file
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no certificate.
pub fn load_certs_pem(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let pem = std::fs::read(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| IotCoreError::Tls(format!("Failed to parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(IotCoreError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// TLS client configuration for a device connection
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub hostname: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Extra trust anchors, e.g. a self-signed broker certificate
    pub root_certs: Vec<CertificateDer<'static>>,
    /// Whether to trust the bundled public web roots
    pub use_web_roots: bool,
}

impl TlsConfig {
    #[must_use]
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            root_certs: Vec::new(),
            use_web_roots: true,
        }
    }

    /// Builds the configuration from an endpoint URL
    ///
    /// # Errors
    ///
    /// See [`parse_endpoint`].
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let (host, port) = parse_endpoint(endpoint)?;
        Ok(Self::new(host, port))
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_root_cert(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certs.push(cert);
        self
    }

    #[must_use]
    pub fn with_web_roots(mut self, use_web_roots: bool) -> Self {
        self.use_web_roots = use_web_roots;
        self
    }

    /// Adds every certificate in a PEM file as a trust anchor
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds no certificate.
    pub fn load_ca_cert_pem(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.root_certs.extend(load_certs_pem(path)?);
        Ok(())
    }

    /// Builds the rustls client configuration
    ///
    /// # Errors
    ///
    /// Returns `Tls` if a root certificate is invalid or no trust anchor is
    /// configured at all.
    pub fn build_client_config(&self) -> Result<ClientConfig> {
        let mut root_store = RootCertStore::empty();
        if self.use_web_roots {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        for cert in &self.root_certs {
            root_store
                .add(cert.clone())
                .map_err(|e| IotCoreError::Tls(format!("Failed to add root cert: {e}")))?;
        }
        if root_store.is_empty() {
            return Err(IotCoreError::Tls("No trust anchors configured".to_string()));
        }

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        Ok(config)
    }

    /// Opens a TCP connection and performs the TLS handshake
    ///
    /// Both steps are bounded by `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if either step takes too long and `ConnectionError`
    /// if the handshake fails.
    pub async fn connect(&self) -> Result<TlsStream<TcpStream>> {
        let connector = TlsConnector::from(Arc::new(self.build_client_config()?));
        let domain = ServerName::try_from(self.hostname.clone())
            .map_err(|_| IotCoreError::Configuration("Invalid server hostname".to_string()))?;

        let tcp_stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.hostname.as_str(), self.port)),
        )
        .await
        .map_err(|_| IotCoreError::Timeout)??;
        tcp_stream.set_nodelay(true)?;

        let tls_stream = timeout(self.connect_timeout, connector.connect(domain, tcp_stream))
            .await
            .map_err(|_| IotCoreError::Timeout)?
            .map_err(|e| IotCoreError::ConnectionError(format!("TLS handshake failed: {e}")))?;

        tracing::debug!(host = %self.hostname, port = self.port, "TLS session established");
        Ok(tls_stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("mqtts://mqtt.googleapis.com:8883").unwrap(),
            ("mqtt.googleapis.com".to_string(), 8883)
        );
        assert_eq!(
            parse_endpoint("ssl://localhost:18883").unwrap(),
            ("localhost".to_string(), 18883)
        );
        assert_eq!(
            parse_endpoint("mqtts://broker.example").unwrap(),
            ("broker.example".to_string(), 8883)
        );
    }

    #[test]
    fn test_parse_endpoint_rejects_plain_text() {
        for endpoint in ["mqtt://localhost:1883", "tcp://localhost:1883"] {
            let err = parse_endpoint(endpoint).unwrap_err();
            assert!(err.is_configuration(), "{endpoint}");
        }
        assert!(parse_endpoint("mqtts://host:notaport").is_err());
        assert!(parse_endpoint("mqtts://:8883").is_err());
    }

    #[test]
    fn test_client_config_requires_anchor() {
        let config = TlsConfig::new("localhost", 8883).with_web_roots(false);
        assert!(matches!(
            config.build_client_config(),
            Err(IotCoreError::Tls(_))
        ));
        assert!(TlsConfig::new("localhost", 8883)
            .build_client_config()
            .is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let mut config = TlsConfig::new("localhost", 8883);
        assert!(config.load_ca_cert_pem("/nonexistent/ca.pem").is_err());
    }
}
