//! Broker configuration
//!
//! Configuration for the verifying broker, following the same builder
//! patterns as the device side.

use crate::error::{IotCoreError, Result};
use crate::packet::connect::{PROTOCOL_LEVEL_V31, PROTOCOL_LEVEL_V311};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// TLS listener address
    pub bind_address: SocketAddr,

    /// Server certificate and key files. Required by [`MqttBroker::bind`];
    /// in-memory identities go through [`MqttBroker::bind_with_tls`].
    ///
    /// [`MqttBroker::bind`]: crate::broker::MqttBroker::bind
    /// [`MqttBroker::bind_with_tls`]: crate::broker::MqttBroker::bind_with_tls
    pub tls_config: Option<BrokerTlsConfig>,

    /// Protocol levels accepted in CONNECT; anything else gets return code 1
    pub allowed_protocol_levels: Vec<u8>,

    /// Bound on TLS handshake plus the first CONNECT packet
    pub connect_timeout: Duration,
}

/// Server TLS identity loaded from PEM files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerTlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8883)),
            tls_config: None,
            allowed_protocol_levels: vec![PROTOCOL_LEVEL_V311],
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bind_address(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.bind_address = addr.into();
        self
    }

    #[must_use]
    pub fn with_tls_files(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.tls_config = Some(BrokerTlsConfig {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        });
        self
    }

    #[must_use]
    pub fn with_allowed_protocol_levels(mut self, levels: Vec<u8>) -> Self {
        self.allowed_protocol_levels = levels;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn allows_protocol_level(&self, level: u8) -> bool {
        self.allowed_protocol_levels.contains(&level)
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty or unknown protocol level list or
    /// a zero connect timeout.
    pub fn validate(&self) -> Result<()> {
        if self.allowed_protocol_levels.is_empty() {
            return Err(IotCoreError::Configuration(
                "at least one protocol level must be allowed".to_string(),
            ));
        }
        if let Some(level) = self
            .allowed_protocol_levels
            .iter()
            .find(|l| ![PROTOCOL_LEVEL_V31, PROTOCOL_LEVEL_V311].contains(l))
        {
            return Err(IotCoreError::Configuration(format!(
                "unsupported protocol level {level}"
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(IotCoreError::Configuration(
                "connect timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind_address.port(), 8883);
        assert!(config.allows_protocol_level(4));
        assert!(!config.allows_protocol_level(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = BrokerConfig::new()
            .with_bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_tls_files("cert.pem", "key.pem")
            .with_allowed_protocol_levels(vec![3, 4])
            .with_connect_timeout(Duration::from_secs(2));

        assert!(config.allows_protocol_level(3));
        assert_eq!(
            config.tls_config.as_ref().map(|t| t.key_file.clone()),
            Some(PathBuf::from("key.pem"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(BrokerConfig::new()
            .with_allowed_protocol_levels(vec![])
            .validate()
            .is_err());
        assert!(BrokerConfig::new()
            .with_allowed_protocol_levels(vec![5])
            .validate()
            .is_err());
        assert!(BrokerConfig::new()
            .with_connect_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
