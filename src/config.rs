//! Device configuration
//!
//! [`DeviceConfig`] is built once at startup, either through the builder
//! methods or from a JSON file, and then passed by reference to everything
//! that needs it. Nothing reads configuration from globals.

use crate::credential::{Algorithm, DEFAULT_TOKEN_LIFETIME};
use crate::error::{IotCoreError, Result};
use crate::identity::{IdentityPath, TopicKind};
use crate::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-central1";
pub const DEFAULT_ENDPOINT: &str = "mqtts://mqtt.googleapis.com:8883";

/// Everything a device run needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub project_id: String,
    pub registry_id: String,
    pub device_id: String,
    pub algorithm: Algorithm,

    #[serde(default = "default_region")]
    pub region: String,

    /// PEM private key the device signs credentials with
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    /// PEM public key; only the self-test broker needs it
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,

    /// Broker address, `mqtts://host:port` or `ssl://host:port`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Extra trust anchor (PEM) for the broker certificate. Public web roots
    /// are used when unset.
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,

    /// Run against a local verifying broker instead of `endpoint`
    #[serde(default)]
    pub self_test: bool,

    #[serde(default)]
    pub topic: TopicKind,

    #[serde(default = "default_qos")]
    pub qos: QoS,

    #[serde(default)]
    pub retain: bool,

    #[serde(default = "default_message_count")]
    pub message_count: u32,

    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,

    #[serde(default = "default_token_lifetime_secs")]
    pub token_lifetime_secs: u64,

    /// Re-mint and reconnect once the credential has less than this left
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_qos() -> QoS {
    QoS::AtLeastOnce
}

fn default_message_count() -> u32 {
    5
}

fn default_publish_interval_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_disconnect_grace_ms() -> u64 {
    1000
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_token_lifetime_secs() -> u64 {
    DEFAULT_TOKEN_LIFETIME.as_secs()
}

fn default_refresh_margin_secs() -> u64 {
    60
}

impl DeviceConfig {
    /// Configuration with defaults for everything but the device identifiers
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            registry_id: registry_id.into(),
            device_id: device_id.into(),
            algorithm,
            region: default_region(),
            private_key_file: None,
            public_key_file: None,
            endpoint: default_endpoint(),
            ca_cert_file: None,
            self_test: false,
            topic: TopicKind::default(),
            qos: default_qos(),
            retain: false,
            message_count: default_message_count(),
            publish_interval_ms: default_publish_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            token_lifetime_secs: default_token_lifetime_secs(),
            refresh_margin_secs: default_refresh_margin_secs(),
        }
    }

    /// Loads a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `Configuration` if it is
    /// not valid JSON for this structure.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IotCoreError::Io(format!("failed to read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            IotCoreError::Configuration(format!("invalid config {}: {e}", path.display()))
        })
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    #[must_use]
    pub fn with_private_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_public_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.public_key_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn with_ca_cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_self_test(mut self, self_test: bool) -> Self {
        self.self_test = self_test;
        self
    }

    #[must_use]
    pub fn with_topic(mut self, topic: TopicKind) -> Self {
        self.topic = topic;
        self
    }

    #[must_use]
    pub fn with_message_count(mut self, count: u32) -> Self {
        self.message_count = count;
        self
    }

    #[must_use]
    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval_ms = duration_millis(interval);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    #[must_use]
    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace_ms = duration_millis(grace);
        self
    }

    #[must_use]
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime_secs = lifetime.as_secs();
        self
    }

    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin_secs = margin.as_secs();
        self
    }

    /// Identity path built from the configured identifiers
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if an identifier is empty or contains `/`.
    pub fn identity(&self) -> Result<IdentityPath> {
        IdentityPath::new(
            &self.project_id,
            &self.region,
            &self.registry_id,
            &self.device_id,
        )
    }

    #[must_use]
    pub fn topic_name(&self) -> String {
        self.topic.topic_for(&self.device_id)
    }

    #[must_use]
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    #[must_use]
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    #[must_use]
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    /// Checks the configuration is usable for a device run
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.identity()?;

        if self.private_key_file.is_none() {
            return Err(IotCoreError::Configuration(
                "private_key_file is required".to_string(),
            ));
        }
        if self.self_test && self.public_key_file.is_none() {
            return Err(IotCoreError::Configuration(
                "public_key_file is required for self-test".to_string(),
            ));
        }
        if self.self_test && self.topic == TopicKind::State {
            return Err(IotCoreError::Configuration(
                "the self-test broker only admits the events topic".to_string(),
            ));
        }
        if self.qos == QoS::ExactlyOnce {
            return Err(IotCoreError::Configuration(
                "QoS 2 is not supported".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(IotCoreError::Configuration(
                "connect timeout must be positive".to_string(),
            ));
        }
        if self.token_lifetime_secs <= self.refresh_margin_secs {
            return Err(IotCoreError::Configuration(format!(
                "token lifetime ({}s) must exceed refresh margin ({}s)",
                self.token_lifetime_secs, self.refresh_margin_secs
            )));
        }
        Ok(())
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> DeviceConfig {
        DeviceConfig::new("p1", "r1", "d1", Algorithm::Rs256).with_private_key_file("key.pem")
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.region, "us-central1");
        assert_eq!(config.endpoint, "mqtts://mqtt.googleapis.com:8883");
        assert_eq!(config.qos, QoS::AtLeastOnce);
        assert!(!config.retain);
        assert_eq!(config.message_count, 5);
        assert_eq!(config.publish_interval(), Duration::from_millis(500));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.disconnect_grace(), Duration::from_millis(1000));
        assert_eq!(config.token_lifetime(), Duration::from_secs(1200));
        assert_eq!(config.topic_name(), "/devices/d1/events");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_self_test_rejects_state_topic() {
        let self_test = config()
            .with_public_key_file("public.pem")
            .with_self_test(true);
        assert!(self_test.validate().is_ok());

        let err = self_test
            .clone()
            .with_topic(TopicKind::State)
            .validate()
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(config().with_topic(TopicKind::State).validate().is_ok());
    }

    #[test]
    fn test_validate_failures() {
        assert!(DeviceConfig::new("p1", "r1", "d1", Algorithm::Rs256)
            .validate()
            .is_err());
        assert!(config().with_self_test(true).validate().is_err());
        assert!(config()
            .with_token_lifetime(Duration::from_secs(30))
            .validate()
            .is_err());
        assert!(DeviceConfig::new("p1", "", "d1", Algorithm::Rs256)
            .with_private_key_file("key.pem")
            .validate()
            .is_err());
    }

    #[test]
    fn test_json_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "project_id": "p1",
                "registry_id": "r1",
                "device_id": "d1",
                "algorithm": "ES256",
                "private_key_file": "ec_private.pem",
                "message_count": 2
            }}"#
        )
        .unwrap();

        let config = DeviceConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.algorithm, Algorithm::Es256);
        assert_eq!(config.message_count, 2);
        assert_eq!(config.region, "us-central1");
        assert_eq!(config.identity().unwrap().device_id(), "d1");
    }

    #[test]
    fn test_json_rejects_unknown_algorithm() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"project_id":"p","registry_id":"r","device_id":"d","algorithm":"HS256"}}"#
        )
        .unwrap();
        let err = DeviceConfig::from_json_file(file.path()).unwrap_err();
        assert!(err.is_configuration());
    }
}
