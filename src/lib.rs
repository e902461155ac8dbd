//! # Token-authenticated MQTT device client
//!
//! A device proves who it is to a telemetry broker with a short-lived signed
//! token (JWT, RS256 or ES256) carried in the MQTT password field, then
//! publishes a bounded run of telemetry messages over MQTT 3.1.1 on TLS.
//!
//! The crate has two halves that share one token format:
//!
//! - the device side: [`CredentialMinter`] and [`SessionDriver`] on top of
//!   [`MqttClient`];
//! - the verifying side: [`CredentialVerifier`] and [`AuthorizationPolicy`],
//!   plugged into [`broker::MqttBroker`] through [`broker::TokenAuthProvider`].
//!   [`LocalHarness`] wires both into a loopback broker for self-tests.
//!
//! Like the rest of this codebase, everything is direct async/await. The
//! client and broker spawn background tasks for reading; there is no event
//! loop to drive.
//!
//! ## Example
//!
//! ```rust,no_run
//! use iotcore_mqtt::{DeviceConfig, MqttClient, SessionDriver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeviceConfig::new("p1", "r1", "d1", "RS256".parse()?)
//!         .with_private_key_file("rsa_private.pem");
//!
//!     let driver = SessionDriver::new(config, MqttClient::new())?;
//!     let report = driver.run(std::future::pending()).await?;
//!     println!("published {} messages", report.published);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod broker;
pub mod client;
pub mod config;
pub mod credential;
pub mod encoding;
pub mod error;
pub mod harness;
pub mod identity;
pub mod packet;
pub mod policy;
pub mod session;
pub mod transport;

pub use client::{
    ConnectOptions, ConnectResult, DeliveryToken, DeviceTransport, MockCall, MockTransport,
    MqttClient,
};
pub use config::DeviceConfig;
pub use credential::{
    Algorithm, ClaimSet, Credential, CredentialMinter, CredentialVerifier, SigningKey,
    VerifyingKey,
};
pub use error::{IotCoreError, Result};
pub use harness::LocalHarness;
pub use identity::{IdentityPath, TopicKind, DEVICE_USERNAME};
pub use packet::{FixedHeader, Packet, PacketType};
pub use policy::{AccessType, AuthDecision, AuthorizationPolicy, DenyReason};
pub use session::{RunReport, SessionDriver};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = IotCoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(IotCoreError::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}
