use crate::packet::connack::ConnectReturnCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IotCoreError>;

/// Errors produced by the device client, the credential layer and the broker
///
/// Authentication and authorization outcomes inside the verifier and the
/// policy are not errors; they are reported as [`crate::DenyReason`] values.
/// At the client side a broker refusal shows up as
/// [`IotCoreError::ConnectionRefused`].
///
/// # Error Categories
///
/// - **Configuration** (fatal): `Configuration`, `UnsupportedAlgorithm`, `KeyFormat`, `Jwt`
/// - **Network** (transient): `Io`, `ConnectionError`, `Timeout`
/// - **Protocol**: `MalformedPacket`, `ProtocolError`, `InvalidPacketType`, `UnsupportedProtocolVersion`
/// - **Session**: `ConnectionRefused`, `NotConnected`, `AlreadyConnected`, `Cancelled`
#[derive(Error, Debug, Clone)]
pub enum IotCoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Key format error: {0}")]
    KeyFormat(String),

    #[error("Credential error: {0}")]
    Jwt(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("Timeout")]
    Timeout,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Delivery not confirmed for packet {0}")]
    DeliveryFailed(u16),

    #[error("Operation cancelled")]
    Cancelled,
}

impl IotCoreError {
    /// Errors caused by the device's own configuration or key material.
    ///
    /// Retrying without changing the configuration cannot succeed.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnsupportedAlgorithm(_) | Self::KeyFormat(_) | Self::Jwt(_)
        )
    }

    /// Errors a caller may reasonably retry with a fresh connection.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionError(_)
                | Self::Timeout
                | Self::DeliveryFailed(_)
                | Self::ConnectionRefused(ConnectReturnCode::ServerUnavailable)
        )
    }
}

impl From<std::io::Error> for IotCoreError {
    fn from(err: std::io::Error) -> Self {
        IotCoreError::Io(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for IotCoreError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        IotCoreError::Jwt(err.to_string())
    }
}

impl From<rustls::Error> for IotCoreError {
    fn from(err: rustls::Error) -> Self {
        IotCoreError::Tls(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for IotCoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        IotCoreError::Timeout
    }
}
