//! MQTT 3.1.1 device client - direct async implementation
//!
//! The client owns at most one TLS connection. A background reader task
//! resolves delivery tokens as PUBACKs arrive and dispatches incoming
//! messages; a keepalive task sends PINGREQ. Everything else is a direct
//! async method call.

use crate::credential::Credential;
use crate::error::{IotCoreError, Result};
use crate::identity::{IdentityPath, DEVICE_USERNAME};
use crate::QoS;
use rustls::pki_types::CertificateDer;
use secrecy::SecretString;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

mod direct;
pub mod mock;
pub mod r#trait;

pub use self::direct::MqttClient;
pub use self::mock::{MockCall, MockTransport};
pub use self::r#trait::DeviceTransport;

/// Everything needed to open one authenticated session
#[derive(Debug)]
pub struct ConnectOptions {
    /// `mqtts://host:port`
    pub endpoint: String,
    pub client_id: String,
    pub username: String,
    pub password: SecretString,
    pub keep_alive: Duration,
    /// Bound on TCP connect, TLS handshake and CONNACK together
    pub connect_timeout: Duration,
    pub root_certs: Vec<CertificateDer<'static>>,
    pub use_web_roots: bool,
}

impl ConnectOptions {
    /// Options for a device presenting `credential` as its password
    #[must_use]
    pub fn for_device(
        endpoint: impl Into<String>,
        identity: &IdentityPath,
        credential: &Credential,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: identity.as_str().to_string(),
            username: DEVICE_USERNAME.to_string(),
            password: SecretString::from(credential.expose_token().to_string()),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            root_certs: Vec::new(),
            use_web_roots: true,
        }
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Trusts `cert` in addition to (or, with `use_web_roots` off, instead
    /// of) the public web roots
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResult {
    pub session_present: bool,
}

/// Message delivered to a subscription callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Completion handle for a publish
///
/// QoS 0 tokens are complete immediately. QoS 1 tokens complete when the
/// broker's PUBACK arrives and fail if the connection goes away first.
pub struct DeliveryToken {
    packet_id: Option<u16>,
    ack: Option<oneshot::Receiver<()>>,
}

impl DeliveryToken {
    #[must_use]
    pub fn completed() -> Self {
        Self {
            packet_id: None,
            ack: None,
        }
    }

    #[must_use]
    pub fn pending(packet_id: u16, ack: oneshot::Receiver<()>) -> Self {
        Self {
            packet_id: Some(packet_id),
            ack: Some(ack),
        }
    }

    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    /// Waits at most `limit` for the acknowledgement
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no PUBACK arrives in time and `DeliveryFailed` if
    /// the connection closed first.
    pub async fn wait_timeout(self, limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, self).await?
    }
}

impl Future for DeliveryToken {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let packet_id = self.packet_id.unwrap_or(0);
        match self.ack.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.map_err(|_| IotCoreError::DeliveryFailed(packet_id))),
        }
    }
}

impl fmt::Debug for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryToken")
            .field("packet_id", &self.packet_id)
            .field("pending", &self.ack.is_some())
            .finish()
    }
}

/// Callback invoked for each message on a subscribed topic
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;
