//! Transport seam between the session driver and the MQTT client
//!
//! [`SessionDriver`](crate::SessionDriver) only talks to a
//! [`DeviceTransport`], so it can run against [`MqttClient`] or against
//! [`MockTransport`](super::MockTransport) in tests.

use super::{ConnectOptions, ConnectResult, DeliveryToken, MqttClient};
use crate::error::Result;
use crate::QoS;
use std::future::Future;
use std::time::Duration;

/// What a device needs from an MQTT connection
pub trait DeviceTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Opens and authenticates a session
    fn connect(
        &self,
        options: ConnectOptions,
    ) -> impl Future<Output = Result<ConnectResult>> + Send + '_;

    /// Sends one message; the token resolves when delivery is acknowledged
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<DeliveryToken>> + Send + 'a;

    /// Closes the session, allowing `grace` for in-flight acknowledgements
    fn disconnect(&self, grace: Duration) -> impl Future<Output = Result<()>> + Send + '_;
}

impl DeviceTransport for MqttClient {
    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }

    fn connect(
        &self,
        options: ConnectOptions,
    ) -> impl Future<Output = Result<ConnectResult>> + Send + '_ {
        MqttClient::connect(self, options)
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<DeliveryToken>> + Send + 'a {
        MqttClient::publish(self, topic, payload, qos, retain)
    }

    fn disconnect(&self, grace: Duration) -> impl Future<Output = Result<()>> + Send + '_ {
        MqttClient::disconnect(self, grace)
    }
}
