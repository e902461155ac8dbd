//! Broker status events
//!
//! Every connection outcome and every publish decision is broadcast so that
//! tests and the self-test harness can observe the broker without being an
//! MQTT client themselves. Events are best-effort: with no receivers, or a
//! receiver that lags, they are dropped.

use crate::packet::connack::ConnectReturnCode;
use crate::policy::DenyReason;
use crate::QoS;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: String,
        addr: SocketAddr,
    },
    ConnectionRefused {
        client_id: String,
        addr: SocketAddr,
        return_code: ConnectReturnCode,
        reason: Option<DenyReason>,
    },
    MessagePublished {
        client_id: String,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    PublishDenied {
        client_id: String,
        topic: String,
        reason: DenyReason,
    },
    SubscribeDenied {
        client_id: String,
        topic_filter: String,
        reason: DenyReason,
    },
    ClientDisconnected {
        client_id: String,
    },
}

impl BrokerEvent {
    /// Client the event concerns
    #[must_use]
    pub fn client_id(&self) -> &str {
        match self {
            Self::ClientConnected { client_id, .. }
            | Self::ConnectionRefused { client_id, .. }
            | Self::MessagePublished { client_id, .. }
            | Self::PublishDenied { client_id, .. }
            | Self::SubscribeDenied { client_id, .. }
            | Self::ClientDisconnected { client_id } => client_id,
        }
    }
}
