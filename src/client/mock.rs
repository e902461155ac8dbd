//! Mock transport for testing
//!
//! Records every call made through [`DeviceTransport`] so tests can assert on
//! what a session would have put on the wire, including the exact credential
//! presented on each connect.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::{oneshot, Mutex};

use super::{ConnectOptions, ConnectResult, DeliveryToken, DeviceTransport};
use crate::error::{IotCoreError, Result};
use crate::QoS;

/// Record of a call made to the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect {
        endpoint: String,
        client_id: String,
        username: String,
        password: String,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Disconnect {
        grace: Duration,
    },
}

struct MockState {
    connected: AtomicBool,
    packet_id_counter: AtomicU16,
    calls: Mutex<Vec<MockCall>>,
    /// Consumed in order; an empty queue means accept
    connect_responses: Mutex<VecDeque<Result<ConnectResult>>>,
    /// Consumed in order; an empty queue means success
    publish_responses: Mutex<VecDeque<Result<()>>>,
    /// When set, QoS 1 tokens fail as if the connection dropped before PUBACK
    drop_acks: AtomicBool,
    /// Milliseconds each connect stalls before answering
    connect_delay_ms: AtomicU64,
}

/// In-memory [`DeviceTransport`]
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                connected: AtomicBool::new(false),
                packet_id_counter: AtomicU16::new(0),
                calls: Mutex::new(Vec::new()),
                connect_responses: Mutex::new(VecDeque::new()),
                publish_responses: Mutex::new(VecDeque::new()),
                drop_acks: AtomicBool::new(false),
                connect_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    pub async fn get_calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.calls.lock().await.clear();
    }

    /// Queues the outcome of the next connect
    pub async fn push_connect_response(&self, response: Result<ConnectResult>) {
        self.state.connect_responses.lock().await.push_back(response);
    }

    /// Queues the outcome of the next publish
    pub async fn push_publish_response(&self, response: Result<()>) {
        self.state.publish_responses.lock().await.push_back(response);
    }

    pub fn set_drop_acks(&self, drop_acks: bool) {
        self.state.drop_acks.store(drop_acks, Ordering::SeqCst);
    }

    /// Makes every connect stall for `delay` before answering, like a broker
    /// that is slow to send CONNACK
    pub fn set_connect_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state.connect_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Passwords presented on each connect, in order
    pub async fn presented_passwords(&self) -> Vec<String> {
        self.state
            .calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                MockCall::Connect { password, .. } => Some(password.clone()),
                _ => None,
            })
            .collect()
    }

    /// Payloads of every publish, in order
    pub async fn published_payloads(&self) -> Vec<String> {
        self.state
            .calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                MockCall::Publish { payload, .. } => {
                    Some(String::from_utf8_lossy(payload).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    async fn record_call(&self, call: MockCall) {
        self.state.calls.lock().await.push(call);
    }

    fn next_packet_id(&self) -> u16 {
        self.state
            .packet_id_counter
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1)
    }
}

impl DeviceTransport for MockTransport {
    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn connect(
        &self,
        options: ConnectOptions,
    ) -> impl Future<Output = Result<ConnectResult>> + Send + '_ {
        async move {
            self.record_call(MockCall::Connect {
                endpoint: options.endpoint.clone(),
                client_id: options.client_id.clone(),
                username: options.username.clone(),
                password: options.password.expose_secret().to_string(),
            })
            .await;

            if self.is_connected() {
                return Err(IotCoreError::AlreadyConnected);
            }

            let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let response = self
                .state
                .connect_responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Ok(ConnectResult {
                    session_present: false,
                }));
            if response.is_ok() {
                self.state.connected.store(true, Ordering::SeqCst);
            }
            response
        }
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<DeliveryToken>> + Send + 'a {
        async move {
            if !self.is_connected() {
                return Err(IotCoreError::NotConnected);
            }

            self.record_call(MockCall::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .await;

            if let Some(response) = self.state.publish_responses.lock().await.pop_front() {
                response?;
            }

            match qos {
                QoS::AtMostOnce => Ok(DeliveryToken::completed()),
                QoS::AtLeastOnce => {
                    let packet_id = self.next_packet_id();
                    let (tx, rx) = oneshot::channel();
                    if !self.state.drop_acks.load(Ordering::SeqCst) {
                        let _ = tx.send(());
                    }
                    Ok(DeliveryToken::pending(packet_id, rx))
                }
                QoS::ExactlyOnce => Err(IotCoreError::InvalidQoS(2)),
            }
        }
    }

    fn disconnect(&self, grace: Duration) -> impl Future<Output = Result<()>> + Send + '_ {
        async move {
            self.record_call(MockCall::Disconnect { grace }).await;
            if !self.is_connected() {
                return Err(IotCoreError::NotConnected);
            }
            self.state.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }
}
