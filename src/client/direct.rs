//! Direct async client implementation - no event loop
//!
//! Operations are plain async methods. Two background tasks run per
//! connection: a packet reader that resolves pending acknowledgements and
//! dispatches incoming messages, and a keepalive task that sends PINGREQ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;

use super::{ConnectOptions, ConnectResult, DeliveryToken, Message, MessageCallback};
use crate::error::{IotCoreError, Result};
use crate::packet::connect::ConnectPacket;
use crate::packet::puback::PubAckPacket;
use crate::packet::publish::PublishPacket;
use crate::packet::suback::{SubAckPacket, SubAckReturnCode};
use crate::packet::subscribe::SubscribePacket;
use crate::packet::Packet;
use crate::transport::{PacketReader, PacketWriter, TlsConfig};
use crate::QoS;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<Mutex<Option<BoxedWriter>>>;
type PendingAcks<T> = Arc<Mutex<HashMap<u16, oneshot::Sender<T>>>>;

/// Hands out packet identifiers in 1..=65535, wrapping back to 1
#[derive(Debug)]
struct PacketIdGenerator {
    next_id: AtomicU16,
}

impl PacketIdGenerator {
    fn new() -> Self {
        Self {
            next_id: AtomicU16::new(1),
        }
    }

    fn next(&self) -> u16 {
        loop {
            let current = self.next_id.load(Ordering::SeqCst);
            let next = if current == u16::MAX { 1 } else { current + 1 };
            if self
                .next_id
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return current;
            }
        }
    }
}

/// MQTT 3.1.1 client over TLS
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct MqttClient {
    writer: SharedWriter,
    connected: Arc<AtomicBool>,
    packet_ids: Arc<PacketIdGenerator>,
    /// `packet_id` -> waiter for PUBACK
    pending_pubacks: PendingAcks<()>,
    /// `packet_id` -> waiter for SUBACK
    pending_subacks: PendingAcks<SubAckPacket>,
    /// Signalled whenever `pending_pubacks` becomes empty
    acks_drained: Arc<Notify>,
    /// Exact topic -> callback
    subscriptions: Arc<Mutex<HashMap<String, MessageCallback>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Default for MqttClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MqttClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            packet_ids: Arc::new(PacketIdGenerator::new()),
            pending_pubacks: Arc::new(Mutex::new(HashMap::new())),
            pending_subacks: Arc::new(Mutex::new(HashMap::new())),
            acks_drained: Arc::new(Notify::new()),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Opens a TLS connection to `options.endpoint` and authenticates
    ///
    /// TCP connect, TLS handshake and the CONNECT/CONNACK exchange together
    /// are bounded by `options.connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyConnected` if a session is open, `Configuration` for a
    /// bad endpoint, `Timeout` when the bound is exceeded and
    /// `ConnectionRefused` when the broker answers with a non-zero CONNACK.
    pub async fn connect(&self, options: ConnectOptions) -> Result<ConnectResult> {
        if self.is_connected() {
            return Err(IotCoreError::AlreadyConnected);
        }

        let mut tls = TlsConfig::from_endpoint(&options.endpoint)?
            .with_connect_timeout(options.connect_timeout)
            .with_web_roots(options.use_web_roots);
        for cert in &options.root_certs {
            tls = tls.with_root_cert(cert.clone());
        }

        tracing::info!(
            endpoint = %options.endpoint,
            client_id = %options.client_id,
            "Connecting"
        );

        tokio::time::timeout(options.connect_timeout, async {
            let stream = tls.connect().await?;
            self.connect_with_stream(stream, &options).await
        })
        .await?
    }

    /// Runs the CONNECT/CONNACK exchange over an already open stream
    ///
    /// # Errors
    ///
    /// Returns `ConnectionRefused` for a non-zero CONNACK return code,
    /// `Timeout` if no CONNACK arrives within `options.connect_timeout` and
    /// `ProtocolError` if the broker answers with anything but CONNACK.
    pub async fn connect_with_stream<S>(
        &self,
        stream: S,
        options: &ConnectOptions,
    ) -> Result<ConnectResult>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_connected() {
            return Err(IotCoreError::AlreadyConnected);
        }

        let (reader, writer) = tokio::io::split(stream);
        let mut reader: BoxedReader = Box::new(reader);
        let mut writer: BoxedWriter = Box::new(writer);

        let keep_alive = u16::try_from(options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        let connect = ConnectPacket::new(options.client_id.clone())
            .with_credentials(
                options.username.clone(),
                options.password.expose_secret().as_bytes().to_vec(),
            )
            .with_keep_alive(keep_alive);
        writer.write_packet(Packet::Connect(Box::new(connect))).await?;

        let connack = match tokio::time::timeout(options.connect_timeout, reader.read_packet()).await?? {
            Packet::ConnAck(connack) => connack,
            other => {
                return Err(IotCoreError::ProtocolError(format!(
                    "Expected CONNACK, got {other:?}"
                )))
            }
        };

        if !connack.return_code.is_success() {
            tracing::warn!(code = %connack.return_code, "Connection refused");
            return Err(IotCoreError::ConnectionRefused(connack.return_code));
        }

        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        self.start_background_tasks(reader, options.keep_alive).await;

        tracing::info!(session_present = connack.session_present, "Connected");
        Ok(ConnectResult {
            session_present: connack.session_present,
        })
    }

    /// Sends a PUBLISH
    ///
    /// For QoS 1 the returned token resolves on PUBACK. The call itself only
    /// waits for the write.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a session and `InvalidQoS` for QoS 2.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<DeliveryToken> {
        if !self.is_connected() {
            return Err(IotCoreError::NotConnected);
        }

        let mut publish = PublishPacket::new(topic, payload, qos).with_retain(retain);
        let token = match qos {
            QoS::AtMostOnce => DeliveryToken::completed(),
            QoS::AtLeastOnce => {
                let packet_id = self.packet_ids.next();
                publish = publish.with_packet_id(packet_id);
                let (tx, rx) = oneshot::channel();
                self.pending_pubacks.lock().await.insert(packet_id, tx);
                DeliveryToken::pending(packet_id, rx)
            }
            QoS::ExactlyOnce => return Err(IotCoreError::InvalidQoS(2)),
        };

        tracing::debug!(topic, packet_id = ?publish.packet_id, "Publishing");
        if let Err(e) = self.send_packet(Packet::Publish(publish)).await {
            if let Some(packet_id) = token.packet_id() {
                self.pending_pubacks.lock().await.remove(&packet_id);
            }
            return Err(e);
        }
        Ok(token)
    }

    /// Subscribes to one exact topic and routes matching messages to
    /// `callback`
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a session and `ConnectionError` if the
    /// connection drops before SUBACK.
    pub async fn subscribe<F>(&self, topic: &str, qos: QoS, callback: F) -> Result<SubAckReturnCode>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if !self.is_connected() {
            return Err(IotCoreError::NotConnected);
        }

        let packet_id = self.packet_ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending_subacks.lock().await.insert(packet_id, tx);
        self.subscriptions
            .lock()
            .await
            .insert(topic.to_string(), Arc::new(callback));

        self.send_packet(Packet::Subscribe(
            SubscribePacket::new(packet_id).add_filter(topic, qos),
        ))
        .await?;

        let suback = rx.await.map_err(|_| {
            IotCoreError::ConnectionError("Connection closed before SUBACK".to_string())
        })?;
        let code = suback
            .return_codes
            .first()
            .copied()
            .unwrap_or(SubAckReturnCode::Failure);
        if code == SubAckReturnCode::Failure {
            self.subscriptions.lock().await.remove(topic);
        }
        Ok(code)
    }

    /// Waits up to `grace` for outstanding acknowledgements, then sends
    /// DISCONNECT and closes the connection
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if there is no session.
    pub async fn disconnect(&self, grace: Duration) -> Result<()> {
        if !self.is_connected() {
            return Err(IotCoreError::NotConnected);
        }

        if tokio::time::timeout(grace, self.wait_for_pending_acks())
            .await
            .is_err()
        {
            let outstanding = self.pending_pubacks.lock().await.len();
            tracing::warn!(outstanding, "Disconnecting with unacknowledged messages");
        }

        if let Err(e) = self.send_packet(Packet::Disconnect).await {
            tracing::debug!("Error sending DISCONNECT: {e}");
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        self.stop_background_tasks().await;
        self.pending_pubacks.lock().await.clear();
        self.pending_subacks.lock().await.clear();
        self.acks_drained.notify_waiters();

        tracing::info!("Disconnected");
        Ok(())
    }

    async fn wait_for_pending_acks(&self) {
        loop {
            let drained = self.acks_drained.notified();
            if self.pending_pubacks.lock().await.is_empty() {
                return;
            }
            drained.await;
        }
    }

    async fn send_packet(&self, packet: Packet) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(IotCoreError::NotConnected)?;
        writer.write_packet(packet).await
    }

    async fn start_background_tasks(&self, reader: BoxedReader, keep_alive: Duration) {
        let ctx = PacketReaderContext {
            writer: self.writer.clone(),
            connected: self.connected.clone(),
            pending_pubacks: self.pending_pubacks.clone(),
            pending_subacks: self.pending_subacks.clone(),
            acks_drained: self.acks_drained.clone(),
            subscriptions: self.subscriptions.clone(),
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(packet_reader_task(reader, ctx)));
        if !keep_alive.is_zero() {
            tasks.push(tokio::spawn(keepalive_task(self.writer.clone(), keep_alive)));
        }
    }

    async fn stop_background_tasks(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }
}

struct PacketReaderContext {
    writer: SharedWriter,
    connected: Arc<AtomicBool>,
    pending_pubacks: PendingAcks<()>,
    pending_subacks: PendingAcks<SubAckPacket>,
    acks_drained: Arc<Notify>,
    subscriptions: Arc<Mutex<HashMap<String, MessageCallback>>>,
}

async fn packet_reader_task(mut reader: BoxedReader, ctx: PacketReaderContext) {
    loop {
        match reader.read_packet().await {
            Ok(packet) => {
                if let Err(e) = handle_incoming_packet(packet, &ctx).await {
                    tracing::error!("Error handling packet: {e}");
                    break;
                }
            }
            Err(e) => {
                if ctx.connected.load(Ordering::SeqCst) {
                    tracing::error!("Error reading packet: {e}");
                }
                break;
            }
        }
    }

    ctx.connected.store(false, Ordering::SeqCst);
    // Dropping the senders fails every outstanding delivery token
    ctx.pending_pubacks.lock().await.clear();
    ctx.pending_subacks.lock().await.clear();
    ctx.acks_drained.notify_waiters();
}

async fn handle_incoming_packet(packet: Packet, ctx: &PacketReaderContext) -> Result<()> {
    match packet {
        Packet::PubAck(puback) => {
            let mut pending = ctx.pending_pubacks.lock().await;
            match pending.remove(&puback.packet_id) {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => tracing::debug!(packet_id = puback.packet_id, "Unexpected PUBACK"),
            }
            if pending.is_empty() {
                ctx.acks_drained.notify_waiters();
            }
            Ok(())
        }
        Packet::SubAck(suback) => {
            if let Some(tx) = ctx.pending_subacks.lock().await.remove(&suback.packet_id) {
                let _ = tx.send(suback);
            }
            Ok(())
        }
        Packet::Publish(publish) => handle_publish_with_ack(publish, ctx).await,
        Packet::PingResp => Ok(()),
        other => Err(IotCoreError::ProtocolError(format!(
            "Unexpected packet from broker: {other:?}"
        ))),
    }
}

async fn handle_publish_with_ack(publish: PublishPacket, ctx: &PacketReaderContext) -> Result<()> {
    if publish.qos == QoS::AtLeastOnce {
        if let Some(packet_id) = publish.packet_id {
            if let Some(writer) = ctx.writer.lock().await.as_mut() {
                writer
                    .write_packet(Packet::PubAck(PubAckPacket::new(packet_id)))
                    .await?;
            }
        }
    }

    let callback = ctx.subscriptions.lock().await.get(&publish.topic_name).cloned();
    if let Some(callback) = callback {
        callback(Message {
            topic: publish.topic_name,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        });
    }
    Ok(())
}

async fn keepalive_task(writer: SharedWriter, keep_alive: Duration) {
    let mut interval = tokio::time::interval(keep_alive);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // First tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let mut guard = writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            break;
        };
        if let Err(e) = writer.write_packet(Packet::PingReq).await {
            tracing::error!("Error sending PINGREQ: {e}");
            break;
        }
    }
}
