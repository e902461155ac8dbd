//! Client connection handler for the broker
//!
//! One handler runs per accepted connection. Authentication happens once, on
//! CONNECT; every later publish and subscribe goes back to the auth provider.
//! A denied publish is dropped for that client only and the session carries
//! on, so one misbehaving device never takes the broker down.

use crate::broker::auth::AuthProvider;
use crate::broker::config::BrokerConfig;
use crate::broker::events::BrokerEvent;
use crate::broker::router::MessageRouter;
use crate::error::{IotCoreError, Result};
use crate::packet::connack::{ConnAckPacket, ConnectReturnCode};
use crate::packet::connect::ConnectPacket;
use crate::packet::puback::PubAckPacket;
use crate::packet::publish::PublishPacket;
use crate::packet::suback::{SubAckPacket, SubAckReturnCode};
use crate::packet::subscribe::SubscribePacket;
use crate::packet::Packet;
use crate::policy::{AuthDecision, DenyReason};
use crate::transport::{PacketReader, PacketWriter};
use crate::QoS;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Handles a single client connection
pub struct ClientHandler<S> {
    reader: ReadHalf<S>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    client_addr: SocketAddr,
    config: Arc<BrokerConfig>,
    router: Arc<MessageRouter>,
    auth_provider: Arc<dyn AuthProvider>,
    events: broadcast::Sender<BrokerEvent>,
    shutdown_rx: broadcast::Receiver<()>,
    client_id: String,
    user_id: Option<String>,
    keep_alive: Duration,
}

impl<S> ClientHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        stream: S,
        client_addr: SocketAddr,
        config: Arc<BrokerConfig>,
        router: Arc<MessageRouter>,
        auth_provider: Arc<dyn AuthProvider>,
        events: broadcast::Sender<BrokerEvent>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer: Arc::new(Mutex::new(writer)),
            client_addr,
            config,
            router,
            auth_provider,
            events,
            shutdown_rx,
            client_id: String::new(),
            user_id: None,
            keep_alive: Duration::ZERO,
        }
    }

    /// Runs the client handler until disconnection or error
    ///
    /// A refused connection is a normal outcome and returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns an error on timeouts, protocol violations and transport
    /// failures.
    pub async fn run(mut self) -> Result<()> {
        let connect = match timeout(self.config.connect_timeout, self.reader.read_packet()).await {
            Ok(Ok(Packet::Connect(connect))) => *connect,
            Ok(Ok(_)) => {
                return Err(IotCoreError::ProtocolError(
                    "Expected CONNECT packet".to_string(),
                ))
            }
            Ok(Err(IotCoreError::UnsupportedProtocolVersion(level))) => {
                debug!(addr = %self.client_addr, level, "Unsupported protocol level");
                self.refuse(String::new(), ConnectReturnCode::UnacceptableProtocolVersion, None)
                    .await;
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("Connect timeout from {}", self.client_addr);
                return Err(IotCoreError::Timeout);
            }
        };

        if !self.handle_connect(connect).await? {
            return Ok(());
        }

        let (publish_tx, publish_rx) = mpsc::channel(100);
        self.router
            .register_client(self.client_id.clone(), publish_tx.clone())
            .await;
        let forwarder = tokio::spawn(forward_publishes(self.writer.clone(), publish_rx));

        let result = self.handle_packets().await;

        forwarder.abort();
        self.router
            .unregister_client(&self.client_id, &publish_tx)
            .await;
        let _ = self.writer.lock().await.shutdown().await;
        self.emit(BrokerEvent::ClientDisconnected {
            client_id: self.client_id.clone(),
        });
        info!(client_id = %self.client_id, "Client disconnected");

        result
    }

    /// Returns whether the connection was accepted
    async fn handle_connect(&mut self, connect: ConnectPacket) -> Result<bool> {
        debug!(
            client_id = %connect.client_id,
            addr = %self.client_addr,
            level = connect.protocol_level,
            "Processing CONNECT packet"
        );

        if !self.config.allows_protocol_level(connect.protocol_level) {
            self.refuse(
                connect.client_id,
                ConnectReturnCode::UnacceptableProtocolVersion,
                None,
            )
            .await;
            return Ok(false);
        }
        if connect.client_id.is_empty() {
            self.refuse(connect.client_id, ConnectReturnCode::IdentifierRejected, None)
                .await;
            return Ok(false);
        }

        let auth_result = match self
            .auth_provider
            .authenticate(&connect, self.client_addr)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.refuse(connect.client_id, ConnectReturnCode::ServerUnavailable, None)
                    .await;
                return Err(e);
            }
        };

        if !auth_result.authenticated {
            self.refuse(connect.client_id, auth_result.return_code, auth_result.reason)
                .await;
            return Ok(false);
        }

        self.client_id = connect.client_id;
        self.user_id = auth_result.user_id;
        self.keep_alive = Duration::from_secs(u64::from(connect.keep_alive));

        self.send(Packet::ConnAck(ConnAckPacket::new(
            false,
            ConnectReturnCode::Accepted,
        )))
        .await?;

        info!(client_id = %self.client_id, addr = %self.client_addr, "Client connected");
        self.emit(BrokerEvent::ClientConnected {
            client_id: self.client_id.clone(),
            addr: self.client_addr,
        });
        Ok(true)
    }

    async fn refuse(
        &self,
        client_id: String,
        return_code: ConnectReturnCode,
        reason: Option<DenyReason>,
    ) {
        info!(
            client_id = %client_id,
            addr = %self.client_addr,
            code = %return_code,
            "Connection refused"
        );
        if let Err(e) = self
            .send(Packet::ConnAck(ConnAckPacket::refused(return_code)))
            .await
        {
            debug!("Failed to send CONNACK: {e}");
        }
        let _ = self.writer.lock().await.shutdown().await;
        self.emit(BrokerEvent::ConnectionRefused {
            client_id,
            addr: self.client_addr,
            return_code,
            reason,
        });
    }

    async fn handle_packets(&mut self) -> Result<()> {
        // The client must send something within one and a half keep-alive periods
        let read_limit = (!self.keep_alive.is_zero()).then(|| self.keep_alive * 3 / 2);

        loop {
            let reader = &mut self.reader;
            let shutdown_rx = &mut self.shutdown_rx;
            let packet = tokio::select! {
                packet = read_packet_within(reader, read_limit) => packet,
                _ = shutdown_rx.recv() => {
                    debug!(client_id = %self.client_id, "Shutdown signal received");
                    return Ok(());
                }
            };

            match packet {
                Ok(packet) => {
                    if !self.handle_packet(packet).await? {
                        return Ok(());
                    }
                }
                Err(IotCoreError::ConnectionError(e)) => {
                    debug!(client_id = %self.client_id, "Connection closed: {e}");
                    return Ok(());
                }
                Err(IotCoreError::Timeout) => {
                    warn!(client_id = %self.client_id, "Keep-alive timeout");
                    return Err(IotCoreError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns `false` once the client has disconnected
    async fn handle_packet(&mut self, packet: Packet) -> Result<bool> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await?,
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await?,
            Packet::PingReq => self.send(Packet::PingResp).await?,
            // Acknowledgement of a message we forwarded
            Packet::PubAck(_) => {}
            Packet::Disconnect => {
                debug!(client_id = %self.client_id, "Client sent DISCONNECT");
                return Ok(false);
            }
            Packet::Connect(_) => {
                return Err(IotCoreError::ProtocolError("Duplicate CONNECT".to_string()))
            }
            other => {
                return Err(IotCoreError::ProtocolError(format!(
                    "Unexpected packet from client: {other:?}"
                )))
            }
        }
        Ok(true)
    }

    async fn handle_publish(&mut self, publish: PublishPacket) -> Result<()> {
        if publish.qos == QoS::ExactlyOnce {
            return Err(IotCoreError::ProtocolError(
                "QoS 2 is not supported".to_string(),
            ));
        }

        let decision = self
            .auth_provider
            .authorize_publish(&self.client_id, self.user_id.as_deref(), &publish.topic_name)
            .await?;

        match decision {
            AuthDecision::Allow => {
                let delivered = self.router.route_message(&publish).await;
                debug!(
                    client_id = %self.client_id,
                    topic = %publish.topic_name,
                    delivered,
                    "Message published"
                );
                self.emit(BrokerEvent::MessagePublished {
                    client_id: self.client_id.clone(),
                    topic: publish.topic_name.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                });
            }
            AuthDecision::Deny(reason) => {
                warn!(
                    client_id = %self.client_id,
                    topic = %publish.topic_name,
                    %reason,
                    "Publish denied"
                );
                self.emit(BrokerEvent::PublishDenied {
                    client_id: self.client_id.clone(),
                    topic: publish.topic_name.clone(),
                    reason,
                });
            }
        }

        // MQTT 3.1.1 has no negative PUBACK; a dropped message is still acknowledged
        if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
            self.send(Packet::PubAck(PubAckPacket::new(packet_id))).await?;
        }
        Ok(())
    }

    async fn handle_subscribe(&mut self, subscribe: SubscribePacket) -> Result<()> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());

        for (filter, qos) in subscribe.filters {
            let decision = self
                .auth_provider
                .authorize_subscribe(&self.client_id, self.user_id.as_deref(), &filter)
                .await?;
            match decision {
                AuthDecision::Allow => {
                    let granted = qos.min(QoS::AtLeastOnce);
                    self.router
                        .subscribe(self.client_id.clone(), filter, granted)
                        .await;
                    return_codes.push(SubAckReturnCode::Granted(granted));
                }
                AuthDecision::Deny(reason) => {
                    warn!(client_id = %self.client_id, filter = %filter, %reason, "Subscribe denied");
                    self.emit(BrokerEvent::SubscribeDenied {
                        client_id: self.client_id.clone(),
                        topic_filter: filter,
                        reason,
                    });
                    return_codes.push(SubAckReturnCode::Failure);
                }
            }
        }

        self.send(Packet::SubAck(SubAckPacket::new(
            subscribe.packet_id,
            return_codes,
        )))
        .await
    }

    async fn send(&self, packet: Packet) -> Result<()> {
        self.writer.lock().await.write_packet(packet).await
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }
}

async fn read_packet_within<R: PacketReader>(reader: &mut R, limit: Option<Duration>) -> Result<Packet> {
    match limit {
        Some(limit) => timeout(limit, reader.read_packet()).await?,
        None => reader.read_packet().await,
    }
}

/// Writes routed messages to the subscriber, numbering QoS 1 deliveries
async fn forward_publishes<W>(writer: Arc<Mutex<W>>, mut publish_rx: mpsc::Receiver<PublishPacket>)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut next_packet_id: u16 = 1;
    while let Some(mut publish) = publish_rx.recv().await {
        if publish.qos == QoS::AtLeastOnce {
            publish.packet_id = Some(next_packet_id);
            next_packet_id = if next_packet_id == u16::MAX {
                1
            } else {
                next_packet_id + 1
            };
        }
        if let Err(e) = writer.lock().await.write_packet(Packet::Publish(publish)).await {
            debug!("Failed to forward message: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::auth::AllowAllAuthProvider;
    use crate::broker::token_auth::TokenAuthProvider;
    use crate::credential::{Algorithm, CredentialMinter, CredentialVerifier, SigningKey, VerifyingKey};
    use crate::identity::IdentityPath;
    use crate::policy::AuthorizationPolicy;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    const EC_PRIVATE: &[u8] = include_bytes!("../../tests/fixtures/ec_private.pem");
    const EC_PUBLIC: &[u8] = include_bytes!("../../tests/fixtures/ec_public.pem");

    struct TestBroker {
        router: Arc<MessageRouter>,
        events: broadcast::Sender<BrokerEvent>,
        shutdown_tx: broadcast::Sender<()>,
        config: Arc<BrokerConfig>,
        auth: Arc<dyn AuthProvider>,
    }

    impl TestBroker {
        fn new(auth: Arc<dyn AuthProvider>) -> Self {
            Self {
                router: Arc::new(MessageRouter::new()),
                events: broadcast::channel(64).0,
                shutdown_tx: broadcast::channel(1).0,
                config: Arc::new(BrokerConfig::default()),
                auth,
            }
        }

        fn connect_stream(&self) -> (DuplexStream, JoinHandle<Result<()>>) {
            let (client, server) = tokio::io::duplex(8192);
            let handler = ClientHandler::new(
                server,
                "127.0.0.1:50000".parse().unwrap(),
                self.config.clone(),
                self.router.clone(),
                self.auth.clone(),
                self.events.clone(),
                self.shutdown_tx.subscribe(),
            );
            (client, tokio::spawn(handler.run()))
        }
    }

    fn identity() -> IdentityPath {
        IdentityPath::new("p1", "us-central1", "r1", "d1").unwrap()
    }

    fn token_auth() -> Arc<dyn AuthProvider> {
        let key = VerifyingKey::from_pem(Algorithm::Es256, EC_PUBLIC).unwrap();
        Arc::new(TokenAuthProvider::new(
            CredentialVerifier::new(key, "p1"),
            AuthorizationPolicy::new(identity()),
        ))
    }

    fn device_connect() -> ConnectPacket {
        let key = SigningKey::from_pem(Algorithm::Es256, EC_PRIVATE).unwrap();
        let credential = CredentialMinter::new(key, "p1").mint().unwrap();
        ConnectPacket::new(identity().as_str())
            .with_credentials("unused", credential.expose_token().as_bytes().to_vec())
    }

    async fn connack(stream: &mut DuplexStream, connect: ConnectPacket) -> ConnectReturnCode {
        stream
            .write_packet(Packet::Connect(Box::new(connect)))
            .await
            .unwrap();
        match stream.read_packet().await.unwrap() {
            Packet::ConnAck(ack) => ack.return_code,
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_valid_device_publishes() {
        let broker = TestBroker::new(token_auth());
        let mut events = broker.events.subscribe();
        let (mut stream, handle) = broker.connect_stream();

        assert_eq!(
            connack(&mut stream, device_connect()).await,
            ConnectReturnCode::Accepted
        );
        stream
            .write_packet(Packet::Publish(
                PublishPacket::new("/devices/d1/events", "Message 0", QoS::AtLeastOnce)
                    .with_packet_id(1),
            ))
            .await
            .unwrap();
        match stream.read_packet().await.unwrap() {
            Packet::PubAck(ack) => assert_eq!(ack.packet_id, 1),
            other => panic!("expected PUBACK, got {other:?}"),
        }
        stream.write_packet(Packet::Disconnect).await.unwrap();
        handle.await.unwrap().unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            BrokerEvent::ClientConnected { .. }
        ));
        match events.recv().await.unwrap() {
            BrokerEvent::MessagePublished { topic, payload, .. } => {
                assert_eq!(topic, "/devices/d1/events");
                assert_eq!(payload, b"Message 0");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            BrokerEvent::ClientDisconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_denied_publish_keeps_session() {
        let broker = TestBroker::new(token_auth());
        let mut events = broker.events.subscribe();
        let (mut stream, handle) = broker.connect_stream();
        connack(&mut stream, device_connect()).await;

        stream
            .write_packet(Packet::Publish(
                PublishPacket::new("/devices/d1/state", "x", QoS::AtLeastOnce).with_packet_id(5),
            ))
            .await
            .unwrap();
        assert!(matches!(
            stream.read_packet().await.unwrap(),
            Packet::PubAck(_)
        ));

        stream.write_packet(Packet::PingReq).await.unwrap();
        assert!(matches!(
            stream.read_packet().await.unwrap(),
            Packet::PingResp
        ));

        let _ = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            BrokerEvent::PublishDenied { topic, reason, .. } => {
                assert_eq!(topic, "/devices/d1/state");
                assert!(matches!(reason, DenyReason::TopicNotAllowed { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }

        drop(stream);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_credential_refused() {
        let broker = TestBroker::new(token_auth());
        let mut events = broker.events.subscribe();
        let (mut stream, handle) = broker.connect_stream();

        let connect =
            ConnectPacket::new(identity().as_str()).with_credentials("unused", b"not-a-jwt".to_vec());
        assert_eq!(
            connack(&mut stream, connect).await,
            ConnectReturnCode::BadUsernameOrPassword
        );
        handle.await.unwrap().unwrap();

        match events.recv().await.unwrap() {
            BrokerEvent::ConnectionRefused { reason, .. } => {
                assert!(matches!(reason, Some(DenyReason::MalformedCredential(_))));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_protocol_level_not_allowed() {
        let broker = TestBroker::new(Arc::new(AllowAllAuthProvider));
        let (mut stream, handle) = broker.connect_stream();

        let mut connect = ConnectPacket::new("legacy");
        connect.protocol_level = 3;
        assert_eq!(
            connack(&mut stream, connect).await,
            ConnectReturnCode::UnacceptableProtocolVersion
        );
        handle.await.unwrap().unwrap();

        // Level 5 never gets past the decoder but still gets an answer
        let (mut stream, handle) = broker.connect_stream();
        let mut connect = ConnectPacket::new("v5");
        connect.protocol_level = 5;
        assert_eq!(
            connack(&mut stream, connect).await,
            ConnectReturnCode::UnacceptableProtocolVersion
        );
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_receives_routed_message() {
        let broker = TestBroker::new(Arc::new(AllowAllAuthProvider));
        let (mut subscriber, _sub_handle) = broker.connect_stream();
        connack(&mut subscriber, ConnectPacket::new("sub")).await;

        subscriber
            .write_packet(Packet::Subscribe(
                SubscribePacket::new(1).add_filter("/devices/d1/events", QoS::AtLeastOnce),
            ))
            .await
            .unwrap();
        match subscriber.read_packet().await.unwrap() {
            Packet::SubAck(ack) => assert_eq!(
                ack.return_codes,
                vec![SubAckReturnCode::Granted(QoS::AtLeastOnce)]
            ),
            other => panic!("expected SUBACK, got {other:?}"),
        }

        let (mut publisher, _pub_handle) = broker.connect_stream();
        connack(&mut publisher, ConnectPacket::new("pub")).await;
        publisher
            .write_packet(Packet::Publish(PublishPacket::new(
                "/devices/d1/events",
                "Message 3",
                QoS::AtMostOnce,
            )))
            .await
            .unwrap();

        match subscriber.read_packet().await.unwrap() {
            Packet::Publish(publish) => {
                assert_eq!(publish.payload, b"Message 3");
                assert_eq!(publish.qos, QoS::AtMostOnce);
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let broker = TestBroker::new(Arc::new(AllowAllAuthProvider));
        let (mut stream, handle) = broker.connect_stream();
        connack(&mut stream, ConnectPacket::new("c1")).await;

        broker.shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
