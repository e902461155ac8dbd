//! Verifying MQTT 3.1.1 broker server

use crate::broker::auth::{AllowAllAuthProvider, AuthProvider};
use crate::broker::client_handler::ClientHandler;
use crate::broker::config::BrokerConfig;
use crate::broker::events::BrokerEvent;
use crate::broker::router::MessageRouter;
use crate::broker::tls_acceptor::{accept_tls_connection, TlsAcceptorConfig};
use crate::error::{IotCoreError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// MQTT 3.1.1 broker on a TLS listener
pub struct MqttBroker {
    config: Arc<BrokerConfig>,
    router: Arc<MessageRouter>,
    auth_provider: Arc<dyn AuthProvider>,
    listener: Option<TcpListener>,
    // Subscribed at bind so a shutdown sent before `run` starts is not lost
    shutdown_rx: Option<broadcast::Receiver<()>>,
    local_addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    events: broadcast::Sender<BrokerEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MqttBroker {
    /// Binds a broker using the certificate and key files in `config`
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the configuration is invalid or has no TLS
    /// files, and an I/O error if binding fails.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let Some(tls) = config.tls_config.clone() else {
            return Err(IotCoreError::Configuration(
                "broker requires tls_config (certificate and key files)".to_string(),
            ));
        };
        let acceptor_config = TlsAcceptorConfig::from_pem_files(&tls.cert_file, &tls.key_file).await?;
        Self::bind_with_tls(config, &acceptor_config).await
    }

    /// Binds a broker with an in-memory TLS identity
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or TLS identity is invalid or
    /// binding fails.
    pub async fn bind_with_tls(config: BrokerConfig, tls: &TlsAcceptorConfig) -> Result<Self> {
        config.validate()?;
        let tls_acceptor = tls.build_acceptor()?;

        let listener = TcpListener::bind(&config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!("MQTT broker TLS listening on {local_addr}");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            router: Arc::new(MessageRouter::new()),
            auth_provider: Arc::new(AllowAllAuthProvider),
            listener: Some(listener),
            shutdown_rx: Some(shutdown_rx),
            local_addr,
            tls_acceptor,
            events,
            shutdown_tx,
        })
    }

    /// Sets the authentication provider
    #[must_use]
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = provider;
        self
    }

    /// Address the listener is bound to, with the real port when bound to 0
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receiver for status events from every connection
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Handle that stops [`run`](Self::run) and every connection
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Accepts connections until shutdown
    ///
    /// Each connection gets its own task; a failing client only ends its own
    /// task.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is already running.
    pub async fn run(&mut self) -> Result<()> {
        let (Some(listener), Some(mut shutdown_rx)) = (self.listener.take(), self.shutdown_rx.take())
        else {
            return Err(IotCoreError::ProtocolError(
                "Broker already running".to_string(),
            ));
        };
        info!("Starting MQTT broker");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("Accept loop shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((tcp_stream, addr)) => {
                            debug!("New TLS connection from {addr}");
                            self.spawn_connection(tcp_stream, addr);
                        }
                        Err(e) => {
                            error!("TLS accept error: {e}");
                        }
                    }
                }
            }
        }

        info!("Broker stopped");
        Ok(())
    }

    fn spawn_connection(&self, tcp_stream: tokio::net::TcpStream, addr: SocketAddr) {
        let acceptor = self.tls_acceptor.clone();
        let config = Arc::clone(&self.config);
        let router = Arc::clone(&self.router);
        let auth_provider = Arc::clone(&self.auth_provider);
        let events = self.events.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let tls_stream =
                match accept_tls_connection(&acceptor, tcp_stream, addr, config.connect_timeout).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(addr = %addr, "TLS handshake failed: {e}");
                        return;
                    }
                };

            let handler = ClientHandler::new(
                tls_stream,
                addr,
                config,
                router,
                auth_provider,
                events,
                shutdown_rx,
            );
            if let Err(e) = handler.run().await {
                if e.is_transient() {
                    info!("Client handler finished: {e}");
                } else {
                    warn!("Client handler error: {e}");
                }
            }
        });
    }

    /// Signals the accept loop and every connection to stop
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }
}

/// Cloneable handle for stopping a running broker
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // No receivers just means nothing is running any more
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::time::Duration;

    fn tls() -> TlsAcceptorConfig {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        TlsAcceptorConfig::new(
            vec![certified.cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der())),
        )
    }

    fn local_config() -> BrokerConfig {
        BrokerConfig::new().with_bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[tokio::test]
    async fn test_bind_requires_tls_files() {
        let err = MqttBroker::bind(local_config()).await.err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port_and_shutdown() {
        let mut broker = MqttBroker::bind_with_tls(local_config(), &tls()).await.unwrap();
        assert_ne!(broker.local_addr().port(), 0);

        let handle = broker.shutdown_handle();
        let task = tokio::spawn(async move { broker.run().await });
        handle.shutdown();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_run_still_stops_it() {
        let mut broker = MqttBroker::bind_with_tls(local_config(), &tls()).await.unwrap();
        broker.shutdown();

        tokio::time::timeout(Duration::from_secs(1), broker.run())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_racing_spawned_run() {
        for _ in 0..20 {
            let mut broker = MqttBroker::bind_with_tls(local_config(), &tls()).await.unwrap();
            let handle = broker.shutdown_handle();
            let task = tokio::spawn(async move { broker.run().await });
            handle.shutdown();

            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let mut broker = MqttBroker::bind_with_tls(local_config(), &tls()).await.unwrap();
        broker.shutdown();
        broker.listener.take();
        assert!(broker.run().await.is_err());
    }
}
