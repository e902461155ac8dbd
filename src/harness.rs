//! Loopback verifying broker for self-tests
//!
//! [`LocalHarness`] generates a self-signed `localhost` certificate, binds a
//! TLS broker on an ephemeral loopback port and installs a
//! [`TokenAuthProvider`] built from the verifier and policy it is given. A
//! device can then run against [`LocalHarness::endpoint`] trusting only
//! [`LocalHarness::root_certificate`].

use crate::broker::{
    BrokerConfig, BrokerEvent, MqttBroker, ShutdownHandle, TlsAcceptorConfig, TokenAuthProvider,
};
use crate::config::DeviceConfig;
use crate::credential::{CredentialVerifier, VerifyingKey};
use crate::error::{IotCoreError, Result};
use crate::policy::AuthorizationPolicy;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Hostname the generated certificate is valid for
pub const HARNESS_HOST: &str = "localhost";

/// A running loopback broker
pub struct LocalHarness {
    local_addr: SocketAddr,
    root_cert: CertificateDer<'static>,
    events: broadcast::Receiver<BrokerEvent>,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<()>>,
}

impl LocalHarness {
    /// Starts a broker that admits only what `verifier` and `policy` allow
    ///
    /// # Errors
    ///
    /// Returns `Tls` if the certificate cannot be generated and an I/O error
    /// if the listener cannot be bound.
    pub async fn start(verifier: CredentialVerifier, policy: AuthorizationPolicy) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec![HARNESS_HOST.to_string()])
            .map_err(|e| IotCoreError::Tls(format!("Failed to generate certificate: {e}")))?;
        let root_cert = certified.cert.der().clone();
        let private_key =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
        let tls = TlsAcceptorConfig::new(vec![root_cert.clone()], private_key);

        let config = BrokerConfig::new()
            .with_bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_allowed_protocol_levels(vec![4]);

        let auth = TokenAuthProvider::new(verifier, policy);
        let mut broker = MqttBroker::bind_with_tls(config, &tls)
            .await?
            .with_auth_provider(Arc::new(auth));

        let local_addr = broker.local_addr();
        let events = broker.subscribe_events();
        let shutdown = broker.shutdown_handle();
        let task = tokio::spawn(async move { broker.run().await });

        info!(addr = %local_addr, "Self-test broker started");
        Ok(Self {
            local_addr,
            root_cert,
            events,
            shutdown,
            task,
        })
    }

    /// Starts a broker for the device described by `config`
    ///
    /// The verifier uses `config.public_key_file` and expects the project id
    /// as audience; the policy admits exactly the configured identity.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if no public key is configured, plus anything
    /// [`start`](Self::start) or key loading returns.
    pub async fn for_device(config: &DeviceConfig) -> Result<Self> {
        let Some(public_key_file) = &config.public_key_file else {
            return Err(IotCoreError::Configuration(
                "public_key_file is required for self-test".to_string(),
            ));
        };
        let key = VerifyingKey::from_pem_file(config.algorithm, public_key_file)?;
        let verifier = CredentialVerifier::new(key, config.project_id.clone());
        let policy = AuthorizationPolicy::new(config.identity()?);
        Self::start(verifier, policy).await
    }

    /// `mqtts://localhost:{port}`
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("mqtts://{HARNESS_HOST}:{}", self.local_addr.port())
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Certificate a client must trust to reach this broker
    #[must_use]
    pub fn root_certificate(&self) -> CertificateDer<'static> {
        self.root_cert.clone()
    }

    /// Receiver for broker status events from this point on
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.resubscribe()
    }

    /// Stops the broker and waits for the accept loop to exit
    ///
    /// # Errors
    ///
    /// Returns the accept loop's error, if it ended with one.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.shutdown();
        let result = self
            .task
            .await
            .map_err(|e| IotCoreError::ProtocolError(format!("Broker task failed: {e}")))?;
        debug!("Self-test broker stopped");
        result
    }
}
