//! Device session driver
//!
//! [`SessionDriver`] runs one device flow end to end: mint a credential,
//! connect, publish a numbered run of messages and disconnect. It works over
//! any [`DeviceTransport`], so tests drive it with [`crate::MockTransport`].
//!
//! Credentials are short-lived. Before every publish the driver checks how
//! long the current credential has left; once that drops below the refresh
//! margin it mints a new one and reconnects, since MQTT 3.1.1 has no way to
//! re-authenticate an open session.

use crate::client::{ConnectOptions, DeviceTransport};
use crate::config::DeviceConfig;
use crate::credential::{CredentialMinter, SigningKey};
use crate::error::{IotCoreError, Result};
use crate::harness::LocalHarness;
use crate::identity::IdentityPath;
use crate::transport::load_certs_pem;
use rustls::pki_types::CertificateDer;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Outcome of a completed or cancelled run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Messages the broker acknowledged
    pub published: u32,
    /// Reconnects made to present a fresh credential
    pub reconnects: u32,
    /// Whether the run stopped early on the shutdown signal
    pub cancelled: bool,
}

/// Drives a device session over a transport
pub struct SessionDriver<T> {
    config: DeviceConfig,
    identity: IdentityPath,
    minter: CredentialMinter,
    transport: T,
    endpoint: String,
    root_certs: Vec<CertificateDer<'static>>,
    use_web_roots: bool,
}

impl<T: DeviceTransport> SessionDriver<T> {
    /// Prepares a driver, loading the signing key up front
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid or the private
    /// key (or CA certificate) cannot be loaded.
    pub fn new(config: DeviceConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let identity = config.identity()?;

        let key_file = config.private_key_file.as_ref().ok_or_else(|| {
            IotCoreError::Configuration("private_key_file is required".to_string())
        })?;
        let key = SigningKey::from_pem_file(config.algorithm, key_file)?;
        let minter =
            CredentialMinter::new(key, config.project_id.clone()).with_lifetime(config.token_lifetime());

        let root_certs = match &config.ca_cert_file {
            Some(path) => load_certs_pem(path)?,
            None => Vec::new(),
        };

        Ok(Self {
            endpoint: config.endpoint.clone(),
            config,
            identity,
            minter,
            transport,
            root_certs,
            use_web_roots: true,
        })
    }

    /// Points the driver at a self-test broker, trusting only its certificate
    #[must_use]
    pub fn with_harness(mut self, harness: &LocalHarness) -> Self {
        self.endpoint = harness.endpoint();
        self.root_certs = vec![harness.root_certificate()];
        self.use_web_roots = false;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn identity(&self) -> &IdentityPath {
        &self.identity
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs the session until every message is published or `shutdown`
    /// resolves, then disconnects
    ///
    /// # Errors
    ///
    /// Returns the first connect, publish or delivery error. The transport
    /// is still disconnected before the error is returned.
    pub async fn run<F>(&self, shutdown: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut report = RunReport::default();

        let outcome = self.publish_all(&mut report, &mut shutdown).await;

        if self.transport.is_connected() {
            if let Err(e) = self.transport.disconnect(self.config.disconnect_grace()).await {
                warn!("Disconnect failed: {e}");
            }
        }

        outcome?;
        info!(
            published = report.published,
            reconnects = report.reconnects,
            cancelled = report.cancelled,
            "Session finished"
        );
        Ok(report)
    }

    async fn publish_all<F>(
        &self,
        report: &mut RunReport,
        shutdown: &mut std::pin::Pin<&mut F>,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let topic = self.config.topic_name();
        let ack_timeout = self.config.connect_timeout();

        let Some(mut refresh_at) = self.open_cancellable(shutdown).await? else {
            report.cancelled = true;
            return Ok(());
        };

        for i in 0..self.config.message_count {
            if Instant::now() >= refresh_at {
                info!("Credential close to expiry, reconnecting with a fresh one");
                self.transport.disconnect(self.config.disconnect_grace()).await?;
                let Some(next) = self.open_cancellable(shutdown).await? else {
                    report.cancelled = true;
                    return Ok(());
                };
                refresh_at = next;
                report.reconnects += 1;
            }

            let payload = format!("Message {i}");
            debug!(topic = %topic, payload = %payload, "Publishing");
            let token = self
                .transport
                .publish(&topic, payload.into_bytes(), self.config.qos, self.config.retain)
                .await?;

            tokio::select! {
                biased;
                () = shutdown.as_mut() => {
                    report.cancelled = true;
                    return Ok(());
                }
                delivered = token.wait_timeout(ack_timeout) => delivered?,
            }
            report.published += 1;

            tokio::select! {
                biased;
                () = shutdown.as_mut() => {
                    report.cancelled = true;
                    return Ok(());
                }
                () = sleep(self.config.publish_interval()) => {}
            }
        }
        Ok(())
    }

    /// Opens a session unless shutdown comes first
    ///
    /// Returns the instant after which the credential must be replaced.
    async fn open_cancellable<F>(&self, shutdown: &mut std::pin::Pin<&mut F>) -> Result<Option<Instant>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            () = shutdown.as_mut() => Ok(None),
            opened = self.open_session() => opened.map(Some),
        }
    }

    async fn open_session(&self) -> Result<Instant> {
        let credential = self.minter.mint()?;
        let minted_at = Instant::now();
        debug!(alg = %credential.algorithm(), "Minted credential");

        let mut options = ConnectOptions::for_device(self.endpoint.clone(), &self.identity, &credential)
            .with_keep_alive(Duration::from_secs(u64::from(self.config.keep_alive_secs)))
            .with_connect_timeout(self.config.connect_timeout())
            .with_web_roots(self.use_web_roots);
        options.root_certs.extend(self.root_certs.iter().cloned());

        info!(client_id = %self.identity, endpoint = %self.endpoint, "Connecting");
        let connected = timeout(self.config.connect_timeout(), self.transport.connect(options)).await?;
        connected?;

        let usable = self
            .minter
            .lifetime()
            .saturating_sub(self.config.refresh_margin());
        Ok(minted_at + usable)
    }
}
