use anyhow::{Context, Result};
use clap::Args;
use iotcore_mqtt::broker::{BrokerConfig, BrokerEvent, MqttBroker, TokenAuthProvider};
use iotcore_mqtt::{Algorithm, AuthorizationPolicy, CredentialVerifier, IdentityPath, VerifyingKey};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Args)]
pub struct BrokerCommand {
    /// TLS bind address
    #[arg(long, short = 'H', default_value = "0.0.0.0:8883")]
    pub host: String,

    /// TLS certificate file path (PEM format)
    #[arg(long)]
    pub tls_cert: PathBuf,

    /// TLS private key file path (PEM format)
    #[arg(long)]
    pub tls_key: PathBuf,

    /// Project id expected as the token audience
    #[arg(long)]
    pub project_id: String,

    #[arg(long, default_value = "us-central1")]
    pub cloud_region: String,

    #[arg(long)]
    pub registry_id: String,

    /// The one device this broker admits
    #[arg(long)]
    pub device_id: String,

    /// Algorithm the device signs with (RS256 or ES256)
    #[arg(long)]
    pub algorithm: Algorithm,

    /// Device public key (PEM)
    #[arg(long)]
    pub public_key_file: PathBuf,

    /// Accepted clock skew on token issue time, in seconds
    #[arg(long, default_value = "0")]
    pub leeway: u64,

    /// Seconds a client has to finish TLS and send CONNECT
    #[arg(long, default_value = "10")]
    pub connect_timeout: u64,
}

pub async fn execute(cmd: BrokerCommand) -> Result<()> {
    info!("Starting verifying MQTT broker...");

    let bind_addr: SocketAddr = cmd
        .host
        .parse()
        .with_context(|| format!("Invalid bind address: {}", cmd.host))?;

    let key = VerifyingKey::from_pem_file(cmd.algorithm, &cmd.public_key_file)
        .with_context(|| format!("Failed to load public key {:?}", cmd.public_key_file))?;
    let verifier = CredentialVerifier::new(key, cmd.project_id.clone())
        .with_leeway(Duration::from_secs(cmd.leeway));
    let identity = IdentityPath::new(
        &cmd.project_id,
        &cmd.cloud_region,
        &cmd.registry_id,
        &cmd.device_id,
    )
    .context("Invalid device identity")?;
    let policy = AuthorizationPolicy::new(identity);
    debug!(identity = %policy.identity(), topic = %policy.allowed_topic(), "Policy loaded");

    let config = BrokerConfig::new()
        .with_bind_address(bind_addr)
        .with_tls_files(cmd.tls_cert.clone(), cmd.tls_key.clone())
        .with_allowed_protocol_levels(vec![4])
        .with_connect_timeout(Duration::from_secs(cmd.connect_timeout));
    config
        .validate()
        .context("Configuration validation failed")?;

    let auth = TokenAuthProvider::new(verifier, policy);
    let mut broker = MqttBroker::bind(config)
        .await
        .context("Failed to create MQTT broker")?
        .with_auth_provider(Arc::new(auth));

    println!("MQTT broker listening on {}", broker.local_addr());
    println!("  Admitting {}", cmd.device_id);
    println!("  Press Ctrl+C to stop");

    tokio::spawn(print_events(broker.subscribe_events()));

    let handle = broker.shutdown_handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => println!("\nReceived Ctrl+C, shutting down gracefully..."),
            Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
        }
        handle.shutdown();
    });

    broker.run().await.context("Broker error")?;

    println!("✓ MQTT broker stopped");
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<BrokerEvent>) {
    loop {
        match events.recv().await {
            Ok(BrokerEvent::ClientConnected { client_id, addr }) => {
                println!("+ {client_id} connected from {addr}");
            }
            Ok(BrokerEvent::ConnectionRefused {
                client_id,
                return_code,
                reason,
                ..
            }) => match reason {
                Some(reason) => println!("! {client_id} refused ({return_code}): {reason}"),
                None => println!("! {client_id} refused ({return_code})"),
            },
            Ok(BrokerEvent::MessagePublished { topic, payload, .. }) => {
                println!("{topic}: {}", String::from_utf8_lossy(&payload));
            }
            Ok(BrokerEvent::PublishDenied { topic, reason, .. }) => {
                println!("! publish to {topic} denied: {reason}");
            }
            Ok(BrokerEvent::SubscribeDenied {
                topic_filter, reason, ..
            }) => {
                println!("! subscribe to {topic_filter} denied: {reason}");
            }
            Ok(BrokerEvent::ClientDisconnected { client_id }) => {
                println!("- {client_id} disconnected");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Event printer skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
