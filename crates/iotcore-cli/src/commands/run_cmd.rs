use anyhow::{Context, Result};
use clap::Args;
use dialoguer::{Input, Select};
use iotcore_mqtt::{Algorithm, DeviceConfig, LocalHarness, MqttClient, SessionDriver, TopicKind};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};

#[derive(Args)]
pub struct RunCommand {
    /// Configuration file path (JSON format); flags override its values
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Cloud project id, also the token audience
    #[arg(long)]
    pub project_id: Option<String>,

    /// Device registry id
    #[arg(long)]
    pub registry_id: Option<String>,

    /// Device id
    #[arg(long)]
    pub device_id: Option<String>,

    /// Signing algorithm (RS256 or ES256)
    #[arg(long)]
    pub algorithm: Option<Algorithm>,

    /// Cloud region
    #[arg(long)]
    pub cloud_region: Option<String>,

    /// Device private key (PEM)
    #[arg(long)]
    pub private_key_file: Option<PathBuf>,

    /// Device public key (PEM), needed by --self-test
    #[arg(long)]
    pub public_key_file: Option<PathBuf>,

    /// Broker endpoint (mqtts://host:port)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Extra CA certificate (PEM) to trust for the broker
    #[arg(long)]
    pub ca_certs: Option<PathBuf>,

    /// Topic to publish to (events or state); --self-test only accepts events
    #[arg(long)]
    pub message_type: Option<TopicKind>,

    /// Number of messages to publish
    #[arg(long, short = 'n')]
    pub num_messages: Option<u32>,

    /// Delay after each publish, in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Credential lifetime in seconds
    #[arg(long)]
    pub token_lifetime: Option<u64>,

    /// Run against a local verifying broker instead of the endpoint
    #[arg(long)]
    pub self_test: bool,

    /// Skip prompts and fail if required args missing
    #[arg(long)]
    pub non_interactive: bool,
}

pub async fn execute(mut cmd: RunCommand) -> Result<()> {
    let config = build_config(&mut cmd)?;
    config.validate().context("Configuration validation failed")?;

    let harness = if config.self_test {
        let harness = LocalHarness::for_device(&config)
            .await
            .context("Failed to start self-test broker")?;
        println!("Self-test broker listening on {}", harness.endpoint());
        Some(harness)
    } else {
        None
    };

    let mut driver = SessionDriver::new(config, MqttClient::new())
        .context("Failed to prepare device session")?;
    if let Some(harness) = &harness {
        driver = driver.with_harness(harness);
    }

    println!("Connecting {} to {}", driver.identity(), driver.endpoint());

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => println!("\nReceived Ctrl+C, disconnecting..."),
            Err(err) => {
                tracing::error!("Unable to listen for shutdown signal: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    let outcome = driver.run(shutdown).await;

    if let Some(harness) = harness {
        harness
            .shutdown()
            .await
            .context("Self-test broker did not stop cleanly")?;
    }

    let report = outcome.context("Device session failed")?;
    println!(
        "✓ Published {} message(s), {} reconnect(s){}",
        report.published,
        report.reconnects,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

fn build_config(cmd: &mut RunCommand) -> Result<DeviceConfig> {
    let base = match &cmd.config {
        Some(path) => {
            debug!("Loading configuration from: {:?}", path);
            Some(
                DeviceConfig::from_json_file(path)
                    .with_context(|| format!("Failed to load config from {path:?}"))?,
            )
        }
        None => None,
    };

    let mut config = match base {
        Some(config) => config,
        None => {
            let project_id = required(cmd.project_id.take(), "project id", cmd.non_interactive)?;
            let registry_id =
                required(cmd.registry_id.take(), "registry id", cmd.non_interactive)?;
            let device_id = required(cmd.device_id.take(), "device id", cmd.non_interactive)?;
            let algorithm = match cmd.algorithm.take() {
                Some(algorithm) => algorithm,
                None if cmd.non_interactive => {
                    anyhow::bail!("--algorithm is required. Use RS256 or ES256")
                }
                None => prompt_algorithm()?,
            };
            DeviceConfig::new(project_id, registry_id, device_id, algorithm)
        }
    };

    if let Some(project_id) = cmd.project_id.take() {
        config.project_id = project_id;
    }
    if let Some(registry_id) = cmd.registry_id.take() {
        config.registry_id = registry_id;
    }
    if let Some(device_id) = cmd.device_id.take() {
        config.device_id = device_id;
    }
    if let Some(algorithm) = cmd.algorithm {
        config.algorithm = algorithm;
    }
    if let Some(region) = cmd.cloud_region.take() {
        config = config.with_region(region);
    }
    if let Some(path) = cmd.private_key_file.take() {
        config = config.with_private_key_file(path);
    }
    if let Some(path) = cmd.public_key_file.take() {
        config = config.with_public_key_file(path);
    }
    if let Some(endpoint) = cmd.endpoint.take() {
        config = config.with_endpoint(endpoint);
    }
    if let Some(path) = cmd.ca_certs.take() {
        config = config.with_ca_cert_file(path);
    }
    if let Some(kind) = cmd.message_type {
        config = config.with_topic(kind);
    }
    if let Some(count) = cmd.num_messages {
        config = config.with_message_count(count);
    }
    if let Some(interval) = cmd.interval_ms {
        config = config.with_publish_interval(Duration::from_millis(interval));
    }
    if let Some(lifetime) = cmd.token_lifetime {
        config = config.with_token_lifetime(Duration::from_secs(lifetime));
    }
    if cmd.self_test {
        config = config.with_self_test(true);
    }

    if config.private_key_file.is_none() {
        let path = required(None, "private key file", cmd.non_interactive)?;
        config = config.with_private_key_file(path);
    }
    if config.self_test && config.public_key_file.is_none() {
        let path = required(None, "public key file", cmd.non_interactive)?;
        config = config.with_public_key_file(path);
    }

    info!(device = %config.device_id, algorithm = %config.algorithm, "Device configured");
    Ok(config)
}

fn required(value: Option<String>, what: &str, non_interactive: bool) -> Result<String> {
    if let Some(value) = value {
        return Ok(value);
    }
    if non_interactive {
        anyhow::bail!(
            "The {what} is required. Pass it as a flag or run without --non-interactive"
        );
    }
    Input::<String>::new()
        .with_prompt(capitalize(what))
        .interact()
        .with_context(|| format!("Failed to get {what} input"))
}

fn prompt_algorithm() -> Result<Algorithm> {
    let options = ["RS256 (RSA key)", "ES256 (P-256 EC key)"];
    let selection = Select::new()
        .with_prompt("Signing algorithm")
        .items(&options)
        .default(0)
        .interact()
        .context("Failed to get algorithm selection")?;
    Ok(if selection == 1 {
        Algorithm::Es256
    } else {
        Algorithm::Rs256
    })
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunCommand,
    }

    fn parse(args: &[&str]) -> RunCommand {
        let mut argv = vec!["iotcore"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).run
    }

    #[test]
    fn test_flags_build_config() {
        let mut cmd = parse(&[
            "--project-id",
            "p1",
            "--registry-id",
            "r1",
            "--device-id",
            "d1",
            "--algorithm",
            "ES256",
            "--private-key-file",
            "ec_private.pem",
            "--num-messages",
            "2",
            "--non-interactive",
        ]);
        let config = build_config(&mut cmd).unwrap();
        assert_eq!(config.algorithm, Algorithm::Es256);
        assert_eq!(config.message_count, 2);
        assert_eq!(config.region, "us-central1");
        assert_eq!(config.topic_name(), "/devices/d1/events");
    }

    #[test]
    fn test_unknown_algorithm_rejected_by_parser() {
        let argv = ["iotcore", "--algorithm", "HS256"];
        assert!(TestCli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_non_interactive_missing_values_fail() {
        let mut cmd = parse(&["--project-id", "p1", "--non-interactive"]);
        assert!(build_config(&mut cmd).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"project_id":"p1","registry_id":"r1","device_id":"d1","algorithm":"RS256","private_key_file":"rsa.pem"}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut cmd = parse(&[
            "--config",
            &path,
            "--device-id",
            "d2",
            "--message-type",
            "state",
            "--non-interactive",
        ]);
        let config = build_config(&mut cmd).unwrap();
        assert_eq!(config.project_id, "p1");
        assert_eq!(config.device_id, "d2");
        assert_eq!(config.topic_name(), "/devices/d2/state");
    }
}
