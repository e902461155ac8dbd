use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "iotcore")]
#[command(about = "Token-authenticated MQTT device simulator and verifying broker")]
#[command(version)]
#[command(
    long_about = "Runs a device that signs a short-lived JWT, connects over MQTT 3.1.1 on TLS and publishes telemetry, or a local broker that verifies such devices."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect as a device and publish telemetry
    Run(commands::run_cmd::RunCommand),
    /// Start a broker that verifies device credentials
    Broker(commands::broker_cmd::BrokerCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .init();

    match cli.command {
        Commands::Run(cmd) => commands::run_cmd::execute(cmd).await,
        Commands::Broker(cmd) => commands::broker_cmd::execute(cmd).await,
    }
}
