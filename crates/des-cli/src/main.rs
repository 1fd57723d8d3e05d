//! Command-line interface for the DES control plane.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use des_core::codec;
use des_core::config::{self, DesConfig};
use des_devices::{
    DesService, InboundMessage, MqttTransport, Registration, RequestSource, SampleEnvelope,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Inbound queue between the broker event loop and the dispatcher.
const INBOUND_CAPACITY: usize = 1024;

/// DES control plane - device registry, job lifecycle and telemetry storage.
#[derive(Parser, Debug)]
#[command(name = "des")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to ./des.toml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker and serve every registered device.
    Serve,
    /// Register a device and create its command archive.
    Register {
        /// Device serial number.
        #[arg(long)]
        serial: String,
        /// Hardware class (first topic level).
        #[arg(long)]
        class: String,
        /// Hardware version (second topic level).
        #[arg(long)]
        version: String,
        /// User recorded as the registrant.
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Decode a sample payload: an envelope JSON or bare base64url frames.
    DecodeSample {
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Serve => {
            let config = DesConfig::load(args.config.as_deref())?;
            run_server(config).await
        }
        Command::Register {
            serial,
            class,
            version,
            user,
        } => {
            let config = DesConfig::load(args.config.as_deref())?;
            register(
                config,
                Registration {
                    serial,
                    class,
                    version,
                },
                user,
            )
            .await
        }
        Command::DecodeSample { payload } => decode_sample(&payload),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "des=debug" } else { "des=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    if config::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

async fn start_service(config: &DesConfig) -> Result<DesService> {
    let (tx, rx) = mpsc::channel::<InboundMessage>(INBOUND_CAPACITY);
    let transport = MqttTransport::connect(&config.mqtt, tx, CancellationToken::new())
        .context("Failed to start MQTT transport")?;
    let service = DesService::start(config, Arc::new(transport), rx)
        .context("Failed to start DES service")?;
    Ok(service)
}

async fn run_server(config: DesConfig) -> Result<()> {
    let service = start_service(&config).await?;
    let connected = service.connect_all().await?;
    tracing::info!(connected, "Serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    service.shutdown().await;
    Ok(())
}

async fn register(config: DesConfig, registration: Registration, user: String) -> Result<()> {
    let service = start_service(&config).await?;
    let source = RequestSource::admin("cli", user, "des-cli");
    let result = service.register_device(&source, registration).await;
    service.shutdown().await;

    let device = result?;
    println!("{}", serde_json::to_string_pretty(&device)?);
    Ok(())
}

fn decode_sample(payload: &str) -> Result<()> {
    let payload = payload.trim();
    let samples = if payload.starts_with('{') {
        SampleEnvelope::from_bytes(payload.as_bytes())?.unpack()?
    } else {
        codec::decode_text(payload)?
    };
    println!("{}", serde_json::to_string_pretty(&samples)?);
    Ok(())
}
