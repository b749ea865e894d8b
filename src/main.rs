//! iothub-device command line entry point

use clap::{Parser, Subcommand};
use iothub_device::config::DeviceConfig;
use iothub_device::device::{
    builtin_registry, ConnectionManager, DeviceRuntime, PublishOutcome, Publisher, ReconnectConfig,
};
use iothub_device::observability::init_default_logging;
use iothub_device::protocol::TelemetryMessage;
use iothub_device::transport::mqtt::MqttClient;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Device client for IoT hub MQTT brokers
#[derive(Parser)]
#[command(name = "iothub-device")]
#[command(about = "Telemetry and direct-method client for IoT hub MQTT brokers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOTHUB_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, serve direct methods and send periodic telemetry
    Run,
    /// Send a single telemetry message and exit
    Send {
        /// JSON object placed in the telemetry `payload` field
        #[arg(long)]
        payload: String,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting iothub-device v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Send { payload } => send_once(config, &payload).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(path)?);
    }

    for path_str in ["device.toml", "config/device.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DeviceConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create device.toml".into())
}

fn build_transport(config: &DeviceConfig) -> Result<Arc<MqttClient>, Box<dyn std::error::Error>> {
    let transport = MqttClient::new(&config.identity(), &config.broker, config.get_sas_token()?)?;
    Ok(Arc::new(transport))
}

async fn run_device(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Device starting with ID: {}", config.device.id);

    let transport = build_transport(&config)?;
    let runtime = DeviceRuntime::new(&config, transport, builtin_registry(&config.device.id));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    if let Err(e) = runtime.start().await {
        warn!("Running without a broker connection for now: {}", e);
    }

    info!("Device is running and waiting for direct methods");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    runtime.shutdown().await?;
    Ok(())
}

async fn send_once(config: DeviceConfig, payload: &str) -> Result<(), Box<dyn std::error::Error>> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;

    let transport = build_transport(&config)?;
    let connection = Arc::new(ConnectionManager::new(
        transport,
        ReconnectConfig::from(&config.reconnect),
    ));
    connection.connect().await?;

    let publisher = Publisher::new(connection.clone(), &config.device.id);
    let message = TelemetryMessage::new(config.telemetry.schema.as_str(), payload);
    let outcome = publisher.publish_json(&message).await;

    connection.stop().await?;

    let summary = send_summary(outcome?, publisher.telemetry_topic())?;
    info!("{}", summary);
    Ok(())
}

/// The transport only queues the publish; no PUBACK is awaited before the
/// connection is closed, so success is reported as queued, not delivered.
fn send_summary(outcome: PublishOutcome, topic: &str) -> Result<String, Box<dyn std::error::Error>> {
    match outcome {
        PublishOutcome::Sent => Ok(format!(
            "Telemetry queued for {} (broker acknowledgement not awaited)",
            topic
        )),
        PublishOutcome::NotConnected => Err("Connection lost before telemetry was queued".into()),
    }
}

fn handle_config_command(
    config: &DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
