//! CLI Entry Point for shdr-daq
//!
//! Provides command-line interface for:
//! - Discovering adapters on the local network
//! - Ingesting a single SHDR stream
//! - Watching: discovery feeding stream ingestion through the device table
//!
//! # Usage
//!
//! Discover adapters and fetch their descriptors:
//! ```bash
//! shdr-daq discover --describe
//! ```
//!
//! Print one stream as JSON lines:
//! ```bash
//! shdr-daq ingest shdr://10.0.0.12:7878 --device mill-1
//! ```
//!
//! Connect to every discovered device listed under `[[devices]]`:
//! ```bash
//! shdr-daq watch --config config/shdr_daq.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shdr_daq::collab::{DeviceDirectory, JsonDecoder, RecordDecoder, StaticDirectory};
use shdr_daq::config::{DaqConfig, DEFAULT_CONFIG_PATH};
use shdr_daq::discovery::{DiscoveryEngine, DiscoveryEvent};
use shdr_daq::logging;
use shdr_daq::stream::{StreamEvent, StreamIngestionManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser)]
#[command(name = "shdr-daq")]
#[command(about = "Adapter discovery and SHDR stream ingestion", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for adapters and print every device found
    Discover {
        /// Also fetch each device's descriptor
        #[arg(long)]
        describe: bool,
    },

    /// Connect to one SHDR stream and print decoded records
    Ingest {
        /// Stream URI, e.g. shdr://10.0.0.12:7878
        uri: String,

        /// Device id attached to records
        #[arg(long, default_value = "device")]
        device: String,
    },

    /// Discover devices and stream those listed in the device table
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = DaqConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Discover { describe } => discover(config, describe).await,
        Commands::Ingest { uri, device } => ingest(config, &uri, &device).await,
        Commands::Watch => watch(config).await,
    }
}

async fn discover(mut config: DaqConfig, describe: bool) -> Result<()> {
    config.discovery.fetch_descriptors |= describe;
    let mut engine = DiscoveryEngine::from_config(&config.discovery)?;
    let mut events = engine.subscribe();
    engine.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_discovery(&event)?,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Discovery events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    engine.stop().await;
    Ok(())
}

async fn ingest(config: DaqConfig, uri: &str, device: &str) -> Result<()> {
    let (manager, mut events) = StreamIngestionManager::from_config(&config.stream);
    manager.connect_to(uri, device).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(StreamEvent::Closed { endpoint, reason, .. }) => {
                    tracing::info!(endpoint = %endpoint, reason = %reason, "Stream ended");
                    break;
                }
                Some(event) => print_stream(&event),
                None => break,
            },
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn watch(config: DaqConfig) -> Result<()> {
    let directory = StaticDirectory::from_config(&config);
    if directory.is_empty() {
        tracing::warn!("No [[devices]] configured; discovered devices will only be listed");
    }

    let (manager, mut stream_events) = StreamIngestionManager::from_config(&config.stream);
    let manager = Arc::new(manager);
    let mut engine = DiscoveryEngine::from_config(&config.discovery)?;
    let mut discovery_events = engine.subscribe();
    engine.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = discovery_events.recv() => match event {
                Ok(DiscoveryEvent::DeviceFound(device)) => {
                    match directory.lookup(&device.uuid) {
                        Some(binding) => spawn_connect(&manager, binding.stream_uri, binding.id),
                        None => tracing::debug!(uuid = %device.uuid, "Device not in table"),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Discovery events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = stream_events.recv() => match event {
                Some(event) => print_stream(&event),
                None => break,
            },
        }
    }

    engine.stop().await;
    manager.shutdown().await;
    drain(&mut stream_events);
    Ok(())
}

fn spawn_connect(manager: &Arc<StreamIngestionManager>, uri: String, device_id: String) {
    let manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.connect_to(&uri, &device_id).await {
            tracing::warn!(uri = %uri, device_id = %device_id, error = %e, "Stream connect failed");
        }
    });
}

fn print_discovery(event: &DiscoveryEvent) -> Result<()> {
    match event {
        DiscoveryEvent::DeviceFound(device) => {
            println!("{}", serde_json::to_string(device)?);
        }
        DiscoveryEvent::Described(descriptor) => {
            println!("{}", serde_json::to_string(descriptor)?);
        }
        DiscoveryEvent::DescribeFailed { device, error } => {
            eprintln!("{} ({}:{}): {}", device.uuid, device.hostname, device.port, error);
        }
    }
    Ok(())
}

fn print_stream(event: &StreamEvent) {
    match event {
        StreamEvent::Data { record, .. } => match JsonDecoder.decode(record) {
            Ok(doc) => println!("{}", doc),
            Err(e) => tracing::warn!(key = %record.key, error = %e, "Undecodable record"),
        },
        StreamEvent::Command { device_id, name, value, .. } => {
            tracing::info!(device_id = %device_id, command = %name, value = %value, "Adapter command");
        }
        StreamEvent::Closed { endpoint, device_id, reason } => {
            tracing::info!(endpoint = %endpoint, device_id = %device_id, reason = %reason, "Stream closed");
        }
    }
}

fn drain(events: &mut mpsc::Receiver<StreamEvent>) {
    while let Ok(event) = events.try_recv() {
        print_stream(&event);
    }
}
