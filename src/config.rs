//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for discovery and
//! stream ingestion. Configuration is loaded from:
//! 1. `config/shdr_daq.toml` (base configuration)
//! 2. Environment variables (prefixed with `SHDR_DAQ_`, nested keys joined by `__`)
//!
//! Every section carries defaults, so a missing or empty file still yields a
//! usable configuration.
//!
//! # Example
//! ```no_run
//! use shdr_daq::config::DaqConfig;
//!
//! let config = DaqConfig::load()?;
//! println!("Searching for: {}", config.discovery.query);
//! # Ok::<(), shdr_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::stream::connection::DEFAULT_MAX_LINE_BYTES;
use crate::stream::endpoint::parse_stream_uri;
use crate::stream::shdr::RecordCategory;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/shdr_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Multicast search settings
    pub discovery: DiscoveryConfig,
    /// SHDR stream settings
    pub stream: StreamConfig,
    /// Static uuid to stream bindings
    pub devices: Vec<DeviceBinding>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "shdr-daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Discovery engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service-type filter sent as the `ST` header
    pub query: String,
    /// Delay between search broadcasts in milliseconds
    pub frequency_ms: u64,
    /// Where search requests are sent (multicast group or unicast responder)
    pub search_target: String,
    /// Local address the search socket binds to
    pub bind_addr: String,
    /// Multicast hop limit, applied only to multicast targets
    pub multicast_ttl: u32,
    /// `MX` header value in seconds
    pub mx_secs: u32,
    /// Run the descriptor pipeline for every found device
    pub fetch_descriptors: bool,
    /// Per-request timeout for descriptor retrieval in milliseconds
    pub http_timeout_ms: u64,
    /// Capacity of the discovery event channel
    pub event_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            query: "urn:mtconnect-org:service:MTConnectAgent:1".to_string(),
            frequency_ms: 10_000,
            search_target: "239.255.255.250:1900".to_string(),
            bind_addr: "0.0.0.0:0".to_string(),
            multicast_ttl: 2,
            mx_secs: 1,
            fetch_descriptors: false,
            http_timeout_ms: 5_000,
            event_capacity: 64,
        }
    }
}

impl DiscoveryConfig {
    /// Search interval as a [`Duration`].
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }

    /// Descriptor request timeout as a [`Duration`].
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Parsed search target.
    pub fn search_target_addr(&self) -> AppResult<SocketAddr> {
        parse_socket_addr("discovery.search_target", &self.search_target)
    }

    /// Parsed local bind address.
    pub fn bind_socket_addr(&self) -> AppResult<SocketAddr> {
        parse_socket_addr("discovery.bind_addr", &self.bind_addr)
    }
}

/// Stream ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Connect timeout in milliseconds; unset waits for the OS
    pub connect_timeout_ms: Option<u64>,
    /// Capacity of the stream event channel
    pub event_capacity: usize,
    /// Port used when a stream URI omits one
    pub default_port: u16,
    /// Longest SHDR line kept in memory, in bytes
    pub max_line_bytes: usize,
    /// Per-key category overrides, e.g. `msg = "message"`
    pub category_hints: BTreeMap<String, RecordCategory>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: None,
            event_capacity: 1024,
            default_port: 7878,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            category_hints: BTreeMap::new(),
        }
    }
}

impl StreamConfig {
    /// Connect timeout as a [`Duration`], if configured.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

/// Binding of a discovered device uuid to the stream the application should open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    /// Device uuid as reported in the search response `USN`
    pub uuid: String,
    /// Device id attached to every record from this stream
    pub id: String,
    /// SHDR stream URI, e.g. `shdr://10.0.0.12:7878`
    pub stream_uri: String,
}

impl DaqConfig {
    /// Load configuration from `config/shdr_daq.toml` and environment variables
    ///
    /// Environment variables override file values with prefix `SHDR_DAQ_`.
    /// Example: `SHDR_DAQ_DISCOVERY__FREQUENCY_MS=2000`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(DaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SHDR_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.discovery.frequency_ms == 0 {
            return Err(DaqError::Config(
                "discovery.frequency_ms must be greater than zero".into(),
            ));
        }
        if self.discovery.query.trim().is_empty() {
            return Err(DaqError::Config("discovery.query cannot be empty".into()));
        }
        if self.discovery.event_capacity == 0 || self.stream.event_capacity == 0 {
            return Err(DaqError::Config(
                "event_capacity must be greater than zero".into(),
            ));
        }
        if self.stream.max_line_bytes == 0 {
            return Err(DaqError::Config(
                "stream.max_line_bytes must be greater than zero".into(),
            ));
        }
        self.discovery.search_target_addr()?;
        self.discovery.bind_socket_addr()?;

        let mut ids = HashSet::new();
        let mut uuids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(DaqError::Config(format!("Duplicate device id: {}", device.id)));
            }
            if !uuids.insert(&device.uuid) {
                return Err(DaqError::Config(format!(
                    "Duplicate device uuid: {}",
                    device.uuid
                )));
            }
            parse_stream_uri(&device.stream_uri, self.stream.default_port)?;
        }

        Ok(())
    }
}

fn parse_socket_addr(field: &str, value: &str) -> AppResult<SocketAddr> {
    value
        .parse()
        .map_err(|_| DaqError::Config(format!("{} is not a socket address: '{}'", field, value)))
}
