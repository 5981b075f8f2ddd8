//! Periodic multicast search.
//!
//! While the engine's `searching` flag is set, its task broadcasts the
//! configured query, collects responses for `frequency` milliseconds, and
//! repeats. The flag is re-checked after each wait, so one extra broadcast can
//! slip out if `stop()` races a wake-up; `stop()` also signals the task
//! directly, which ends the wait early in the common case.
//!
//! Responses become [`DiscoveryEvent::DeviceFound`]. With descriptor fetching
//! enabled, each found device also runs the descriptor pipeline in its own task,
//! so a slow or broken agent never holds up the search loop. Those tasks belong
//! to the search loop and are aborted when it exits, so no event follows
//! `stop()`.

use crate::config::DiscoveryConfig;
use crate::discovery::descriptor::{DescriptorFetcher, DeviceDescriptor};
use crate::discovery::ssdp::{search_request, DiscoveredDevice, DiscoveryQuery, SearchResponse};
use crate::error::AppResult;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

/// Largest datagram accepted from a responder.
const MAX_DATAGRAM: usize = 8 * 1024;

/// Event emitted by a discovery run.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A search response named a device.
    DeviceFound(DiscoveredDevice),
    /// The descriptor pipeline completed for a found device.
    Described(DeviceDescriptor),
    /// The descriptor pipeline failed; the search loop carries on.
    DescribeFailed {
        /// Device whose descriptor could not be fetched
        device: DiscoveredDevice,
        /// Rendered error
        error: String,
    },
}

/// Socket-level settings for a discovery run.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Where search requests are sent
    pub search_target: SocketAddr,
    /// Local bind address of the search socket
    pub bind_addr: SocketAddr,
    /// Multicast hop limit
    pub multicast_ttl: u32,
    /// `MX` header value
    pub mx_secs: u32,
    /// Run the descriptor pipeline for found devices
    pub fetch_descriptors: bool,
    /// Descriptor request timeout
    pub http_timeout: Duration,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl DiscoverySettings {
    /// Settings from the `[discovery]` section.
    pub fn from_config(config: &DiscoveryConfig) -> AppResult<Self> {
        Ok(Self {
            search_target: config.search_target_addr()?,
            bind_addr: config.bind_socket_addr()?,
            multicast_ttl: config.multicast_ttl,
            mx_secs: config.mx_secs,
            fetch_descriptors: config.fetch_descriptors,
            http_timeout: config.http_timeout(),
            event_capacity: config.event_capacity,
        })
    }
}

/// Multicast discovery engine.
pub struct DiscoveryEngine {
    query: DiscoveryQuery,
    settings: DiscoverySettings,
    fetcher: DescriptorFetcher,
    searching: Arc<AtomicBool>,
    events: broadcast::Sender<DiscoveryEvent>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryEngine {
    /// Create an idle engine.
    pub fn new(query: DiscoveryQuery, settings: DiscoverySettings) -> AppResult<Self> {
        let fetcher = DescriptorFetcher::new(settings.http_timeout)?;
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Ok(Self {
            query,
            settings,
            fetcher,
            searching: Arc::new(AtomicBool::new(false)),
            events,
            stop_tx: None,
            task: None,
        })
    }

    /// Create an engine from the `[discovery]` section.
    pub fn from_config(config: &DiscoveryConfig) -> AppResult<Self> {
        let query = DiscoveryQuery::new(config.query.clone(), config.frequency_ms);
        Self::new(query, DiscoverySettings::from_config(config)?)
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// The query this engine broadcasts.
    pub fn query(&self) -> &DiscoveryQuery {
        &self.query
    }

    /// The descriptor fetcher used for found devices.
    pub fn fetcher(&self) -> &DescriptorFetcher {
        &self.fetcher
    }

    /// Whether the search loop is active.
    pub fn is_searching(&self) -> bool {
        self.searching.load(Ordering::SeqCst)
    }

    /// Run the descriptor pipeline for one device.
    pub async fn describe(&self, device: &DiscoveredDevice) -> AppResult<DeviceDescriptor> {
        self.fetcher.describe(device).await
    }

    /// Bind the search socket and start the search loop.
    ///
    /// Calling `start` on a running engine is a no-op.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.settings.bind_addr).await?;
        if let IpAddr::V4(group) = self.settings.search_target.ip() {
            if group.is_multicast() {
                socket.set_multicast_ttl_v4(self.settings.multicast_ttl)?;
            }
        }

        tracing::info!(
            query = self.query.search(),
            frequency_ms = self.query.frequency_ms(),
            target = %self.settings.search_target,
            "Starting discovery"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        self.searching.store(true, Ordering::SeqCst);

        let search = SearchLoop {
            socket,
            request: search_request(
                self.query.search(),
                self.settings.search_target,
                self.settings.mx_secs,
            ),
            target: self.settings.search_target,
            frequency: Duration::from_millis(self.query.frequency_ms()),
            searching: self.searching.clone(),
            events: self.events.clone(),
            fetcher: self
                .settings
                .fetch_descriptors
                .then(|| self.fetcher.clone()),
        };

        self.stop_tx = Some(stop_tx);
        self.task = Some(tokio::spawn(search.run(stop_rx)));
        Ok(())
    }

    /// Clear the searching flag and release the search socket.
    ///
    /// Idempotent; safe to call on an engine that never started.
    pub async fn stop(&mut self) {
        self.searching.store(false, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Discovery task ended abnormally");
            }
            tracing::info!(query = self.query.search(), "Discovery stopped");
        }
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.searching.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State owned by the spawned search task.
struct SearchLoop {
    socket: UdpSocket,
    request: String,
    target: SocketAddr,
    frequency: Duration,
    searching: Arc<AtomicBool>,
    events: broadcast::Sender<DiscoveryEvent>,
    fetcher: Option<DescriptorFetcher>,
}

impl SearchLoop {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut describes = JoinSet::new();

        'search: while self.searching.load(Ordering::SeqCst) {
            if let Err(e) = self.socket.send_to(self.request.as_bytes(), self.target).await {
                tracing::warn!(target = %self.target, error = %e, "Search broadcast failed");
            }

            let wait = tokio::time::sleep(self.frequency);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    _ = stop_rx.changed() => break 'search,
                    received = self.socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from, &mut describes),
                        Err(e) => tracing::debug!(error = %e, "Search socket receive failed"),
                    },
                    Some(joined) = describes.join_next(), if !describes.is_empty() => {
                        if let Err(e) = joined {
                            tracing::warn!(error = %e, "Descriptor task ended abnormally");
                        }
                    }
                }
            }
        }

        if !describes.is_empty() {
            tracing::debug!(pending = describes.len(), "Aborting descriptor fetches");
        }
        describes.shutdown().await;
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr, describes: &mut JoinSet<()>) {
        let text = String::from_utf8_lossy(datagram);
        let device = match SearchResponse::parse(&text)
            .and_then(|response| DiscoveredDevice::from_response(&response))
        {
            Ok(device) => device,
            Err(e) => {
                tracing::debug!(from = %from, error = %e, "Ignoring search response");
                return;
            }
        };

        tracing::info!(
            hostname = %device.hostname,
            port = device.port,
            uuid = %device.uuid,
            "Device found"
        );
        let _ = self.events.send(DiscoveryEvent::DeviceFound(device.clone()));

        if let Some(fetcher) = &self.fetcher {
            let fetcher = fetcher.clone();
            let events = self.events.clone();
            describes.spawn(async move {
                let event = match fetcher.describe(&device).await {
                    Ok(descriptor) => DiscoveryEvent::Described(descriptor),
                    Err(e) => {
                        tracing::warn!(uuid = %device.uuid, error = %e, "Descriptor fetch failed");
                        DiscoveryEvent::DescribeFailed {
                            device,
                            error: e.to_string(),
                        }
                    }
                };
                let _ = events.send(event);
            });
        }
    }
}
