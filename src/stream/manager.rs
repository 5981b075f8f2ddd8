//! Stream Ingestion Manager
//!
//! Owns the endpoint registry and hands out [`StreamConnection`]s. There is at
//! most one registered connection per [`Endpoint`]: a second `connect_to` for
//! the same host and port returns the connection already registered, even while
//! it is still connecting.
//!
//! All connections publish into one `mpsc` channel whose receiver is returned
//! from [`StreamIngestionManager::new`].
//!
//! ## Registry discipline
//!
//! The registry lock is held only around lookups, inserts and removals, never
//! across a socket operation. Connections remove themselves when their session
//! ends, matching on their id so a stale session never evicts a newer entry.

use crate::config::StreamConfig;
use crate::error::AppResult;
use crate::stream::connection::{unregister, ConnectionSettings, Registry, StreamConnection};
use crate::stream::endpoint::{parse_stream_uri, Endpoint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

pub use crate::stream::connection::{CloseReason, StreamEvent};

/// Manager-level settings.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Settings applied to every new connection
    pub connection: ConnectionSettings,
    /// Port used when a stream URI omits one
    pub default_port: u16,
    /// Capacity of the shared event channel
    pub event_capacity: usize,
}

impl ManagerSettings {
    /// Settings from the `[stream]` section.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            connection: ConnectionSettings::from_config(config),
            default_port: config.default_port,
            event_capacity: config.event_capacity,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

/// Registry of live SHDR stream connections.
pub struct StreamIngestionManager {
    settings: ManagerSettings,
    registry: Arc<Registry>,
    events: mpsc::Sender<StreamEvent>,
    next_id: AtomicU64,
}

impl StreamIngestionManager {
    /// Create a manager and the receiver for all of its stream events.
    pub fn new(settings: ManagerSettings) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (events, rx) = mpsc::channel(settings.event_capacity.max(1));
        let manager = Self {
            settings,
            registry: Arc::new(Mutex::new(HashMap::new())),
            events,
            next_id: AtomicU64::new(1),
        };
        (manager, rx)
    }

    /// Create a manager from the `[stream]` section.
    pub fn from_config(config: &StreamConfig) -> (Self, mpsc::Receiver<StreamEvent>) {
        Self::new(ManagerSettings::from_config(config))
    }

    /// Connect to `uri` for `device_id`, reusing a registered connection.
    ///
    /// Unsupported schemes fail with a configuration error before anything is
    /// registered. When a fresh connection fails to connect, the error is
    /// returned and the endpoint is left unregistered.
    pub async fn connect_to(&self, uri: &str, device_id: &str) -> AppResult<Arc<StreamConnection>> {
        let endpoint = parse_stream_uri(uri, self.settings.default_port)?;

        let connection = {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry.get(&endpoint) {
                if existing.device_id() != device_id {
                    tracing::warn!(
                        endpoint = %endpoint,
                        registered = existing.device_id(),
                        requested = device_id,
                        "Endpoint already streaming for another device"
                    );
                } else {
                    tracing::debug!(endpoint = %endpoint, "Reusing registered connection");
                }
                return Ok(existing.clone());
            }

            let connection = Arc::new(StreamConnection::registered(
                self.next_id.fetch_add(1, Ordering::SeqCst),
                endpoint.clone(),
                device_id,
                self.settings.connection.clone(),
                self.events.clone(),
                Some(Arc::downgrade(&self.registry)),
            ));
            registry.insert(endpoint.clone(), connection.clone());
            connection
        };

        if let Err(e) = connection.connect().await {
            unregister(Some(&Arc::downgrade(&self.registry)), &endpoint, connection.id()).await;
            return Err(e);
        }

        Ok(connection)
    }

    /// Shut down the connection registered for `endpoint`, if any.
    pub async fn disconnect(&self, endpoint: &Endpoint) -> bool {
        let connection = self.registry.lock().await.remove(endpoint);
        match connection {
            Some(connection) => {
                connection.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shut down every registered connection and clear the registry.
    ///
    /// Connections that already closed are shut down again harmlessly.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<StreamConnection>> = {
            let mut registry = self.registry.lock().await;
            registry.drain().map(|(_, connection)| connection).collect()
        };
        if drained.is_empty() {
            return;
        }

        tracing::info!(connections = drained.len(), "Shutting down stream connections");
        let mut pending = JoinSet::new();
        for connection in drained {
            pending.spawn(async move { connection.shutdown().await });
        }
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Connection shutdown task failed");
            }
        }
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Whether no connection is registered.
    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.is_empty()
    }

    /// Registered endpoints, sorted.
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.registry.lock().await.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// The connection registered for `endpoint`.
    pub async fn connection(&self, endpoint: &Endpoint) -> Option<Arc<StreamConnection>> {
        self.registry.lock().await.get(endpoint).cloned()
    }

    /// Settings used for new connections.
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }
}
