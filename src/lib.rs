//! # SHDR DAQ Library
//!
//! Locates industrial device adapters on the local network and ingests their
//! SHDR data streams. The CLI in `main.rs` is a thin shell over this library,
//! so the same discovery and ingestion logic can be embedded in other
//! applications.
//!
//! ## Crate Structure
//!
//! - **`discovery`**: Multicast search for adapters (`DiscoveryEngine`) and the
//!   HTTP descriptor pipeline (`DescriptorFetcher`).
//! - **`stream`**: SHDR line tokenization, the per-stream connection state machine
//!   with PING/PONG liveness, and the `StreamIngestionManager` registry.
//! - **`collab`**: Collaborator traits the application supplies: device lookup by
//!   uuid and record decoding.
//! - **`config`**: Figment-based configuration (`DaqConfig`).
//! - **`error`**: The crate-wide `DaqError` taxonomy.
//! - **`logging`**: `tracing-subscriber` initialisation.
//!
//! ## Data Flow
//!
//! ```text
//! DiscoveryEngine ──DeviceFound{hostname, port, uuid}──▶ application
//!                                                          │ DeviceDirectory::lookup(uuid)
//!                                                          ▼
//! StreamIngestionManager::connect_to(uri, device_id) ──▶ StreamConnection
//!                                                          │ StreamEvent::Data{device_id, record}
//!                                                          ▼
//!                                                    RecordDecoder
//! ```

pub mod collab;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod stream;

pub use error::{AppResult, DaqError, ErrorKind};
