//! Adapter discovery.
//!
//! - [`ssdp`]: search request encoding and response header parsing.
//! - [`descriptor`]: the HTTP descriptor pipeline (`/` → `URLBase` → `/probe`).
//! - [`engine`]: the periodic search loop emitting [`DiscoveryEvent`]s.

pub mod descriptor;
pub mod engine;
pub mod ssdp;

pub use descriptor::{extract_url_base, DescriptorFetcher, DeviceDescriptor};
pub use engine::{DiscoveryEngine, DiscoveryEvent, DiscoverySettings};
pub use ssdp::{parse_usn, DiscoveredDevice, DiscoveryQuery, SearchResponse};
