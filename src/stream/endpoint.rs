//! Stream endpoints and URI parsing.

use crate::error::{AppResult, DaqError};
use serde::Serialize;
use std::fmt;
use url::Url;

/// URI schemes accepted for SHDR streams.
pub const SUPPORTED_SCHEMES: &[&str] = &["shdr", "tcp"];

/// `(address, port)` pair identifying one stream target.
///
/// This is the registry key: at most one live connection exists per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    address: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint. Host names compare case-insensitively.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Host name or IP literal.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Parse a stream URI such as `shdr://10.0.0.12:7878` into an endpoint.
///
/// `default_port` fills in a missing port. Unsupported schemes and URIs
/// without a host are configuration errors.
pub fn parse_stream_uri(uri: &str, default_port: u16) -> AppResult<Endpoint> {
    let url = Url::parse(uri)
        .map_err(|e| DaqError::Config(format!("Invalid stream URI '{}': {}", uri, e)))?;

    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(DaqError::Config(format!(
            "Unsupported stream scheme '{}' in '{}'; expected one of: {}",
            url.scheme(),
            uri,
            SUPPORTED_SCHEMES.join(", ")
        )));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DaqError::Config(format!("Stream URI has no host: '{}'", uri)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    Ok(Endpoint::new(host, url.port().unwrap_or(default_port)))
}
