//! SSDP search encoding and response parsing.
//!
//! A search is an `M-SEARCH * HTTP/1.1` datagram carrying the service-type
//! query in its `ST` header. Adapters answer with an HTTP-style header block;
//! only `LOCATION` (descriptor URL) and `USN` (device identifier) are required.

use crate::error::{AppResult, DaqError};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use url::Url;

/// Well-known SSDP multicast group and port.
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// Service-type filter and repeat interval for one discovery run.
///
/// Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryQuery {
    search: String,
    frequency_ms: u64,
}

impl DiscoveryQuery {
    /// Create a query for `search` repeated every `frequency_ms` milliseconds.
    pub fn new(search: impl Into<String>, frequency_ms: u64) -> Self {
        Self {
            search: search.into(),
            frequency_ms,
        }
    }

    /// Service-type filter.
    pub fn search(&self) -> &str {
        &self.search
    }

    /// Repeat interval in milliseconds.
    pub fn frequency_ms(&self) -> u64 {
        self.frequency_ms
    }
}

/// Build the `M-SEARCH` datagram for `query`.
pub fn search_request(query: &str, host: SocketAddr, mx_secs: u32) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {host}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx_secs}\r\n\
         ST: {query}\r\n\
         \r\n"
    )
}

/// Header block of one search response, keyed by upper-cased header name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResponse {
    headers: HashMap<String, String>,
}

impl SearchResponse {
    /// Parse a raw datagram.
    ///
    /// The first line (status line) is skipped; every following `Name: value`
    /// line becomes a header. Lines without a colon are ignored.
    pub fn parse(datagram: &str) -> AppResult<Self> {
        let mut lines = datagram.lines();
        let status = lines.next().unwrap_or_default();
        if !status.starts_with("HTTP/") && !status.starts_with("NOTIFY") {
            return Err(DaqError::Protocol(format!(
                "Unexpected search response status line: '{}'",
                status.trim()
            )));
        }

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_uppercase(), value.trim().to_string()))
            .collect();

        Ok(Self { headers })
    }

    /// Build a response from already-split headers.
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_uppercase(), v.into()))
                .collect(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
    }
}

/// A device announced by a search response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DiscoveredDevice {
    /// Host taken from the `LOCATION` URL
    pub hostname: String,
    /// Port taken from the `LOCATION` URL (scheme default when omitted)
    pub port: u16,
    /// Identifier parsed from `USN`
    pub uuid: String,
    /// The full `LOCATION` value
    pub location: String,
}

impl DiscoveredDevice {
    /// Extract the device from a response's `LOCATION` and `USN` headers.
    pub fn from_response(response: &SearchResponse) -> AppResult<Self> {
        let location = response
            .header("LOCATION")
            .ok_or_else(|| DaqError::Protocol("Search response has no LOCATION header".into()))?;
        let usn = response
            .header("USN")
            .ok_or_else(|| DaqError::Protocol("Search response has no USN header".into()))?;

        let url = Url::parse(location)?;
        let hostname = url
            .host_str()
            .ok_or_else(|| DaqError::Protocol(format!("LOCATION has no host: '{}'", location)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| DaqError::Protocol(format!("LOCATION has no port: '{}'", location)))?;

        Ok(Self {
            hostname,
            port,
            uuid: parse_usn(usn),
            location: location.to_string(),
        })
    }
}

/// Extract the device uuid from a `USN` value.
///
/// `uuid:<X>:...` yields `X`; anything else yields the first colon-delimited
/// segment.
pub fn parse_usn(usn: &str) -> String {
    let mut segments = usn.split(':');
    let first = segments.next().unwrap_or_default();
    if first == "uuid" {
        segments.next().unwrap_or_default().to_string()
    } else {
        first.to_string()
    }
}
