//! Device descriptor retrieval over HTTP.
//!
//! The descriptor pipeline is three requests deep:
//! 1. `GET http://<hostname>:<port>/` returns a small XML document.
//! 2. Its `URLBase` element names the agent's base URL.
//! 3. `GET <URLBase>/probe` returns the full descriptor, passed through verbatim.
//!
//! There is no retry here; callers decide whether a failed fetch is worth
//! repeating.

use crate::discovery::ssdp::DiscoveredDevice;
use crate::error::{AppResult, DaqError};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use std::time::Duration;

/// Name of the element carrying the agent base URL.
const URL_BASE_TAG: &[u8] = b"URLBase";

/// Descriptor of one discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    /// Host the root document was fetched from
    pub hostname: String,
    /// Port the root document was fetched from
    pub port: u16,
    /// Device uuid from the search response
    pub uuid: String,
    /// Base URL advertised by the root document
    pub url_base: String,
    /// Raw `/probe` body
    pub body: String,
}

/// HTTP client for the descriptor pipeline.
#[derive(Debug, Clone)]
pub struct DescriptorFetcher {
    client: reqwest::Client,
}

impl DescriptorFetcher {
    /// Create a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch the root document at `http://hostname:port/`.
    ///
    /// Fails with an argument error, before touching the network, when either
    /// part of the address is absent.
    pub async fn fetch_root(&self, hostname: Option<&str>, port: Option<u16>) -> AppResult<String> {
        let hostname = hostname
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| DaqError::Argument("hostname is required".into()))?;
        let port = port
            .filter(|p| *p != 0)
            .ok_or_else(|| DaqError::Argument("port is required".into()))?;

        self.get(&format!("http://{}:{}/", hostname, port)).await
    }

    /// Fetch the full descriptor at `<url_base>/probe`.
    pub async fn fetch_descriptor(&self, url_base: &str) -> AppResult<String> {
        self.get(&probe_url(url_base)).await
    }

    /// Run the whole pipeline for a discovered device.
    pub async fn describe(&self, device: &DiscoveredDevice) -> AppResult<DeviceDescriptor> {
        let root = self
            .fetch_root(Some(&device.hostname), Some(device.port))
            .await?;
        let url_base = extract_url_base(&root)?;
        let body = self.fetch_descriptor(&url_base).await?;

        tracing::debug!(
            uuid = %device.uuid,
            url_base = %url_base,
            bytes = body.len(),
            "Fetched device descriptor"
        );

        Ok(DeviceDescriptor {
            hostname: device.hostname.clone(),
            port: device.port,
            uuid: device.uuid.clone(),
            url_base,
            body,
        })
    }

    async fn get(&self, url: &str) -> AppResult<String> {
        tracing::trace!(url, "GET");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DaqError::Network(format!("GET {} returned {}", url, status)));
        }
        Ok(response.text().await?)
    }
}

/// Join `url_base` and `/probe` without doubling the separator.
fn probe_url(url_base: &str) -> String {
    format!("{}/probe", url_base.trim_end_matches('/'))
}

/// Locate the `URLBase` element of a root document and return its text.
pub fn extract_url_base(xml: &str) -> AppResult<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut inside = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == URL_BASE_TAG => inside = true,
            Event::End(e) if e.local_name().as_ref() == URL_BASE_TAG => inside = false,
            Event::Text(t) if inside => {
                let text = t.unescape()?;
                let text = text.trim();
                if !text.is_empty() {
                    return Ok(text.to_string());
                }
            }
            Event::CData(c) if inside => {
                let text = String::from_utf8_lossy(&c).trim().to_string();
                if !text.is_empty() {
                    return Ok(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Err(DaqError::Protocol("Cannot find URLBase".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const ROOT: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <URLBase>http://10.0.0.12:5000</URLBase>
  <device><friendlyName>Mill</friendlyName></device>
</root>"#;

    #[test]
    fn extracts_url_base() {
        assert_eq!(extract_url_base(ROOT).unwrap(), "http://10.0.0.12:5000");
    }

    #[test]
    fn extracts_prefixed_url_base() {
        let xml = "<u:root xmlns:u=\"urn:x\"><u:URLBase> http://h:1/agent </u:URLBase></u:root>";
        assert_eq!(extract_url_base(xml).unwrap(), "http://h:1/agent");
    }

    #[test]
    fn missing_url_base_is_protocol_error() {
        let err = extract_url_base("<root><device/></root>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(matches!(err, DaqError::Protocol(ref m) if m == "Cannot find URLBase"));
    }

    #[test]
    fn empty_url_base_is_protocol_error() {
        let err = extract_url_base("<root><URLBase></URLBase></root>").unwrap_err();
        assert!(matches!(err, DaqError::Protocol(ref m) if m == "Cannot find URLBase"));
    }

    #[test]
    fn probe_url_joins_cleanly() {
        assert_eq!(probe_url("http://h:5000"), "http://h:5000/probe");
        assert_eq!(probe_url("http://h:5000/"), "http://h:5000/probe");
    }

    #[tokio::test]
    async fn missing_address_parts_fail_before_network() {
        let fetcher = DescriptorFetcher::new(Duration::from_millis(50)).unwrap();

        let err = fetcher.fetch_root(None, Some(8080)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);

        let err = fetcher.fetch_root(Some("127.0.0.1"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);

        let err = fetcher.fetch_root(Some(""), Some(8080)).await.unwrap_err();
        assert!(matches!(err, DaqError::Argument(_)));
    }
}
