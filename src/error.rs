//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`, shared by discovery and
//! stream ingestion. Using the `thiserror` crate, it provides one consistent way to
//! report the failures that can occur while locating adapters and reading their
//! SHDR streams.
//!
//! ## Error Taxonomy
//!
//! Every `DaqError` belongs to one [`ErrorKind`]:
//!
//! - **`Argument`**: A caller supplied an incomplete request, such as a descriptor
//!   lookup without a hostname or port. Raised before any network activity.
//! - **`Network`**: Connect, read, write or HTTP transport failures. Wrapped
//!   `std::io::Error` and `reqwest::Error` values land here.
//! - **`Protocol`**: The remote side answered with something we cannot use: a
//!   descriptor without `URLBase`, a search response without `LOCATION`, or an
//!   SHDR line whose framing cannot be split.
//! - **`Timeout`**: A connect attempt or heartbeat deadline expired.
//! - **`Config`**: Unsupported stream URI schemes, invalid configuration values, and
//!   figment extraction failures.
//!
//! Failures are always returned as values; nothing in the library terminates the
//! hosting process.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Coarse classification of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid caller-supplied argument.
    Argument,
    /// Transport-level failure.
    Network,
    /// Malformed or incomplete remote data.
    Protocol,
    /// Deadline expiry.
    Timeout,
    /// Configuration or URI problem.
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Argument => "argument",
            ErrorKind::Network => "network",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Config => "config",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for discovery and stream ingestion.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Rendered verbatim, e.g. `Could not connect to host:7878 timed out after 500ms`.
    #[error("{0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaqError {
    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Argument(_) => ErrorKind::Argument,
            DaqError::Network(_) | DaqError::Io(_) | DaqError::Http(_) => ErrorKind::Network,
            DaqError::Protocol(_) | DaqError::Url(_) | DaqError::Xml(_) | DaqError::Json(_) => {
                ErrorKind::Protocol
            }
            DaqError::Timeout(_) => ErrorKind::Timeout,
            DaqError::Config(_) | DaqError::Figment(_) => ErrorKind::Config,
        }
    }

    /// Whether retrying the same operation later could succeed.
    ///
    /// Network hiccups and timeouts are transient; argument, protocol and
    /// configuration problems need a different request.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Timeout)
    }
}
