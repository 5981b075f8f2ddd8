//! SHDR stream ingestion.
//!
//! - [`endpoint`]: stream URIs and the `(address, port)` registry key.
//! - [`shdr`]: line tokenization and record categories.
//! - [`connection`]: the per-stream state machine with PING/PONG liveness.
//! - [`manager`]: the endpoint registry handing out connections.

pub mod connection;
pub mod endpoint;
pub mod manager;
pub mod shdr;

pub use connection::{
    CloseReason, ConnectionSettings, ConnectionState, ConnectionStatus, Heartbeat, Liveness,
    StreamConnection, StreamEvent,
};
pub use endpoint::{parse_stream_uri, Endpoint};
pub use manager::{ManagerSettings, StreamIngestionManager};
pub use shdr::{DataRecord, LineTokenizer, RecordCategory, ShdrLine};
