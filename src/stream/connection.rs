//! One SHDR stream connection.
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──ok──▶ Connected(AwaitingPong ⇄ Fresh) ──▶ Closed
//!                          └──timeout / error──────────────────────────────▶ Closed
//! ```
//!
//! After connecting, the connection sends `* PING` and a session task owns the
//! socket. Each `* PONG <P>` reply re-arms two timers: the next PING after `P`
//! and a forced close after `2P`. The close deadline tolerates one lost reply.
//!
//! Every other line goes through a [`LineTokenizer`] and is forwarded in arrival
//! order as [`StreamEvent::Data`]. When the session ends for any reason the
//! connection moves to [`ConnectionState::Closed`], drops out of its owning
//! registry and emits [`StreamEvent::Closed`].

use crate::config::StreamConfig;
use crate::error::{AppResult, DaqError};
use crate::stream::endpoint::Endpoint;
use crate::stream::shdr::{DataRecord, LineTokenizer, RecordCategory, ShdrLine};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Liveness probe sent on connect and after every heartbeat period.
pub const PING: &[u8] = b"* PING\n";

/// Line length cap when none is configured.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// How long `shutdown()` waits for the session task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Endpoint → connection map owned by a [`StreamIngestionManager`](super::StreamIngestionManager).
pub(crate) type Registry = Mutex<HashMap<Endpoint, Arc<StreamConnection>>>;

/// Heartbeat freshness while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    /// Last PING answered
    Fresh,
    /// PING sent, no PONG yet
    AwaitingPong,
}

/// Connection lifecycle state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Created, `connect()` not called yet
    Idle,
    /// Socket connect in flight
    Connecting,
    /// Session running
    Connected(Liveness),
    /// Socket released
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected(Liveness::Fresh) => write!(f, "connected"),
            ConnectionState::Connected(Liveness::AwaitingPong) => {
                write!(f, "connected (awaiting pong)")
            }
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot published on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Lifecycle state
    pub state: ConnectionState,
    /// Period from the last PONG
    pub heartbeat: Option<Duration>,
}

impl ConnectionStatus {
    /// Time without a PONG after which the connection is force-closed.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat.map(|period| period * 2)
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            heartbeat: None,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `shutdown()` was called or the connection was dropped
    Shutdown,
    /// Remote closed the socket
    EndOfStream,
    /// No PONG within twice the reported period
    HeartbeatTimeout,
    /// Socket read or write failed
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Event delivered to the subscriber of a stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One tokenized observation
    Data {
        /// Source endpoint
        endpoint: Endpoint,
        /// Device the stream belongs to
        device_id: String,
        /// The record
        record: DataRecord,
    },
    /// `* name: value` line from the adapter
    Command {
        /// Source endpoint
        endpoint: Endpoint,
        /// Device the stream belongs to
        device_id: String,
        /// Command name
        name: String,
        /// Command argument
        value: String,
    },
    /// The connection reached `Closed`
    Closed {
        /// Source endpoint
        endpoint: Endpoint,
        /// Device the stream belonged to
        device_id: String,
        /// Why the session ended
        reason: CloseReason,
    },
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Give up connecting after this long; `None` waits for the OS
    pub connect_timeout: Option<Duration>,
    /// Longest line kept in memory; longer lines are discarded
    pub max_line_bytes: usize,
    /// Category overrides handed to the tokenizer
    pub category_hints: HashMap<String, RecordCategory>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            category_hints: HashMap::new(),
        }
    }
}

impl ConnectionSettings {
    /// Settings from the `[stream]` section.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            max_line_bytes: config.max_line_bytes,
            category_hints: config
                .category_hints
                .iter()
                .map(|(key, category)| (key.clone(), *category))
                .collect(),
        }
    }
}

/// Heartbeat timers.
///
/// Both timers are unset until the first PONG. A PONG reporting period `P`
/// at `now` schedules the next PING at `now + P` and the close deadline at
/// `now + 2P`, replacing whatever was scheduled before.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    period: Option<Duration>,
    next_ping: Option<Instant>,
    deadline: Option<Instant>,
}

impl Heartbeat {
    /// Re-arm both timers from a PONG.
    pub fn on_pong(&mut self, now: Instant, period: Duration) {
        self.period = Some(period);
        self.next_ping = Some(now + period);
        self.deadline = Some(now + period * 2);
    }

    /// Clear the PING timer once the probe has gone out. The deadline stays.
    pub fn on_ping_sent(&mut self) {
        self.next_ping = None;
    }

    /// Period reported by the last PONG.
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// When the next PING is due.
    pub fn next_ping(&self) -> Option<Instant> {
        self.next_ping
    }

    /// When the connection is declared unresponsive.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// A single SHDR stream connection.
pub struct StreamConnection {
    id: u64,
    endpoint: Endpoint,
    device_id: String,
    settings: ConnectionSettings,
    status: Arc<watch::Sender<ConnectionStatus>>,
    shutdown: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
    events: mpsc::Sender<StreamEvent>,
    registry: Option<Weak<Registry>>,
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamConnection {
    /// Create an idle connection not owned by any registry.
    pub fn new(
        endpoint: Endpoint,
        device_id: impl Into<String>,
        settings: ConnectionSettings,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self::registered(0, endpoint, device_id, settings, events, None)
    }

    pub(crate) fn registered(
        id: u64,
        endpoint: Endpoint,
        device_id: impl Into<String>,
        settings: ConnectionSettings,
        events: mpsc::Sender<StreamEvent>,
        registry: Option<Weak<Registry>>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            endpoint,
            device_id: device_id.into(),
            settings,
            status: Arc::new(status),
            shutdown,
            task: StdMutex::new(None),
            events,
            registry,
        }
    }

    /// Registry-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Device id attached to records from this stream.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Open the socket, send the first PING and start the session.
    ///
    /// Only valid from `Idle`. On a connect timeout the connection moves to
    /// `Closed` and the error reads
    /// `Could not connect to <host>:<port> timed out after <T>ms`.
    pub async fn connect(&self) -> AppResult<()> {
        let state = self.state();
        if state != ConnectionState::Idle {
            return Err(DaqError::Config(format!(
                "Connection to {} is already {}",
                self.endpoint, state
            )));
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            self.set_state(ConnectionState::Closed);
            return Err(self.shut_down_error());
        }
        self.set_state(ConnectionState::Connecting);
        tracing::debug!(endpoint = %self.endpoint, device_id = %self.device_id, "Connecting");

        let opened = tokio::select! {
            opened = open(&self.endpoint, self.settings.connect_timeout) => opened,
            _ = shutdown_rx.changed() => Err(self.shut_down_error()),
        };

        let (reader, mut writer) = match opened {
            Ok(stream) => stream.into_split(),
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Connect failed");
                return Err(e);
            }
        };

        if let Err(e) = writer.write_all(PING).await {
            self.set_state(ConnectionState::Closed);
            return Err(DaqError::Network(format!(
                "Could not send PING to {}: {}",
                self.endpoint, e
            )));
        }

        if *self.shutdown.borrow() {
            self.set_state(ConnectionState::Closed);
            return Err(self.shut_down_error());
        }
        self.set_state(ConnectionState::Connected(Liveness::AwaitingPong));
        tracing::info!(endpoint = %self.endpoint, device_id = %self.device_id, "Stream connected");

        let session = Session {
            id: self.id,
            endpoint: self.endpoint.clone(),
            device_id: self.device_id.clone(),
            tokenizer: LineTokenizer::new(self.device_id.clone())
                .with_hints(self.settings.category_hints.clone()),
            status: self.status.clone(),
            events: self.events.clone(),
            registry: self.registry.clone(),
        };
        let lines = LineReader::new(reader, self.settings.max_line_bytes);
        let handle = tokio::spawn(session.run(lines, writer, shutdown_rx));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Close the socket and stop all timers.
    ///
    /// Safe from any state and idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!(endpoint = %self.endpoint, "Session did not stop in time, aborting");
                task.abort();
                unregister(self.registry.as_ref(), &self.endpoint, self.id).await;
            }
        }

        self.set_state(ConnectionState::Closed);
    }

    fn set_state(&self, state: ConnectionState) {
        set_state(&self.status, state);
    }

    fn shut_down_error(&self) -> DaqError {
        DaqError::Network(format!("Connection to {} was shut down", self.endpoint))
    }
}

fn set_state(status: &watch::Sender<ConnectionStatus>, state: ConnectionState) {
    status.send_modify(|s| {
        // Closed is terminal.
        if s.state != ConnectionState::Closed {
            s.state = state;
        }
    });
}

async fn open(endpoint: &Endpoint, limit: Option<Duration>) -> AppResult<TcpStream> {
    let attempt = TcpStream::connect((endpoint.address(), endpoint.port()));
    let stream = match limit {
        Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
            DaqError::Timeout(format!(
                "Could not connect to {}:{} timed out after {}ms",
                endpoint.address(),
                endpoint.port(),
                limit.as_millis()
            ))
        })?,
        None => attempt.await,
    }
    .map_err(|e| DaqError::Network(format!("Could not connect to {}: {}", endpoint, e)))?;

    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Remove `endpoint` from the registry if it still maps to connection `id`.
pub(crate) async fn unregister(registry: Option<&Weak<Registry>>, endpoint: &Endpoint, id: u64) {
    let Some(registry) = registry.and_then(Weak::upgrade) else {
        return;
    };
    let mut map = registry.lock().await;
    if map.get(endpoint).is_some_and(|c| c.id == id) {
        map.remove(endpoint);
    }
}

/// Pends forever when `at` is `None`.
async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// One line read off the socket.
#[derive(Debug, PartialEq, Eq)]
enum RawLine {
    /// Line without its terminator, invalid UTF-8 replaced
    Text(String),
    /// Line longer than the cap; its bytes were dropped
    Overlong,
}

/// Newline-delimited reader over raw bytes.
///
/// Lines are decoded lossily so a stray Latin-1 byte costs one character, not
/// the session. At most `max_len` bytes of a line are buffered. Partial lines
/// survive a cancelled `next_line()`, so it can sit in a `select!` loop.
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
    overflowed: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_len: max_len.max(1),
            overflowed: false,
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<RawLine>> {
        loop {
            let limit = (self.max_len + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if self.buf.last() == Some(&b'\n') {
                return Ok(Some(self.take_line()));
            }
            if self.buf.len() > self.max_len {
                self.overflowed = true;
                self.buf.clear();
                continue;
            }
            if read == 0 {
                if self.buf.is_empty() && !self.overflowed {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> RawLine {
        if std::mem::take(&mut self.overflowed) {
            self.buf.clear();
            return RawLine::Overlong;
        }
        let line = match String::from_utf8_lossy(&self.buf) {
            std::borrow::Cow::Borrowed(text) => text.to_string(),
            std::borrow::Cow::Owned(text) => {
                tracing::debug!(line = %text, "Replaced invalid UTF-8 in line");
                text
            }
        };
        self.buf.clear();
        RawLine::Text(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// State owned by the spawned session task.
struct Session {
    id: u64,
    endpoint: Endpoint,
    device_id: String,
    tokenizer: LineTokenizer,
    status: Arc<watch::Sender<ConnectionStatus>>,
    events: mpsc::Sender<StreamEvent>,
    registry: Option<Weak<Registry>>,
}

impl Session {
    async fn run(
        mut self,
        mut lines: LineReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = Heartbeat::default();

        let reason = loop {
            tokio::select! {
                _ = shutdown.changed() => break CloseReason::Shutdown,
                _ = sleep_until(heartbeat.deadline()) => {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        timeout_ms = ?heartbeat.period().map(|p| (p * 2).as_millis()),
                        "Adapter unresponsive, closing"
                    );
                    break CloseReason::HeartbeatTimeout;
                }
                _ = sleep_until(heartbeat.next_ping()) => {
                    heartbeat.on_ping_sent();
                    if let Err(e) = writer.write_all(PING).await {
                        break CloseReason::Error(e.to_string());
                    }
                    set_state(&self.status, ConnectionState::Connected(Liveness::AwaitingPong));
                    tracing::trace!(endpoint = %self.endpoint, "PING");
                }
                line = lines.next_line() => match line {
                    Ok(Some(RawLine::Text(line))) => self.handle_line(&line, &mut heartbeat).await,
                    Ok(Some(RawLine::Overlong)) => {
                        tracing::warn!(
                            endpoint = %self.endpoint,
                            max_bytes = lines.max_len as u64,
                            "Skipping overlong line"
                        );
                    }
                    Ok(None) => break CloseReason::EndOfStream,
                    Err(e) => break CloseReason::Error(e.to_string()),
                },
            }
        };

        let _ = writer.shutdown().await;
        self.finish(reason).await;
    }

    async fn handle_line(&mut self, line: &str, heartbeat: &mut Heartbeat) {
        match self.tokenizer.feed(line) {
            Ok(ShdrLine::Pong(period)) => {
                if period.is_zero() {
                    tracing::warn!(endpoint = %self.endpoint, "Ignoring PONG with zero period");
                    return;
                }
                heartbeat.on_pong(Instant::now(), period);
                self.status.send_modify(|s| {
                    if s.state != ConnectionState::Closed {
                        s.state = ConnectionState::Connected(Liveness::Fresh);
                        s.heartbeat = Some(period);
                    }
                });
                tracing::trace!(endpoint = %self.endpoint, period_ms = period.as_millis() as u64, "PONG");
            }
            Ok(ShdrLine::Records(records)) => {
                for record in records {
                    self.emit(StreamEvent::Data {
                        endpoint: self.endpoint.clone(),
                        device_id: self.device_id.clone(),
                        record,
                    })
                    .await;
                }
            }
            Ok(ShdrLine::Command { name, value }) => {
                tracing::debug!(endpoint = %self.endpoint, command = %name, value = %value, "Adapter command");
                self.emit(StreamEvent::Command {
                    endpoint: self.endpoint.clone(),
                    device_id: self.device_id.clone(),
                    name,
                    value,
                })
                .await;
            }
            Ok(ShdrLine::Pending) | Ok(ShdrLine::Empty) => {}
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, line, error = %e, "Skipping malformed line");
            }
        }
    }

    async fn emit(&self, event: StreamEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!(endpoint = %self.endpoint, "No stream subscriber");
        }
    }

    async fn finish(self, reason: CloseReason) {
        set_state(&self.status, ConnectionState::Closed);
        unregister(self.registry.as_ref(), &self.endpoint, self.id).await;

        tracing::info!(endpoint = %self.endpoint, device_id = %self.device_id, reason = %reason, "Stream closed");
        self.emit(StreamEvent::Closed {
            endpoint: self.endpoint.clone(),
            device_id: self.device_id.clone(),
            reason,
        })
        .await;
    }
}
