//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking entry point that hands out queued
//! executors (pipelines and transactions) bound to a shared connection pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Performance First**: Batch commands so one round trip serves many.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mode::{PipelineMode, TransactionMode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::queued::{Connection, Pool, QueuedExecutor};
use crate::resp::RespValue;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(std::io::Error),
    /// Socket read or write timed out.
    #[error("timed out waiting on the connection")]
    Timeout,
    /// The connection already failed and must not carry more commands.
    #[error("connection is broken")]
    ConnectionBroken,
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Reply shape did not match the requested type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    /// EXEC returned a null reply; none of the queued commands ran.
    #[error("transaction aborted by the server")]
    TransactionAborted,
    /// `pop` was called on a batch with no replies left.
    #[error("reply batch is empty")]
    EmptyBatch,
    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Address could not be parsed into a socket address.
    #[error("invalid address")]
    InvalidAddress,
    /// Client configuration could not be parsed.
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

impl ClientError {
    /// True for transport-level failures after which the connection is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionBroken
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ClientError::Timeout,
            _ => ClientError::Io(err),
        }
    }
}

/// Configuration for the synchronous client and its pool.
///
/// Timeouts serialize as whole milliseconds (`read_timeout_ms`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    #[serde(with = "duration_ms", rename = "read_timeout_ms")]
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    #[serde(with = "duration_ms", rename = "write_timeout_ms")]
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Option<Duration>,
    /// How long `fetch` waits for a free connection; `None` fails fast.
    #[serde(with = "duration_ms", rename = "acquire_timeout_ms")]
    pub acquire_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            acquire_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json(raw: &str) -> ClientResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_some(&(duration.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Pipeline executor over the TCP pool.
pub type Pipeline = QueuedExecutor<ConnectionPool, PipelineMode>;

/// Transaction executor over the TCP pool.
pub type Transaction = QueuedExecutor<ConnectionPool, TransactionMode>;

/// Synchronous client with connection pooling.
///
/// Each executor handed out borrows one pooled connection for its lifetime
/// and returns it when dropped.
pub struct KVClient {
    pool: ConnectionPool,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let pool = ConnectionPool::new(PoolConfig {
            addr: config.addr,
            max_idle: config.max_idle,
            max_total: config.max_total,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            connect_timeout: config.connect_timeout,
            acquire_timeout: config.acquire_timeout,
        })?;
        Ok(KVClient { pool })
    }

    /// Starts a pipeline: commands are sent back to back, replies read on flush.
    pub fn pipeline(&self) -> ClientResult<Pipeline> {
        QueuedExecutor::new(self.pool.clone(), PipelineMode)
    }

    /// Starts a MULTI/EXEC transaction.
    ///
    /// With `piped` set, queue acknowledgements are left on the wire until
    /// flush instead of being checked after every command.
    pub fn transaction(&self, piped: bool) -> ClientResult<Transaction> {
        QueuedExecutor::new(self.pool.clone(), TransactionMode::new(piped))
    }

    /// Sends one command and waits for its reply.
    pub fn exec(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let mut conn = self.pool.fetch()?;
        let result = conn.send(args).and_then(|()| conn.recv());
        self.pool.release(conn)?;
        result
    }

    /// Returns the underlying pool handle.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
