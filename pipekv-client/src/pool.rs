//! # Connection Pool
//!
//! Purpose: Lend TCP connections to queued executors and take them back,
//! discarding any connection that can no longer be trusted to be in sync.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Bounded Waiting**: Exhaustion fails fast unless an acquire timeout is
//!    configured, in which case callers wait for a release.
//! 4. **Write Coalescing**: Queued commands accumulate in a per-connection
//!    buffer and reach the socket in as few writes as possible.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::debug;

use crate::client::{ClientError, ClientResult};
use crate::queued::{Connection, Pool};
use crate::resp::{encode_command, read_response, RespValue};

/// Buffered command bytes are written out once they reach this size.
const WRITE_HIGH_WATER: usize = 16 * 1024;

/// Pool configuration for the sync client.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// How long `acquire` waits on an exhausted pool; `None` fails fast.
    pub acquire_timeout: Option<Duration>,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections parked and ready to lend.
    pub idle: usize,
    /// Connections counted against `max_total` (idle + in-use).
    pub total: usize,
}

struct PoolState {
    idle: VecDeque<RawConnection>,
    total: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn return_connection(&self, conn: RawConnection) {
        let mut state = self.lock();
        if state.idle.len() < self.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
        drop(state);
        self.available.notify_one();
    }
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool with the provided configuration.
    pub fn new(config: PoolConfig) -> ClientResult<Self> {
        config
            .addr
            .parse::<SocketAddr>()
            .map_err(|_| ClientError::InvalidAddress)?;
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }

    /// Acquires a connection, reusing an idle one when possible.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        if let Some(conn) = self.reserve()? {
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }

        match RawConnection::connect(&self.inner.config) {
            Ok(conn) => {
                debug!(addr = %self.inner.config.addr, "opened connection");
                Ok(PooledConnection::new(self.inner.clone(), conn))
            }
            Err(err) => {
                self.inner.release_slot();
                Err(err)
            }
        }
    }

    /// Returns current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            idle: state.idle.len(),
            total: state.total,
        }
    }

    /// Pops an idle connection, or reserves a slot for a new one (`None`).
    fn reserve(&self) -> ClientResult<Option<RawConnection>> {
        let deadline = self
            .inner
            .config
            .acquire_timeout
            .map(|timeout| Instant::now() + timeout);
        let mut state = self.inner.lock();
        loop {
            if let Some(conn) = state.idle.pop_front() {
                return Ok(Some(conn));
            }
            if state.total < self.inner.config.max_total {
                state.total += 1;
                return Ok(None);
            }

            let remaining = deadline
                .and_then(|deadline| deadline.checked_duration_since(Instant::now()))
                .filter(|remaining| !remaining.is_zero())
                .ok_or(ClientError::PoolExhausted)?;
            state = self
                .inner
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Pool for ConnectionPool {
    type Connection = PooledConnection;

    fn fetch(&self) -> ClientResult<PooledConnection> {
        self.acquire()
    }

    fn release(&self, conn: PooledConnection) -> ClientResult<()> {
        drop(conn);
        Ok(())
    }
}

/// RAII wrapper returning a connection to the pool on drop.
///
/// Connections flagged broken, or holding unsent or unread bytes, are closed
/// instead of returned.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<RawConnection>,
    broken: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: RawConnection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    fn live(&mut self) -> ClientResult<&mut RawConnection> {
        match self.conn.as_mut() {
            Some(conn) if !self.broken => Ok(conn),
            _ => Err(ClientError::ConnectionBroken),
        }
    }
}

impl Connection for PooledConnection {
    fn is_broken(&self) -> bool {
        self.broken || self.conn.is_none()
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn send(&mut self, args: &[&[u8]]) -> ClientResult<()> {
        let result = self.live()?.send(args);
        if result.is_err() {
            // A partial write leaves the stream unusable.
            self.broken = true;
        }
        result
    }

    fn recv(&mut self) -> ClientResult<RespValue> {
        let result = self.live()?.recv();
        if result.is_err() {
            self.broken = true;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if !self.broken && conn.is_idle() {
            self.pool.return_connection(conn);
        } else {
            debug!(broken = self.broken, "discarding connection");
            self.pool.release_slot();
        }
    }
}

/// Single TCP connection with reusable buffers.
///
/// The buffers are stored on the connection to avoid per-call allocations.
struct RawConnection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
}

impl RawConnection {
    fn connect(config: &PoolConfig) -> ClientResult<Self> {
        let stream = connect_stream(config)?;
        if let Some(timeout) = config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle so a flushed batch goes out immediately.
        stream.set_nodelay(true)?;

        Ok(RawConnection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(4096),
        })
    }

    fn send(&mut self, args: &[&[u8]]) -> ClientResult<()> {
        encode_command(args, &mut self.write_buf);
        if self.write_buf.len() >= WRITE_HIGH_WATER {
            self.flush_writes()?;
        }
        Ok(())
    }

    fn recv(&mut self) -> ClientResult<RespValue> {
        self.flush_writes()?;
        read_response(&mut self.reader, &mut self.line_buf)
    }

    fn flush_writes(&mut self) -> ClientResult<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        self.write_buf.clear();
        Ok(())
    }

    /// No commands waiting to be written and no reply bytes read ahead.
    fn is_idle(&self) -> bool {
        self.write_buf.is_empty() && self.reader.buffer().is_empty()
    }
}

fn connect_stream(config: &PoolConfig) -> ClientResult<TcpStream> {
    let addr: SocketAddr = config.addr.parse().map_err(|_| ClientError::InvalidAddress)?;
    let stream = match config.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    Ok(stream)
}
