//! # Execution Modes
//!
//! Purpose: Hold the protocol policy that distinguishes a plain pipeline from
//! a MULTI/EXEC transaction, so `QueuedExecutor` only has to count commands.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: The executor is generic over `Mode`; each hook has
//!    a pipeline-shaped default and transactions override what they frame.
//! 2. **Zero-Cost Dispatch**: Modes are plain structs resolved at compile time.
//! 3. **Stay In Sync**: Every reply a mode causes is either consumed by the
//!    mode itself or handed back to the executor, never left on the wire.
//!
//! ## Transaction Wire Sequence
//!
//! ```text
//! piped:     MULTI  cmd1  cmd2  EXEC  |  +OK  +QUEUED  +QUEUED  *2 r1 r2
//! unpiped:   MULTI +OK  cmd1 +QUEUED  cmd2 +QUEUED  EXEC  |  *2 r1 r2
//! ```

use std::collections::VecDeque;

use tracing::debug;

use crate::client::{ClientError, ClientResult};
use crate::queued::{Connection, Pool};
use crate::resp::RespValue;

/// Protocol hooks invoked by `QueuedExecutor`.
pub trait Mode {
    /// Runs once per connection before the first command is queued on it.
    fn begin<C: Connection>(&mut self, _conn: &mut C) -> ClientResult<()> {
        Ok(())
    }

    /// Sends one queued command.
    fn enqueue<C: Connection>(&mut self, conn: &mut C, args: &[&[u8]]) -> ClientResult<()> {
        conn.send(args)
    }

    /// Runs before replies are drained; `count` commands are outstanding.
    fn flush<C: Connection>(&mut self, _conn: &mut C, _count: usize) -> ClientResult<()> {
        Ok(())
    }

    /// Collects the `count` replies belonging to the flushed commands.
    fn receive<C: Connection>(
        &mut self,
        conn: &mut C,
        count: usize,
    ) -> ClientResult<VecDeque<RespValue>> {
        drain(conn, count)
    }

    /// Restores pool-visible state after queued work is abandoned.
    ///
    /// `slot` holds the executor's connection, if it still has one. A mode
    /// that cannot hand the connection back clean releases it through `pool`
    /// and leaves the slot empty.
    fn abort<P: Pool>(
        &mut self,
        _pool: &P,
        _slot: &mut Option<P::Connection>,
    ) -> ClientResult<()> {
        Ok(())
    }
}

/// Receives exactly `count` replies, stopping at the first failure.
pub fn drain<C: Connection>(conn: &mut C, count: usize) -> ClientResult<VecDeque<RespValue>> {
    let mut replies = VecDeque::with_capacity(count);
    for _ in 0..count {
        replies.push_back(conn.recv()?);
    }
    Ok(replies)
}

/// Commands are written back to back; replies are read in order on flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMode;

impl Mode for PipelineMode {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    /// No MULTI outstanding on the connection.
    Idle,
    /// MULTI sent, commands may be queued.
    Open,
    /// EXEC sent, replies not yet drained.
    Committing,
}

/// MULTI/EXEC framing around the queued commands.
#[derive(Debug, Clone)]
pub struct TransactionMode {
    piped: bool,
    state: TxState,
}

impl TransactionMode {
    /// Creates a transaction mode.
    ///
    /// `piped` defers reading the MULTI and QUEUED acknowledgements until
    /// flush; otherwise each one is checked as soon as its command is sent.
    pub fn new(piped: bool) -> Self {
        TransactionMode {
            piped,
            state: TxState::Idle,
        }
    }

    /// Returns true when acknowledgements are read at flush time.
    pub fn is_piped(&self) -> bool {
        self.piped
    }

    /// Returns true while a MULTI is outstanding on the connection.
    pub fn is_open(&self) -> bool {
        self.state != TxState::Idle
    }

    /// Reads the acknowledgements a piped transaction left on the wire.
    ///
    /// Returns the first queue-time rejection, if any. All `count` acks are
    /// consumed either way so the EXEC reply lines up.
    fn drain_acks<C: Connection>(conn: &mut C, count: usize) -> ClientResult<Option<Vec<u8>>> {
        match conn.recv()? {
            reply if reply.is_status(b"OK") => {}
            RespValue::Error(message) => {
                conn.mark_broken();
                return Err(ClientError::Server { message });
            }
            _ => {
                conn.mark_broken();
                return Err(ClientError::Protocol);
            }
        }

        let mut rejected = None;
        for _ in 0..count {
            match conn.recv()? {
                reply if reply.is_status(b"QUEUED") => {}
                RespValue::Error(message) => {
                    rejected.get_or_insert(message);
                }
                _ => {
                    conn.mark_broken();
                    return Err(ClientError::Protocol);
                }
            }
        }
        Ok(rejected)
    }
}

impl Default for TransactionMode {
    fn default() -> Self {
        TransactionMode::new(false)
    }
}

impl Mode for TransactionMode {
    fn begin<C: Connection>(&mut self, conn: &mut C) -> ClientResult<()> {
        conn.send(&[b"MULTI"])?;
        if !self.piped {
            // A refused MULTI leaves the connection outside any transaction,
            // so the state stays Idle and the next enqueue retries it.
            match conn.recv()? {
                reply if reply.is_status(b"OK") => {}
                RespValue::Error(message) => return Err(ClientError::Server { message }),
                _ => {
                    conn.mark_broken();
                    return Err(ClientError::Protocol);
                }
            }
        }
        self.state = TxState::Open;
        Ok(())
    }

    fn enqueue<C: Connection>(&mut self, conn: &mut C, args: &[&[u8]]) -> ClientResult<()> {
        if self.state == TxState::Idle {
            self.begin(conn)?;
        }
        conn.send(args)?;
        if self.piped {
            return Ok(());
        }

        match conn.recv()? {
            reply if reply.is_status(b"QUEUED") => Ok(()),
            // The server flags the transaction; EXEC will report EXECABORT.
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => {
                conn.mark_broken();
                Err(ClientError::Protocol)
            }
        }
    }

    fn flush<C: Connection>(&mut self, conn: &mut C, _count: usize) -> ClientResult<()> {
        if self.state != TxState::Open {
            return Ok(());
        }
        self.state = TxState::Committing;
        conn.send(&[b"EXEC"])
    }

    fn receive<C: Connection>(
        &mut self,
        conn: &mut C,
        count: usize,
    ) -> ClientResult<VecDeque<RespValue>> {
        if self.state != TxState::Committing {
            return drain(conn, count);
        }
        self.state = TxState::Idle;

        let rejected = if self.piped {
            Self::drain_acks(conn, count)?
        } else {
            None
        };

        match conn.recv()? {
            RespValue::Array(items) => match rejected {
                Some(message) => Err(ClientError::Server { message }),
                None => Ok(items.into()),
            },
            RespValue::Error(message) => Err(ClientError::Server {
                message: rejected.unwrap_or(message),
            }),
            RespValue::Nil => Err(ClientError::TransactionAborted),
            _ => {
                conn.mark_broken();
                Err(ClientError::Protocol)
            }
        }
    }

    fn abort<P: Pool>(&mut self, pool: &P, slot: &mut Option<P::Connection>) -> ClientResult<()> {
        if self.state == TxState::Idle {
            return Ok(());
        }
        self.state = TxState::Idle;

        // The server still holds the open MULTI; the pool must not hand this
        // connection out again.
        match slot.take() {
            Some(mut conn) => {
                conn.mark_broken();
                debug!(piped = self.piped, "discarding connection with an open transaction");
                pool.release(conn)
            }
            None => Ok(()),
        }
    }
}
