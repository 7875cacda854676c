//! # Queued Command Execution
//!
//! Purpose: Queue commands on one borrowed connection without waiting for
//! replies, then drain exactly as many replies as were queued in a single
//! flush.
//!
//! ## Design Principles
//! 1. **Count Is The Contract**: `pending` always equals the number of
//!    replies still owed by the server for the current batch.
//! 2. **Read-Then-Clear**: `flush` and `abort` take the count before doing
//!    any I/O, so a failure can never drain the same batch twice.
//! 3. **RAII Teardown**: Dropping an executor aborts and releases; errors on
//!    that path are logged and swallowed, explicit calls propagate them.
//! 4. **Strategy Pattern**: Protocol framing lives in `Mode`, transport in
//!    `Connection`, lending in `Pool`.
//!
//! ## State Machine
//!
//! ```text
//!            enqueue              flush / abort
//!   Idle ─────────────▶ Queued(k) ─────────────▶ Idle
//!    ▲  (connection broken: enqueue rejected, state kept)
//! ```

use std::collections::VecDeque;
use std::mem;

use tracing::{debug, trace, warn};

use crate::client::{ClientError, ClientResult};
use crate::mode::Mode;
use crate::reply::{self, FromReply};
use crate::resp::RespValue;

/// Transport seen by the executor: one command out, one reply in.
pub trait Connection {
    /// True once the connection must not carry more commands.
    fn is_broken(&self) -> bool;

    /// Flags the connection so the pool discards it on release.
    fn mark_broken(&mut self);

    /// Hands one encoded command to the transport.
    fn send(&mut self, args: &[&[u8]]) -> ClientResult<()>;

    /// Blocks until one full reply has been read.
    fn recv(&mut self) -> ClientResult<RespValue>;
}

/// Lends connections to executors and takes them back.
pub trait Pool {
    type Connection: Connection;

    /// Borrows a connection.
    fn fetch(&self) -> ClientResult<Self::Connection>;

    /// Returns a connection; broken connections are discarded.
    fn release(&self, conn: Self::Connection) -> ClientResult<()>;
}

/// Queues commands on a pooled connection and flushes them as one batch.
///
/// The executor owns its connection exclusively until it is dropped. After an
/// abort that had to retire the connection, a fresh one is fetched on the
/// next `enqueue`.
pub struct QueuedExecutor<P: Pool, M: Mode> {
    pool: P,
    conn: Option<P::Connection>,
    mode: M,
    pending: usize,
}

impl<P: Pool, M: Mode> QueuedExecutor<P, M> {
    /// Borrows a connection from `pool` and runs the mode's begin hook on it.
    pub fn new(pool: P, mut mode: M) -> ClientResult<Self> {
        let conn = open(&pool, &mut mode)?;
        Ok(QueuedExecutor {
            pool,
            conn: Some(conn),
            mode,
            pending: 0,
        })
    }

    /// Sends one command without waiting for its reply.
    pub fn enqueue(&mut self, args: &[&[u8]]) -> ClientResult<&mut Self> {
        let conn = checkout(&self.pool, &mut self.conn, &mut self.mode)?;
        if conn.is_broken() {
            return Err(ClientError::ConnectionBroken);
        }

        self.mode.enqueue(conn, args)?;
        self.pending += 1;
        trace!(pending = self.pending, "command queued");
        Ok(self)
    }

    /// Sends the batch and collects one reply per queued command.
    ///
    /// Either every reply arrives and the batch is returned, or the first
    /// failure is returned and the connection must be treated as unusable.
    pub fn flush(&mut self) -> ClientResult<ReplyBatch> {
        let count = mem::take(&mut self.pending);
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Ok(ReplyBatch::default()),
        };

        self.mode.flush(conn, count)?;
        let replies = self.mode.receive(conn, count)?;
        if replies.len() != count {
            conn.mark_broken();
            warn!(expected = count, received = replies.len(), "reply count mismatch");
            return Err(ClientError::Protocol);
        }

        debug!(count, "batch flushed");
        Ok(ReplyBatch::new(replies))
    }

    /// Drops every queued command and restores a clean connection state.
    ///
    /// Queued replies are never read; a connection still owing them is
    /// released as broken so the pool cannot lend it out again.
    pub fn abort(&mut self) -> ClientResult<()> {
        let pending = mem::take(&mut self.pending);
        let retired = match self.conn.take() {
            Some(mut conn) if pending > 0 => {
                conn.mark_broken();
                debug!(pending, "retiring connection with unread replies");
                self.pool.release(conn)
            }
            conn => {
                self.conn = conn;
                Ok(())
            }
        };
        let aborted = self.mode.abort(&self.pool, &mut self.conn);
        retired.and(aborted)
    }

    /// Aborts outstanding work and returns the connection, reporting errors
    /// the implicit teardown would swallow.
    pub fn close(mut self) -> ClientResult<()> {
        let aborted = self.abort();
        let released = match self.conn.take() {
            Some(conn) => self.pool.release(conn),
            None => Ok(()),
        };
        aborted.and(released)
    }

    /// Number of commands queued since the last flush or abort.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// True when the held connection can no longer carry commands.
    pub fn is_broken(&self) -> bool {
        self.conn.as_ref().map_or(false, |conn| conn.is_broken())
    }

    /// Returns the execution mode.
    pub fn mode(&self) -> &M {
        &self.mode
    }
}

impl<P: Pool, M: Mode> Drop for QueuedExecutor<P, M> {
    fn drop(&mut self) {
        if let Err(err) = self.abort() {
            warn!(error = %err, "abort failed during teardown");
        }
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.pool.release(conn) {
                warn!(error = %err, "release failed during teardown");
            }
        }
    }
}

/// Fetches a connection and runs the begin hook, discarding it on failure.
fn open<P: Pool, M: Mode>(pool: &P, mode: &mut M) -> ClientResult<P::Connection> {
    let mut conn = pool.fetch()?;
    if let Err(err) = mode.begin(&mut conn) {
        conn.mark_broken();
        if let Err(release_err) = pool.release(conn) {
            warn!(error = %release_err, "release failed after begin error");
        }
        return Err(err);
    }
    Ok(conn)
}

fn checkout<'a, P: Pool, M: Mode>(
    pool: &P,
    slot: &'a mut Option<P::Connection>,
    mode: &mut M,
) -> ClientResult<&'a mut P::Connection> {
    let conn = match slot.take() {
        Some(conn) => conn,
        None => open(pool, mode)?,
    };
    Ok(slot.insert(conn))
}

/// Replies from one flush, consumed front to back.
#[derive(Debug, Default)]
pub struct ReplyBatch {
    replies: VecDeque<RespValue>,
}

impl ReplyBatch {
    pub(crate) fn new(replies: VecDeque<RespValue>) -> Self {
        ReplyBatch { replies }
    }

    /// Removes the front reply and decodes it as `T`.
    pub fn pop<T: FromReply>(&mut self) -> ClientResult<T> {
        let front = self.replies.pop_front().ok_or(ClientError::EmptyBatch)?;
        reply::parse(front)
    }

    /// Removes the front reply and appends its array elements to `out`.
    pub fn pop_into<T, E>(&mut self, out: &mut E) -> ClientResult<()>
    where
        T: FromReply,
        E: Extend<T>,
    {
        let front = self.replies.pop_front().ok_or(ClientError::EmptyBatch)?;
        reply::to_array(front, out)
    }

    /// Replies not yet popped.
    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

/// In-memory pool and connection doubles that answer like a tiny server.
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::{Connection, Pool};
    use crate::client::{ClientError, ClientResult};
    use crate::resp::RespValue;

    #[derive(Default)]
    struct MockState {
        sent: Vec<String>,
        opened: usize,
        released: usize,
        discarded: usize,
        dirty_returns: usize,
        idle: Vec<MockConnection>,
        fail_fetch: bool,
        fail_release: bool,
        severed: bool,
        recv_budget: Option<usize>,
        refuse_multi: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MockStats {
        pub opened: usize,
        pub released: usize,
        pub discarded: usize,
        pub dirty_returns: usize,
        pub idle: usize,
    }

    #[derive(Clone, Default)]
    pub struct MockPool {
        state: Rc<RefCell<MockState>>,
    }

    impl MockPool {
        pub fn new() -> Self {
            MockPool::default()
        }

        /// Every command sent so far, arguments joined by spaces.
        pub fn sent(&self) -> Vec<String> {
            self.state.borrow().sent.clone()
        }

        pub fn stats(&self) -> MockStats {
            let state = self.state.borrow();
            MockStats {
                opened: state.opened,
                released: state.released,
                discarded: state.discarded,
                dirty_returns: state.dirty_returns,
                idle: state.idle.len(),
            }
        }

        pub fn fail_fetch(&self, fail: bool) {
            self.state.borrow_mut().fail_fetch = fail;
        }

        pub fn fail_release(&self, fail: bool) {
            self.state.borrow_mut().fail_release = fail;
        }

        /// Makes every connection report broken, as after a dropped socket.
        pub fn sever(&self) {
            self.state.borrow_mut().severed = true;
        }

        /// Allows `budget` more successful receives across all connections.
        pub fn recv_budget(&self, budget: Option<usize>) {
            self.state.borrow_mut().recv_budget = budget;
        }

        /// Makes the server answer MULTI with an error, as while loading.
        pub fn refuse_multi(&self, refuse: bool) {
            self.state.borrow_mut().refuse_multi = refuse;
        }
    }

    impl Pool for MockPool {
        type Connection = MockConnection;

        fn fetch(&self) -> ClientResult<MockConnection> {
            let mut state = self.state.borrow_mut();
            if state.fail_fetch {
                return Err(ClientError::PoolExhausted);
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(conn);
            }
            state.opened += 1;
            Ok(MockConnection::new(self.state.clone()))
        }

        fn release(&self, conn: MockConnection) -> ClientResult<()> {
            let mut state = self.state.borrow_mut();
            if state.fail_release {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "release failed",
                )));
            }
            if conn.broken {
                state.discarded += 1;
                return Ok(());
            }
            if !conn.inbox.is_empty() || conn.in_multi {
                state.dirty_returns += 1;
            }
            state.released += 1;
            state.idle.push(conn);
            Ok(())
        }
    }

    pub struct MockConnection {
        state: Rc<RefCell<MockState>>,
        inbox: VecDeque<RespValue>,
        queued: Vec<RespValue>,
        in_multi: bool,
        dirty: bool,
        watched: bool,
        broken: bool,
    }

    impl MockConnection {
        fn new(state: Rc<RefCell<MockState>>) -> Self {
            MockConnection {
                state,
                inbox: VecDeque::new(),
                queued: Vec::new(),
                in_multi: false,
                dirty: false,
                watched: false,
                broken: false,
            }
        }

        /// Replies produced but not yet received.
        pub fn unread(&self) -> usize {
            self.inbox.len()
        }

        fn evaluate(args: &[&[u8]]) -> RespValue {
            match args {
                [b"ECHO", value] => RespValue::Bulk(Some(value.to_vec())),
                [b"NUM", value] => String::from_utf8_lossy(value)
                    .parse()
                    .map(RespValue::Integer)
                    .unwrap_or_else(|_| RespValue::Error(b"ERR not a number".to_vec())),
                [b"BAD", ..] => RespValue::Error(b"ERR bad command".to_vec()),
                [b"LIST", items @ ..] => RespValue::Array(
                    items.iter().map(|item| Self::evaluate(&[&b"NUM"[..], *item])).collect(),
                ),
                _ => RespValue::Simple(b"OK".to_vec()),
            }
        }

        fn respond(&mut self, args: &[&[u8]]) -> RespValue {
            match args.first().copied() {
                Some(b"MULTI") if self.in_multi => {
                    RespValue::Error(b"ERR MULTI calls can not be nested".to_vec())
                }
                Some(b"MULTI") if self.state.borrow().refuse_multi => {
                    RespValue::Error(b"LOADING busy".to_vec())
                }
                Some(b"MULTI") => {
                    self.in_multi = true;
                    self.dirty = false;
                    self.watched = false;
                    RespValue::Simple(b"OK".to_vec())
                }
                Some(b"EXEC") if !self.in_multi => {
                    RespValue::Error(b"ERR EXEC without MULTI".to_vec())
                }
                Some(b"EXEC") => {
                    self.in_multi = false;
                    let queued = std::mem::take(&mut self.queued);
                    if self.dirty {
                        RespValue::Error(
                            b"EXECABORT Transaction discarded because of previous errors."
                                .to_vec(),
                        )
                    } else if self.watched {
                        RespValue::Nil
                    } else {
                        RespValue::Array(queued)
                    }
                }
                _ if self.in_multi => {
                    let reply = Self::evaluate(args);
                    if let RespValue::Error(_) = reply {
                        self.dirty = true;
                        return reply;
                    }
                    if args.first().copied() == Some(&b"WATCHED"[..]) {
                        self.watched = true;
                    }
                    self.queued.push(reply);
                    RespValue::Simple(b"QUEUED".to_vec())
                }
                _ => Self::evaluate(args),
            }
        }
    }

    impl Connection for MockConnection {
        fn is_broken(&self) -> bool {
            self.broken || self.state.borrow().severed
        }

        fn mark_broken(&mut self) {
            self.broken = true;
        }

        fn send(&mut self, args: &[&[u8]]) -> ClientResult<()> {
            if self.is_broken() {
                return Err(ClientError::ConnectionBroken);
            }
            let line = args
                .iter()
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            self.state.borrow_mut().sent.push(line);
            let reply = self.respond(args);
            self.inbox.push_back(reply);
            Ok(())
        }

        fn recv(&mut self) -> ClientResult<RespValue> {
            if self.is_broken() {
                return Err(ClientError::ConnectionBroken);
            }
            let exhausted = {
                let mut state = self.state.borrow_mut();
                match state.recv_budget {
                    Some(0) => true,
                    Some(left) => {
                        state.recv_budget = Some(left - 1);
                        false
                    }
                    None => false,
                }
            };
            if exhausted {
                self.broken = true;
                return Err(ClientError::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )));
            }
            match self.inbox.pop_front() {
                Some(reply) => Ok(reply),
                None => {
                    self.broken = true;
                    Err(ClientError::Timeout)
                }
            }
        }
    }
}
