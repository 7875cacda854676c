//! # PipeKV Sync Client
//!
//! Purpose: Provide a synchronous Redis-compatible client that queues
//! commands on a pooled connection and flushes them as a pipeline or a
//! MULTI/EXEC transaction, reading back exactly one reply per command.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Zero-Cost Abstractions**: Executors are generic over their `Mode`, so
//!    hook calls stay monomorphic and inline-friendly.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Usage
//!
//! ```no_run
//! use pipekv_client::KVClient;
//!
//! # fn main() -> pipekv_client::ClientResult<()> {
//! let client = KVClient::connect("127.0.0.1:6379")?;
//! let mut pipe = client.pipeline()?;
//! pipe.enqueue(&[b"SET", b"k", b"v"])?.enqueue(&[b"GET", b"k"])?;
//!
//! let mut replies = pipe.flush()?;
//! replies.pop::<()>()?;
//! let value: Option<String> = replies.pop()?;
//! assert_eq!(value.as_deref(), Some("v"));
//! # Ok(())
//! # }
//! ```

mod client;
mod mode;
mod pool;
mod queued;
mod reply;
mod resp;

pub use client::{ClientConfig, ClientError, ClientResult, KVClient, Pipeline, Transaction};
pub use mode::{drain, Mode, PipelineMode, TransactionMode};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use queued::{Connection, Pool, QueuedExecutor, ReplyBatch};
pub use reply::{parse, to_array, FromReply};
pub use resp::RespValue;
