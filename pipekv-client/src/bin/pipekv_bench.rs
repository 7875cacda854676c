//! # Pipeline Benchmark Harness
//!
//! Purpose: Measure how much batching saves over one round trip per command
//! against a live Redis-compatible server.
//!
//! ## Usage
//! `pipekv_bench [addr] [ops] [batch]`, or point `PIPEKV_CONFIG` at a JSON
//! `ClientConfig` file. `RUST_LOG=pipekv_client=debug` shows flush sizes.

use std::env;
use std::fs;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipekv_client::{ClientConfig, KVClient};

const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_BATCH_SIZE: usize = 100;

struct BenchConfig {
    client: ClientConfig,
    op_count: usize,
    batch_size: usize,
}

impl BenchConfig {
    fn from_env() -> Result<Self> {
        let mut client = match env::var("PIPEKV_CONFIG") {
            Ok(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                ClientConfig::from_json(&raw).with_context(|| format!("parsing {path}"))?
            }
            Err(_) => ClientConfig::default(),
        };

        let mut args = env::args().skip(1);
        if let Some(addr) = args.next() {
            client.addr = addr;
        }
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT)?;
        let batch_size = parse_usize(args.next(), DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            bail!("batch size must be at least 1");
        }

        Ok(BenchConfig {
            client,
            op_count,
            batch_size,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("expected a positive integer, got {raw:?}")),
        None => Ok(fallback),
    }
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.2} us/op)");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("pipekv_bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_env()?;
    info!(
        addr = %config.client.addr,
        ops = config.op_count,
        batch = config.batch_size,
        "starting benchmark"
    );
    let client = KVClient::with_config(config.client.clone()).context("creating client")?;

    let start = Instant::now();
    for _ in 0..config.op_count {
        client.exec(&[b"INCR", b"bench:single"])?;
    }
    report("single", config.op_count, start.elapsed());

    let start = Instant::now();
    let mut pipe = client.pipeline()?;
    run_batches(config.op_count, config.batch_size, |count| {
        for _ in 0..count {
            pipe.enqueue(&[b"INCR", b"bench:pipeline"])?;
        }
        check_batch(pipe.flush()?, count)
    })?;
    report("pipeline", config.op_count, start.elapsed());

    let start = Instant::now();
    let mut tx = client.transaction(true)?;
    run_batches(config.op_count, config.batch_size, |count| {
        for _ in 0..count {
            tx.enqueue(&[b"INCR", b"bench:transaction"])?;
        }
        check_batch(tx.flush()?, count)
    })?;
    report("transaction", config.op_count, start.elapsed());

    Ok(())
}

fn run_batches(
    op_count: usize,
    batch_size: usize,
    mut batch: impl FnMut(usize) -> Result<()>,
) -> Result<()> {
    let mut remaining = op_count;
    while remaining > 0 {
        let count = remaining.min(batch_size);
        batch(count)?;
        remaining -= count;
    }
    Ok(())
}

fn check_batch(mut replies: pipekv_client::ReplyBatch, expected: usize) -> Result<()> {
    if replies.len() != expected {
        bail!("expected {expected} replies, got {}", replies.len());
    }
    while !replies.is_empty() {
        replies.pop::<i64>()?;
    }
    Ok(())
}
