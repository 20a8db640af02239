//! # Client Benchmark Harness
//!
//! Purpose: Drive a repeatable set/get workload against live memcached
//! servers so client throughput can be compared across delivery modes and
//! pool sizes.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use fixed PRNG seeds for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **One Client per Thread**: Each worker runs on its own `clone()`.
//!
//! Usage: `mcache-bench <host:port[,host:port..]> [threads] [ops] [value_size] [mode]`

use std::env;
use std::hint::black_box;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcache_client::{ClientConfig, DeliveryMode, MemcachedClient};

const DEFAULT_THREADS: usize = 4;
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const KEYS_PER_THREAD: usize = 1 << 10;

struct BenchConfig {
    servers: Vec<String>,
    threads: usize,
    op_count: usize,
    value_size: usize,
    mode: DeliveryMode,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut args = env::args().skip(1);
        let Some(servers) = args.next() else {
            bail!("usage: mcache-bench <host:port[,host:port..]> [threads] [ops] [value_size] [mode]");
        };
        let servers = servers.split(',').map(str::to_owned).collect();
        let threads = parse_usize(args.next(), DEFAULT_THREADS).max(1);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);
        let mode = match args.next() {
            Some(raw) => raw.parse().context("parsing delivery mode")?,
            None => DeliveryMode::Sync,
        };

        Ok(BenchConfig {
            servers,
            threads,
            op_count,
            value_size,
            mode,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG; XorShift keeps the workload reproducible.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn build_value(size: usize, seed: u64) -> Vec<u8> {
    let mut value = vec![0u8; size];
    let bytes = seed.to_le_bytes();
    let copy_len = value.len().min(bytes.len());
    value[..copy_len].copy_from_slice(&bytes[..copy_len]);
    value
}

#[derive(Default)]
struct WorkerTally {
    sets: Duration,
    gets: Duration,
    failures: usize,
}

fn run_worker(mut client: MemcachedClient, worker: usize, config: &BenchConfig) -> WorkerTally {
    let keys: Vec<String> = (0..KEYS_PER_THREAD)
        .map(|i| format!("bench:{worker}:{i}"))
        .collect();
    let value = build_value(config.value_size, 0x5A5A_5A5A_5A5A_5A5A ^ worker as u64);
    let mask = KEYS_PER_THREAD - 1;
    let mut tally = WorkerTally::default();

    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321 ^ worker as u64);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let key = &keys[rng.next_index(mask)];
        if client.set_raw(key, &value, 0).is_err() {
            tally.failures += 1;
        }
    }
    if let Err(err) = client.flush() {
        warn!(worker, error = %err, "flush reported a failed write");
        tally.failures += 1;
    }
    tally.sets = start.elapsed();

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0 ^ worker as u64);
    let start = Instant::now();
    for _ in 0..config.op_count {
        let key = &keys[rng.next_index(mask)];
        match client.get_raw(key) {
            Ok(value) => {
                black_box(value);
            }
            Err(err) if err.is_not_found() => {}
            Err(_) => tally.failures += 1,
        }
    }
    tally.gets = start.elapsed();
    tally
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops.max(1) as f64);
    info!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)"
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BenchConfig::from_args()?;
    let client_config = ClientConfig {
        namespace: Some("mcache-bench:".into()),
        delivery_mode: config.mode,
        ..ClientConfig::default()
    };
    let client = MemcachedClient::new(&config.servers, client_config)
        .with_context(|| format!("connecting to {:?}", config.servers))?;

    info!(
        servers = ?config.servers,
        threads = config.threads,
        ops = config.op_count,
        value_size = config.value_size,
        mode = %config.mode,
        "starting benchmark"
    );

    let tallies = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|worker| {
                let client = client.clone();
                let config = &config;
                scope.spawn(move || run_worker(client, worker, config))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Result<Vec<_>, _>>()
    })
    .map_err(|_| anyhow::anyhow!("benchmark worker panicked"))?;

    let total_ops = config.op_count * config.threads;
    // Workers run concurrently; the slowest one bounds wall-clock time.
    let sets = tallies.iter().map(|t| t.sets).max().unwrap_or_default();
    let gets = tallies.iter().map(|t| t.gets).max().unwrap_or_default();
    let failures: usize = tallies.iter().map(|t| t.failures).sum();

    report("SET", total_ops, sets);
    report("GET", total_ops, gets);
    if failures > 0 {
        warn!(failures, "operations failed during the run");
    }

    Ok(())
}
