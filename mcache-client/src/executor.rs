//! # Request Executor
//!
//! Purpose: Issue protocol operations over the per-server connections of one
//! client, under the configured delivery mode, and turn every server status
//! into the error taxonomy.
//!
//! ## Design Principles
//! 1. **Single Translator**: `translate` is the only place a status line
//!    becomes an `Error`; operations only check the success shape.
//! 2. **Explicit Delivery Modes**: `Sync` waits for every reply, `Buffered`
//!    queues writes until a flush boundary, `NoBlock` fires unconditional
//!    writes with `noreply` but still awaits conditional stores.
//! 3. **Stream Hygiene**: Any reply that leaves the stream position in doubt
//!    resets the connection.
//!
//! ## Flush Boundaries (buffered mode)
//! Queued commands are written and their replies drained before any command
//! that reads from the same server, when the queue passes the flush
//! threshold, on `flush()`, and on drop. The first failure found while
//! draining a server is kept until `flush()` reports it; later ones are
//! counted and logged.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::{trace, warn};

use crate::codec::Payload;
use crate::connection::{Connection, ConnectionOptions, PendingReply};
use crate::error::{ClientResult, Error, Operation};
use crate::protocol::{
    encode_arith, encode_delete, encode_get, encode_stats, encode_storage, Reply, StorageVerb,
    ValueBlock,
};
use crate::server::ServerPool;

/// How a client delivers requests and observes replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMode {
    /// Every call blocks for its reply and raises on failure.
    #[default]
    Sync,
    /// Writes are queued client-side and flushed in batches.
    Buffered,
    /// Unconditional writes are fire-and-forget.
    ///
    /// Key validation still applies: an invalid key is a `Client` error here too.
    NoBlock,
}

impl FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "sync" => Ok(DeliveryMode::Sync),
            "buffered" => Ok(DeliveryMode::Buffered),
            "no_block" | "noblock" => Ok(DeliveryMode::NoBlock),
            other => Err(Error::Configuration(format!("unknown delivery mode {other:?}"))),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Sync => f.write_str("sync"),
            DeliveryMode::Buffered => f.write_str("buffered"),
            DeliveryMode::NoBlock => f.write_str("no_block"),
        }
    }
}

/// Maps a server reply to the error taxonomy.
///
/// Success replies pass through untouched; every failure status becomes
/// exactly one `Error` variant.
pub(crate) fn translate(op: Operation, key: &str, reply: Reply) -> ClientResult<Reply> {
    match reply {
        Reply::NotStored | Reply::Exists => Err(Error::NotStored {
            op,
            key: key.to_owned(),
        }),
        Reply::NotFound => Err(Error::NotFound {
            op,
            key: key.to_owned(),
        }),
        Reply::Error => Err(Error::Protocol {
            op,
            key: key.to_owned(),
            message: "server rejected the command".to_string(),
        }),
        Reply::ClientError(message) => Err(Error::Protocol {
            op,
            key: key.to_owned(),
            message,
        }),
        Reply::ServerError(message) => Err(Error::Server {
            op,
            key: key.to_owned(),
            message,
        }),
        other => Ok(other),
    }
}

fn unexpected(op: Operation, key: &str, reply: &Reply) -> Error {
    Error::Protocol {
        op,
        key: key.to_owned(),
        message: format!("unexpected reply {reply:?}"),
    }
}

/// Per-client set of server connections plus the delivery policy.
pub(crate) struct RequestExecutor {
    connections: Vec<Connection>,
    options: ConnectionOptions,
    mode: DeliveryMode,
    flush_threshold: usize,
    scratch: Vec<u8>,
}

impl RequestExecutor {
    /// Creates unconnected sessions, one per server in pool order.
    pub(crate) fn new(
        pool: &ServerPool,
        options: ConnectionOptions,
        mode: DeliveryMode,
        flush_threshold: usize,
    ) -> Self {
        RequestExecutor {
            connections: pool.iter().cloned().map(Connection::new).collect(),
            options,
            mode,
            flush_threshold: flush_threshold.max(1),
            scratch: Vec::with_capacity(256),
        }
    }

    pub(crate) fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Number of servers with an open socket.
    pub(crate) fn connected(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    /// Runs a storage command (set/add/replace/append/prepend).
    pub(crate) fn store(
        &mut self,
        server: usize,
        op: Operation,
        verb: StorageVerb,
        key: &str,
        payload: Payload<'_>,
        ttl: u32,
    ) -> ClientResult<()> {
        trace!(server = %self.connections[server].addr(), %op, key, bytes = payload.data.len(), "store");
        match self.mode {
            DeliveryMode::Buffered => {
                let conn = &mut self.connections[server];
                encode_storage(verb, key, payload.flags, ttl, payload.data, false, &mut conn.queued);
                self.enqueue(server, op, key);
                Ok(())
            }
            DeliveryMode::NoBlock if verb == StorageVerb::Set => {
                self.scratch.clear();
                encode_storage(verb, key, payload.flags, ttl, payload.data, true, &mut self.scratch);
                self.fire(server, op, key)
            }
            _ => {
                self.scratch.clear();
                encode_storage(verb, key, payload.flags, ttl, payload.data, false, &mut self.scratch);
                match self.exchange(server, op, key)? {
                    Reply::Stored => Ok(()),
                    other => Err(self.desync(server, op, key, &other)),
                }
            }
        }
    }

    /// Fetches one value; a miss is `NotFound`.
    pub(crate) fn get(&mut self, server: usize, key: &str) -> ClientResult<ValueBlock> {
        let op = Operation::Get;
        self.scratch.clear();
        encode_get(&[key], &mut self.scratch);
        match self.exchange(server, op, key)? {
            Reply::Value(block) => {
                trace!(key, flags = block.flags, bytes = block.data.len(), "hit");
                let conn = &mut self.connections[server];
                let end = conn.read(op, key)?;
                match translate(op, key, end)? {
                    Reply::End => Ok(block),
                    other => Err(self.desync(server, op, key, &other)),
                }
            }
            Reply::End => Err(Error::NotFound {
                op,
                key: key.to_owned(),
            }),
            other => Err(self.desync(server, op, key, &other)),
        }
    }

    /// Fetches keys grouped by server; returns the blocks that were found.
    ///
    /// Every request is written before any reply is read, so servers answer
    /// in parallel.
    pub(crate) fn get_multi(
        &mut self,
        batches: &[(usize, Vec<String>)],
    ) -> ClientResult<HashMap<String, ValueBlock>> {
        let op = Operation::GetMulti;
        let mut first_err: Option<Error> = None;
        let mut sent = Vec::with_capacity(batches.len());

        for (server, keys) in batches {
            let Some(lead) = keys.first() else { continue };
            self.settle(*server);
            self.scratch.clear();
            encode_get(keys, &mut self.scratch);
            trace!(server = %self.connections[*server].addr(), keys = keys.len(), "get_multi");
            match self.connections[*server].write(&self.options, op, lead, &self.scratch) {
                Ok(()) => sent.push((*server, lead.as_str())),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }

        let mut found = HashMap::new();
        for (server, lead) in sent {
            loop {
                let reply = self.connections[server]
                    .read(op, lead)
                    .and_then(|reply| translate(op, lead, reply));
                match reply {
                    Ok(Reply::Value(block)) => {
                        found.insert(block.key.clone(), block);
                    }
                    Ok(Reply::End) => break,
                    Ok(other) => {
                        let err = self.desync(server, op, lead, &other);
                        first_err.get_or_insert(err);
                        break;
                    }
                    Err(err) => {
                        if matches!(err, Error::Protocol { .. }) {
                            self.connections[server].reset();
                        }
                        first_err.get_or_insert(err);
                        break;
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(found),
        }
    }

    /// Deletes a key; a missing key is `NotFound` unless suppressed by mode.
    pub(crate) fn delete(&mut self, server: usize, key: &str) -> ClientResult<()> {
        let op = Operation::Delete;
        trace!(server = %self.connections[server].addr(), key, "delete");
        match self.mode {
            DeliveryMode::Buffered => {
                encode_delete(key, false, &mut self.connections[server].queued);
                self.enqueue(server, op, key);
                Ok(())
            }
            DeliveryMode::NoBlock => {
                self.scratch.clear();
                encode_delete(key, true, &mut self.scratch);
                self.fire(server, op, key)
            }
            DeliveryMode::Sync => {
                self.scratch.clear();
                encode_delete(key, false, &mut self.scratch);
                match self.exchange(server, op, key)? {
                    Reply::Deleted => Ok(()),
                    other => Err(self.desync(server, op, key, &other)),
                }
            }
        }
    }

    /// Runs `incr`/`decr` and returns the new value.
    pub(crate) fn arith(&mut self, server: usize, op: Operation, key: &str, delta: u64) -> ClientResult<u64> {
        self.scratch.clear();
        encode_arith(op == Operation::Increment, key, delta, &mut self.scratch);
        match self.exchange(server, op, key)? {
            Reply::Number(value) => Ok(value),
            other => Err(self.desync(server, op, key, &other)),
        }
    }

    /// Collects `(name, value)` stat pairs from every server, in pool order.
    pub(crate) fn stats(&mut self) -> ClientResult<Vec<Vec<(String, String)>>> {
        let op = Operation::Stats;
        let mut per_server = Vec::with_capacity(self.connections.len());
        for server in 0..self.connections.len() {
            self.scratch.clear();
            encode_stats(&mut self.scratch);
            let mut stats = Vec::new();
            let mut reply = self.exchange(server, op, "")?;
            loop {
                match reply {
                    Reply::Stat { name, value } => stats.push((name, value)),
                    Reply::End => break,
                    other => return Err(self.desync(server, op, "", &other)),
                }
                let next = self.connections[server].read(op, "")?;
                reply = translate(op, "", next)?;
            }
            per_server.push(stats);
        }
        Ok(per_server)
    }

    /// Writes every queued command, drains owed replies, and reports the
    /// first deferred failure.
    pub(crate) fn flush(&mut self) -> ClientResult<()> {
        for server in 0..self.connections.len() {
            self.settle(server);
        }
        let mut first = None;
        for conn in &mut self.connections {
            let Some(err) = conn.take_deferred() else { continue };
            if first.is_none() {
                first = Some(err);
            } else {
                warn!(server = %conn.addr(), error = %err, "additional deferred failure");
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn enqueue(&mut self, server: usize, op: Operation, key: &str) {
        let conn = &mut self.connections[server];
        conn.pending.push_back(PendingReply {
            op,
            key: key.to_owned(),
        });
        if conn.queued.len() >= self.flush_threshold {
            self.settle(server);
        }
    }

    fn fire(&mut self, server: usize, op: Operation, key: &str) -> ClientResult<()> {
        self.settle(server);
        self.connections[server].write(&self.options, op, key, &self.scratch)
    }

    /// Writes `scratch` after settling the server, then reads and translates
    /// the first reply item.
    fn exchange(&mut self, server: usize, op: Operation, key: &str) -> ClientResult<Reply> {
        self.settle(server);
        let conn = &mut self.connections[server];
        conn.write(&self.options, op, key, &self.scratch)?;
        let reply = conn.read(op, key)?;
        translate(op, key, reply).map_err(|err| {
            // An ERROR line may mean the server parsed our data as a command.
            if matches!(err, Error::Protocol { .. }) {
                self.connections[server].reset();
            }
            err
        })
    }

    fn desync(&mut self, server: usize, op: Operation, key: &str, reply: &Reply) -> Error {
        self.connections[server].reset();
        unexpected(op, key, reply)
    }

    /// Flush boundary for one server: write the queue, drain owed replies.
    fn settle(&mut self, server: usize) {
        let conn = &mut self.connections[server];
        if !conn.queued.is_empty() {
            let mut queued = std::mem::take(&mut conn.queued);
            if let Err(err) = conn.write(&self.options, Operation::Flush, "", &queued) {
                warn!(server = %conn.addr(), error = %err, "buffered write failed");
                conn.reset();
                conn.defer(err);
                return;
            }
            queued.clear();
            conn.queued = queued;
        }

        while let Some(owed) = conn.pending.pop_front() {
            let reply = match conn.read(owed.op, &owed.key) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(server = %conn.addr(), error = %err, "draining buffered replies failed");
                    conn.defer(err);
                    break;
                }
            };
            match translate(owed.op, &owed.key, reply) {
                Ok(Reply::Stored | Reply::Deleted) => {}
                Ok(other) => {
                    let err = unexpected(owed.op, &owed.key, &other);
                    conn.reset();
                    conn.defer(err);
                    break;
                }
                Err(err) => {
                    warn!(server = %conn.addr(), error = %err, "deferred failure");
                    let desynced = matches!(err, Error::Protocol { .. });
                    conn.defer(err);
                    if desynced {
                        conn.reset();
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        if self.mode != DeliveryMode::Buffered {
            return;
        }
        if let Err(err) = self.flush() {
            warn!(error = %err, "buffered writes failed at shutdown");
        }
    }
}
