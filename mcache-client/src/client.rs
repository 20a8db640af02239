//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API over a pool of memcached servers,
//! hiding key namespacing, distribution, delivery modes and serialization.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `MemcachedClient` routes every keyed call through
//!    `KeyCodec` -> `Distributor` -> `RequestExecutor` -> `Codec`.
//! 2. **Owned Connections**: A client owns its sockets; `clone()` shares the
//!    immutable configuration and opens its own.
//! 3. **Typed Marshaling**: `get`/`set` serialize through the codec, while the
//!    `_raw` variants move bytes untouched.
//! 4. **Fail Fast**: Invalid keys are rejected before any network call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, Payload};
use crate::connection::ConnectionOptions;
use crate::distribution::{Distribution, Distributor};
use crate::error::{ClientResult, Error, Operation};
use crate::executor::{DeliveryMode, RequestExecutor};
use crate::key::KeyCodec;
use crate::protocol::StorageVerb;
use crate::server::{ServerAddress, ServerList, ServerPool};
use crate::stats::Stats;

/// Configuration for a client and every clone made from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Prefix prepended to every key.
    pub namespace: Option<String>,
    /// Key-to-server mapping.
    pub distribution: Distribution,
    /// Whether calls block for and check server replies.
    pub delivery_mode: DeliveryMode,
    /// Format used by the marshaling operations.
    pub codec: Codec,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional read/write timeout applied per request.
    pub io_timeout: Option<Duration>,
    /// How long a server that refused a connection is skipped. Zero disables.
    pub retry_timeout: Duration,
    /// Queued bytes per server that force a buffered flush.
    pub buffer_flush_threshold: usize,
    /// Disable Nagle on every socket.
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            namespace: None,
            distribution: Distribution::Modula,
            delivery_mode: DeliveryMode::Sync,
            codec: Codec::Bincode,
            connect_timeout: Some(Duration::from_secs(1)),
            io_timeout: Some(Duration::from_secs(5)),
            retry_timeout: Duration::from_secs(2),
            buffer_flush_threshold: 64 * 1024,
            tcp_nodelay: true,
        }
    }
}

impl ClientConfig {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            retry_timeout: self.retry_timeout,
            tcp_nodelay: self.tcp_nodelay,
        }
    }
}

/// Immutable state shared by a client and its clones.
struct Shared {
    servers: ServerPool,
    config: ClientConfig,
    keys: KeyCodec,
    distributor: Distributor,
}

/// Blocking memcached client.
///
/// Operations take `&mut self`; to use the same servers from several threads,
/// give each thread its own `clone()`.
pub struct MemcachedClient {
    shared: Arc<Shared>,
    executor: RequestExecutor,
}

impl MemcachedClient {
    /// Creates a client with default configuration.
    pub fn connect<L: ServerList + ?Sized>(servers: &L) -> ClientResult<Self> {
        Self::new(servers, ClientConfig::default())
    }

    /// Creates a client for one `"host:port"` or a list of them.
    ///
    /// No socket is opened until the first request routed to a server.
    pub fn new<L: ServerList + ?Sized>(servers: &L, config: ClientConfig) -> ClientResult<Self> {
        let servers = ServerPool::parse(servers)?;
        let keys = KeyCodec::new(config.namespace.clone())?;
        let distributor = Distributor::new(config.distribution, &servers);
        let shared = Arc::new(Shared {
            servers,
            config,
            keys,
            distributor,
        });
        Ok(Self::from_shared(shared))
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        let config = &shared.config;
        let executor = RequestExecutor::new(
            &shared.servers,
            config.connection_options(),
            config.delivery_mode,
            config.buffer_flush_threshold,
        );
        MemcachedClient { shared, executor }
    }

    pub fn servers(&self) -> &ServerPool {
        &self.shared.servers
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn namespace(&self) -> Option<&str> {
        self.shared.keys.namespace()
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.executor.mode()
    }

    /// Returns the server that owns `key`.
    pub fn server_for(&self, key: &str) -> ClientResult<&ServerAddress> {
        let (server, full) = self.route(Operation::Get, key)?;
        self.shared.servers.get(server).ok_or_else(|| Error::Client {
            op: Operation::Get,
            key: full,
            reason: "no server for key".to_string(),
        })
    }

    /// Fetches and decodes a value; a missing key is `NotFound`.
    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> ClientResult<T> {
        let (server, full) = self.route(Operation::Get, key)?;
        let block = self.executor.get(server, &full)?;
        self.decode(Operation::Get, &full, &block.data)
    }

    /// Fetches the stored bytes unmodified.
    pub fn get_raw(&mut self, key: &str) -> ClientResult<Bytes> {
        let (server, full) = self.route(Operation::Get, key)?;
        Ok(self.executor.get(server, &full)?.data)
    }

    /// Fetches several keys and decodes them in input order.
    ///
    /// Any missing key fails the whole call with `NotFound`.
    pub fn get_multi<T: DeserializeOwned, K: AsRef<str>>(&mut self, keys: &[K]) -> ClientResult<Vec<T>> {
        let fetched = self.fetch_multi(keys)?;
        fetched
            .into_iter()
            .map(|(full, data)| self.decode(Operation::GetMulti, &full, &data))
            .collect()
    }

    /// Fetches several keys as raw bytes, in input order.
    pub fn get_multi_raw<K: AsRef<str>>(&mut self, keys: &[K]) -> ClientResult<Vec<Bytes>> {
        Ok(self
            .fetch_multi(keys)?
            .into_iter()
            .map(|(_, data)| data)
            .collect())
    }

    /// Stores a serialized value unconditionally. `ttl` is in seconds; 0 never expires.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T, ttl: u32) -> ClientResult<()> {
        self.store_encoded(Operation::Set, StorageVerb::Set, key, value, ttl)
    }

    pub fn set_raw(&mut self, key: &str, value: impl AsRef<[u8]>, ttl: u32) -> ClientResult<()> {
        self.store_raw(Operation::Set, StorageVerb::Set, key, value.as_ref(), ttl)
    }

    /// Stores only if the key is absent; otherwise `NotStored`.
    pub fn add<T: Serialize + ?Sized>(&mut self, key: &str, value: &T, ttl: u32) -> ClientResult<()> {
        self.store_encoded(Operation::Add, StorageVerb::Add, key, value, ttl)
    }

    pub fn add_raw(&mut self, key: &str, value: impl AsRef<[u8]>, ttl: u32) -> ClientResult<()> {
        self.store_raw(Operation::Add, StorageVerb::Add, key, value.as_ref(), ttl)
    }

    /// Stores only if the key exists; otherwise `NotStored`.
    pub fn replace<T: Serialize + ?Sized>(&mut self, key: &str, value: &T, ttl: u32) -> ClientResult<()> {
        self.store_encoded(Operation::Replace, StorageVerb::Replace, key, value, ttl)
    }

    pub fn replace_raw(&mut self, key: &str, value: impl AsRef<[u8]>, ttl: u32) -> ClientResult<()> {
        self.store_raw(Operation::Replace, StorageVerb::Replace, key, value.as_ref(), ttl)
    }

    /// Appends bytes to an existing raw payload.
    pub fn append(&mut self, key: &str, value: impl AsRef<[u8]>) -> ClientResult<()> {
        self.store_raw(Operation::Append, StorageVerb::Append, key, value.as_ref(), 0)
    }

    /// Prepends bytes to an existing raw payload.
    pub fn prepend(&mut self, key: &str, value: impl AsRef<[u8]>) -> ClientResult<()> {
        self.store_raw(Operation::Prepend, StorageVerb::Prepend, key, value.as_ref(), 0)
    }

    /// Removes a key; a missing key is `NotFound` in sync mode.
    pub fn delete(&mut self, key: &str) -> ClientResult<()> {
        let (server, full) = self.route(Operation::Delete, key)?;
        self.executor.delete(server, &full)
    }

    /// Adds `offset` to a numeric raw payload and returns the new value.
    pub fn increment(&mut self, key: &str, offset: u64) -> ClientResult<u64> {
        let (server, full) = self.route(Operation::Increment, key)?;
        self.executor.arith(server, Operation::Increment, &full, offset)
    }

    /// Subtracts `offset`, flooring at zero, and returns the new value.
    pub fn decrement(&mut self, key: &str, offset: u64) -> ClientResult<u64> {
        let (server, full) = self.route(Operation::Decrement, key)?;
        self.executor.arith(server, Operation::Decrement, &full, offset)
    }

    /// Collects stats from every server, one value per server in pool order.
    pub fn stats(&mut self) -> ClientResult<Stats> {
        Ok(Stats::from_servers(self.executor.stats()?))
    }

    /// Writes queued commands and returns the first deferred failure.
    ///
    /// A no-op unless the client is in buffered mode with work queued.
    pub fn flush(&mut self) -> ClientResult<()> {
        self.executor.flush()
    }

    fn route(&self, op: Operation, key: &str) -> ClientResult<(usize, String)> {
        let full = self.shared.keys.encode(op, key)?;
        let server = self.shared.distributor.select(full.as_bytes());
        Ok((server, full))
    }

    fn store_encoded<T: Serialize + ?Sized>(
        &mut self,
        op: Operation,
        verb: StorageVerb,
        key: &str,
        value: &T,
        ttl: u32,
    ) -> ClientResult<()> {
        let (server, full) = self.route(op, key)?;
        let encoded = self
            .shared
            .config
            .codec
            .encode(value)
            .map_err(|err| Error::Client {
                op,
                key: full.clone(),
                reason: format!("value could not be serialized: {err}"),
            })?;
        self.executor
            .store(server, op, verb, &full, Payload::serialized(&encoded), ttl)
    }

    fn store_raw(
        &mut self,
        op: Operation,
        verb: StorageVerb,
        key: &str,
        value: &[u8],
        ttl: u32,
    ) -> ClientResult<()> {
        let (server, full) = self.route(op, key)?;
        self.executor
            .store(server, op, verb, &full, Payload::raw(value), ttl)
    }

    /// Returns `(namespaced key, payload)` pairs in input order.
    fn fetch_multi<K: AsRef<str>>(&mut self, keys: &[K]) -> ClientResult<Vec<(String, Bytes)>> {
        let op = Operation::GetMulti;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut ordered = Vec::with_capacity(keys.len());
        let mut batches: Vec<(usize, Vec<String>)> = Vec::new();
        for key in keys {
            let (server, full) = self.route(op, key.as_ref())?;
            // Servers keep first-seen order; duplicate keys are requested once.
            match batches.iter_mut().find(|(s, _)| *s == server) {
                Some((_, batch)) => {
                    if !batch.contains(&full) {
                        batch.push(full.clone());
                    }
                }
                None => batches.push((server, vec![full.clone()])),
            }
            ordered.push(full);
        }

        let found = self.executor.get_multi(&batches)?;
        let mut values = Vec::with_capacity(ordered.len());
        for full in ordered {
            let data = match found.get(&full) {
                Some(block) => block.data.clone(),
                None => return Err(Error::NotFound { op, key: full }),
            };
            values.push((full, data));
        }
        Ok(values)
    }

    fn decode<T: DeserializeOwned>(&self, op: Operation, key: &str, data: &[u8]) -> ClientResult<T> {
        self.shared
            .config
            .codec
            .decode(data)
            .map_err(|source| Error::Decode {
                op,
                key: key.to_owned(),
                source,
            })
    }
}

impl Clone for MemcachedClient {
    /// Shares configuration and routing; opens fresh connections on demand.
    fn clone(&self) -> Self {
        Self::from_shared(Arc::clone(&self.shared))
    }
}

impl fmt::Debug for MemcachedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedClient")
            .field("servers", &self.shared.servers.as_slice())
            .field("namespace", &self.shared.keys.namespace())
            .field("distribution", &self.shared.config.distribution)
            .field("delivery_mode", &self.executor.mode())
            .field("connected", &self.executor.connected())
            .finish()
    }
}
