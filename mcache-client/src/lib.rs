//! # Memcached Sync Client
//!
//! Purpose: Provide a synchronous memcached client that spreads keys over a
//! pool of servers and stores arbitrary `serde` values byte-exactly.
//!
//! ## Design Principles
//! 1. **Per-Instance Connections**: Each client owns its sockets; `clone()`
//!    is the way to get another independent set.
//! 2. **Deterministic Routing**: A key lands on the same server for a fixed
//!    pool, across calls and clones.
//! 3. **Closed Error Taxonomy**: Every failure is one `Error` variant tagged
//!    with operation and key.
//! 4. **Protocol Clarity**: The text protocol is encoded and parsed
//!    explicitly, with data blocks framed by length.
//!
//! ```no_run
//! use mcache_client::{ClientConfig, MemcachedClient};
//!
//! let config = ClientConfig {
//!     namespace: Some("app:".into()),
//!     ..ClientConfig::default()
//! };
//! let mut client = MemcachedClient::new(&["10.0.0.1:11211", "10.0.0.2:11211"], config)?;
//! client.set("greeting", "hello", 0)?;
//! let greeting: String = client.get("greeting")?;
//! assert_eq!(greeting, "hello");
//! # Ok::<(), mcache_client::Error>(())
//! ```

mod client;
mod codec;
mod connection;
mod distribution;
mod error;
mod executor;
mod key;
mod protocol;
mod server;
mod stats;

pub use client::{ClientConfig, MemcachedClient};
pub use codec::{Codec, CodecError, FLAG_RAW, FLAG_SERIALIZED};
pub use distribution::{one_at_a_time, Distribution};
pub use error::{ClientResult, Error, Operation};
pub use executor::DeliveryMode;
pub use key::{validate as validate_key, MAX_KEY_LEN};
pub use server::{ServerAddress, ServerList, ServerPool};
pub use stats::{StatValue, Stats};
