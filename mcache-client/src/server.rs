//! # Server Pool
//!
//! Purpose: Parse `host:port` strings into validated addresses and keep the
//! ordered server list a client distributes keys across.
//!
//! ## Design Principles
//! 1. **Validate Once**: Malformed addresses are rejected at construction.
//! 2. **Immutable Sharing**: The address list sits behind an `Arc` so clones
//!    share it without copying.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ClientResult, Error};

/// A validated `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    hostname: String,
    port: u16,
}

impl ServerAddress {
    /// Builds an address from already-separated parts.
    pub fn new(hostname: impl Into<String>, port: u16) -> ClientResult<Self> {
        let hostname = hostname.into();
        if hostname.is_empty() || hostname.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(Error::Configuration(format!("invalid hostname {hostname:?}")));
        }
        if port == 0 {
            return Err(Error::Configuration("port must be in 1..=65535".to_string()));
        }
        Ok(ServerAddress { hostname, port })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut fields = raw.split(':');
        let (host, port) = match (fields.next(), fields.next(), fields.next()) {
            (Some(host), Some(port), None) => (host, port),
            _ => {
                return Err(Error::Configuration(format!(
                    "server {raw:?} is not of the form host:port"
                )))
            }
        };

        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Configuration(format!(
                "server {raw:?} has a non-numeric port"
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Configuration(format!("server {raw:?} port is out of range")))?;

        ServerAddress::new(host, port)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// One server address or a list of them, as accepted by the client constructor.
///
/// Implemented for a single address string and for sequences of them.
pub trait ServerList {
    fn server_strings(&self) -> Vec<&str>;
}

impl ServerList for str {
    fn server_strings(&self) -> Vec<&str> {
        vec![self]
    }
}

impl ServerList for String {
    fn server_strings(&self) -> Vec<&str> {
        vec![self.as_str()]
    }
}

impl<S: AsRef<str>> ServerList for [S] {
    fn server_strings(&self) -> Vec<&str> {
        self.iter().map(|s| s.as_ref()).collect()
    }
}

impl<S: AsRef<str>, const N: usize> ServerList for [S; N] {
    fn server_strings(&self) -> Vec<&str> {
        self.iter().map(|s| s.as_ref()).collect()
    }
}

impl<S: AsRef<str>> ServerList for Vec<S> {
    fn server_strings(&self) -> Vec<&str> {
        self.iter().map(|s| s.as_ref()).collect()
    }
}

impl<T: ServerList + ?Sized> ServerList for &T {
    fn server_strings(&self) -> Vec<&str> {
        (**self).server_strings()
    }
}

/// Ordered, non-empty list of cache servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPool {
    servers: Arc<[ServerAddress]>,
}

impl ServerPool {
    /// Parses one or more `host:port` strings.
    pub fn parse<L: ServerList + ?Sized>(servers: &L) -> ClientResult<Self> {
        let parsed = servers
            .server_strings()
            .into_iter()
            .map(|raw| raw.trim().parse())
            .collect::<ClientResult<Vec<ServerAddress>>>()?;
        Self::from_addresses(parsed)
    }

    /// Builds a pool from pre-validated addresses.
    pub fn from_addresses(servers: Vec<ServerAddress>) -> ClientResult<Self> {
        if servers.is_empty() {
            return Err(Error::Configuration("at least one server is required".to_string()));
        }
        Ok(ServerPool {
            servers: servers.into(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Always false; a pool holds at least one server.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&ServerAddress> {
        self.servers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.iter()
    }

    pub fn as_slice(&self) -> &[ServerAddress] {
        &self.servers
    }
}
