//! # Error Taxonomy
//!
//! Purpose: Give callers one closed set of failure kinds to branch on, each
//! tagged with the operation and key that produced it.
//!
//! ## Design Principles
//! 1. **Closed Taxonomy**: Every failure maps to exactly one variant.
//! 2. **Diagnostic Context**: Keyed variants carry the operation and the
//!    namespaced key.
//! 3. **Single Translator**: Server replies are mapped in `executor` only.

use std::fmt;
use std::io;

use crate::codec::CodecError;

/// Result type for the memcached client.
pub type ClientResult<T> = Result<T, Error>;

/// Client operation that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    GetMulti,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Delete,
    Increment,
    Decrement,
    Stats,
    Flush,
}

impl Operation {
    /// Returns the lowercase operation name used in diagnostics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::GetMulti => "get_multi",
            Operation::Set => "set",
            Operation::Add => "add",
            Operation::Replace => "replace",
            Operation::Append => "append",
            Operation::Prepend => "prepend",
            Operation::Delete => "delete",
            Operation::Increment => "increment",
            Operation::Decrement => "decrement",
            Operation::Stats => "stats",
            Operation::Flush => "flush",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the memcached client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed server address or invalid constructor argument.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Caller-side violation detected before any network call.
    #[error("{op} {key:?}: client error: {reason}")]
    Client {
        op: Operation,
        key: String,
        reason: String,
    },

    /// The server rejected the request as structurally invalid.
    #[error("{op} {key:?}: protocol error: {message}")]
    Protocol {
        op: Operation,
        key: String,
        message: String,
    },

    /// The operation required an existing key that is absent.
    #[error("{op} {key:?}: not found")]
    NotFound { op: Operation, key: String },

    /// The conditional store did not take place.
    #[error("{op} {key:?}: not stored")]
    NotStored { op: Operation, key: String },

    /// Server-side failure, including oversized payloads and dead servers.
    #[error("{op} {key:?}: server error: {message}")]
    Server {
        op: Operation,
        key: String,
        message: String,
    },

    /// Payload bytes could not be deserialized.
    #[error("{op} {key:?}: decode error: {source}")]
    Decode {
        op: Operation,
        key: String,
        #[source]
        source: CodecError,
    },

    /// No reply arrived within the configured timeout.
    #[error("{op} {key:?}: timed out")]
    Timeout { op: Operation, key: String },
}

impl Error {
    /// Returns the operation that failed, if the error is operation-scoped.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Error::Configuration(_) => None,
            Error::Client { op, .. }
            | Error::Protocol { op, .. }
            | Error::NotFound { op, .. }
            | Error::NotStored { op, .. }
            | Error::Server { op, .. }
            | Error::Decode { op, .. }
            | Error::Timeout { op, .. } => Some(*op),
        }
    }

    /// Returns the namespaced key the failing operation targeted.
    ///
    /// Keyless operations (stats, flush) report an empty key.
    pub fn key(&self) -> Option<&str> {
        match self {
            Error::Configuration(_) => None,
            Error::Client { key, .. }
            | Error::Protocol { key, .. }
            | Error::NotFound { key, .. }
            | Error::NotStored { key, .. }
            | Error::Server { key, .. }
            | Error::Decode { key, .. }
            | Error::Timeout { key, .. } => Some(key),
        }
    }

    /// Returns true for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns true for `NotStored`.
    pub fn is_not_stored(&self) -> bool {
        matches!(self, Error::NotStored { .. })
    }

    pub(crate) fn from_io(op: Operation, key: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout {
                op,
                key: key.to_owned(),
            },
            _ => Error::Server {
                op,
                key: key.to_owned(),
                message: err.to_string(),
            },
        }
    }
}
