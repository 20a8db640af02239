//! # Key Codec
//!
//! Applies the optional namespace prefix and enforces the text-protocol key
//! rules before a key is routed or sent.

use crate::error::{ClientResult, Error, Operation};

/// Maximum key length accepted by the memcached text protocol.
pub const MAX_KEY_LEN: usize = 250;

/// Namespace-aware key validator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCodec {
    namespace: Option<String>,
}

impl KeyCodec {
    /// Creates a codec, rejecting namespaces that could never form a valid key.
    pub fn new(namespace: Option<String>) -> ClientResult<Self> {
        if let Some(ns) = namespace.as_deref() {
            if ns.len() >= MAX_KEY_LEN {
                return Err(Error::Configuration(format!(
                    "namespace is {} bytes; must be shorter than {MAX_KEY_LEN}",
                    ns.len()
                )));
            }
            if let Err(reason) = check_bytes(ns.as_bytes()) {
                return Err(Error::Configuration(format!("namespace {ns:?} {reason}")));
            }
        }
        Ok(KeyCodec { namespace })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns `namespace + key`, or `key` unchanged when no namespace is set.
    pub fn apply_namespace(&self, key: &str) -> String {
        match self.namespace.as_deref() {
            Some(ns) => {
                let mut full = String::with_capacity(ns.len() + key.len());
                full.push_str(ns);
                full.push_str(key);
                full
            }
            None => key.to_owned(),
        }
    }

    /// Namespaces and validates a key for `op`.
    pub fn encode(&self, op: Operation, key: &str) -> ClientResult<String> {
        let full = self.apply_namespace(key);
        match validate(full.as_bytes()) {
            Ok(()) => Ok(full),
            Err(reason) => Err(Error::Client {
                op,
                key: full,
                reason: reason.to_string(),
            }),
        }
    }
}

/// Checks a fully-namespaced key against the protocol rules.
pub fn validate(key: &[u8]) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("key is empty");
    }
    if key.len() > MAX_KEY_LEN {
        return Err("key exceeds 250 bytes");
    }
    check_bytes(key)
}

fn check_bytes(bytes: &[u8]) -> Result<(), &'static str> {
    for &b in bytes {
        if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' {
            return Err("contains whitespace");
        }
        if b.is_ascii_control() {
            return Err("contains a control character");
        }
    }
    Ok(())
}
