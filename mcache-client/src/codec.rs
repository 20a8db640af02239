//! # Value Codec
//!
//! Purpose: Turn application values into the raw payload stored on the
//! server and back, without losing a single byte.
//!
//! ## Design Principles
//! 1. **Length Travels Out-of-Band**: Encoded payloads are `Bytes` with an
//!    explicit length; nothing downstream scans for a terminator, so payloads
//!    containing `\0` survive intact.
//! 2. **Pluggable Format**: `Codec` picks bincode (default) or JSON.
//! 3. **Flags Mark Intent**: Serialized payloads are stored with
//!    `FLAG_SERIALIZED`; raw payloads with `FLAG_RAW`.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// Flags stored with raw (unmarshaled) payloads.
pub const FLAG_RAW: u32 = 0;

/// Flags stored with serialized payloads.
pub const FLAG_SERIALIZED: u32 = 0x1;

/// Failure inside the serialization format.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structured serialization format for marshaled values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    #[default]
    Bincode,
    Json,
}

impl Codec {
    /// Serializes `value` into a payload.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        let encoded = match self {
            Codec::Bincode => bincode::serialize(value)?,
            Codec::Json => serde_json::to_vec(value)?,
        };
        Ok(Bytes::from(encoded))
    }

    /// Deserializes a payload produced by [`Codec::encode`].
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Bincode => Ok(bincode::deserialize(payload)?),
            Codec::Json => Ok(serde_json::from_slice(payload)?),
        }
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "bincode" => Ok(Codec::Bincode),
            "json" => Ok(Codec::Json),
            other => Err(Error::Configuration(format!("unknown codec {other:?}"))),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Bincode => f.write_str("bincode"),
            Codec::Json => f.write_str("json"),
        }
    }
}

/// Payload plus flags, ready for a storage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Payload<'a> {
    pub data: &'a [u8],
    pub flags: u32,
}

impl<'a> Payload<'a> {
    pub(crate) fn raw(data: &'a [u8]) -> Self {
        Payload {
            data,
            flags: FLAG_RAW,
        }
    }

    pub(crate) fn serialized(data: &'a [u8]) -> Self {
        Payload {
            data,
            flags: FLAG_SERIALIZED,
        }
    }
}
