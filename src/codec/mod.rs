//! Codec module - header and body encodings.
//!
//! This module provides the encodings a connection can negotiate:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (struct-as-map), the default
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! # Design
//!
//! Codecs are marker structs with static generic methods rather than trait
//! objects. A connection picks one at handshake time by identifier through
//! the process-wide table behind [`CodecType::from_str`](std::str::FromStr);
//! an unknown identifier is a hard handshake error.
//!
//! Reads are positional: [`CodecReader`] hands out exactly one body per
//! header. Writes go through the connection's writer task, which keeps
//! frames from concurrent writers from interleaving.
//!
//! # Example
//!
//! ```
//! use rpcwire::codec::{Codec, CodecType, JsonCodec};
//!
//! let encoded = JsonCodec::encode(&(1, 2)).unwrap();
//! let decoded: (i32, i32) = CodecType::Json.decode(&encoded).unwrap();
//! assert_eq!(decoded, (1, 2));
//!
//! assert!("application/gob".parse::<CodecType>().is_err());
//! ```

mod json;
mod msgpack;
mod reader;

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RpcError, Result};

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;
pub use reader::{BoxedReader, CodecReader};

/// Identifier of the JSON codec.
pub const JSON_TYPE: &str = "application/json";

/// Identifier of the MessagePack codec.
pub const MSGPACK_TYPE: &str = "application/msgpack";

/// Registered codecs, keyed by identifier.
static CODECS: &[(&str, CodecType)] = &[
    (JSON_TYPE, JsonCodec::TYPE),
    (MSGPACK_TYPE, MsgPackCodec::TYPE),
];

/// One wire encoding for headers and bodies.
pub trait Codec {
    /// Registry entry for this codec.
    const TYPE: CodecType;

    /// Encode a value.
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>;

    /// Decode a value.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

/// Codec negotiated for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CodecType {
    /// `application/json`
    Json,
    /// `application/msgpack`
    #[default]
    MsgPack,
}

impl CodecType {
    /// Wire identifier sent in the handshake.
    pub const fn identifier(&self) -> &'static str {
        match self {
            CodecType::Json => JSON_TYPE,
            CodecType::MsgPack => MSGPACK_TYPE,
        }
    }

    /// Every registered identifier.
    pub fn registered() -> impl Iterator<Item = &'static str> {
        CODECS.iter().map(|(id, _)| *id)
    }

    /// Encode a value with this codec.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecType::Json => JsonCodec::encode(value),
            CodecType::MsgPack => MsgPackCodec::encode(value),
        }
    }

    /// Decode a value with this codec.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecType::Json => JsonCodec::decode(bytes),
            CodecType::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}

impl FromStr for CodecType {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        CODECS
            .iter()
            .find(|(id, _)| *id == s)
            .map(|(_, codec)| *codec)
            .ok_or_else(|| RpcError::UnknownCodec(s.to_string()))
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}
