//! MsgPack codec using `rmp-serde`.
//!
//! **Always** `to_vec_named`, never `to_vec`: structs go out as maps keyed
//! by field name, so peers do not depend on field order and an empty
//! placeholder record decodes as an empty map.
//!
//! # Example
//!
//! ```
//! use rpcwire::codec::{Codec, MsgPackCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Args {
//!     num1: i32,
//!     num2: i32,
//! }
//!
//! let args = Args { num1: 1, num2: 2 };
//! let encoded = MsgPackCodec::encode(&args).unwrap();
//! let decoded: Args = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, args);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Codec, CodecType};
use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    const TYPE: CodecType = CodecType::MsgPack;

    #[inline]
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        // to_vec_named, NOT to_vec
        Ok(rmp_serde::to_vec_named(value)?)
    }

    #[inline]
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
