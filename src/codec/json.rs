//! JSON codec using `serde_json`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Codec, CodecType};
use crate::error::{RpcError, Result};

/// JSON codec, human-readable on the wire.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const TYPE: CodecType = CodecType::Json;

    #[inline]
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| RpcError::Encode(e.to_string()))
    }

    #[inline]
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    #[test]
    fn test_struct_is_object() {
        let encoded = JsonCodec::encode(&Args { num1: 1, num2: 2 }).unwrap();
        assert_eq!(encoded, br#"{"num1":1,"num2":2}"#);
    }

    #[test]
    fn test_empty_map_stays_empty() {
        let map: HashMap<String, i32> = HashMap::new();
        let encoded = JsonCodec::encode(&map).unwrap();
        assert_eq!(encoded, b"{}");
        let decoded: HashMap<String, i32> = JsonCodec::decode(&encoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_error_on_wrong_type() {
        let result: Result<Args> = JsonCodec::decode(br#""just a string""#);
        assert!(matches!(result, Err(RpcError::Decode(_))));
    }
}
