//! Handshake record sent once, first on every connection.
//!
//! The record is always JSON, whatever codec it negotiates, so that the
//! server can read it before knowing how the rest of the stream is encoded.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use rpcwire::codec::CodecType;
//! use rpcwire::protocol::{Options, MAGIC_NUMBER};
//!
//! let opts = Options::default()
//!     .with_codec(CodecType::Json)
//!     .with_handle_timeout(Duration::from_secs(1));
//!
//! assert_eq!(opts.magic_number, MAGIC_NUMBER);
//! assert_eq!(opts.codec_type, "application/json");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::wire_format::{encode_part, read_part, MAGIC_NUMBER};
use crate::codec::CodecType;
use crate::error::{RpcError, Result};

/// Default bound on connecting plus handshaking.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest handshake frame a server will accept.
const MAX_OPTIONS_SIZE: u32 = 4096;

/// Connection options, negotiated once per connection.
///
/// A zero timeout means "no limit".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Must equal [`MAGIC_NUMBER`].
    pub magic_number: u32,
    /// Codec identifier for every frame after the handshake.
    pub codec_type: String,
    /// Client-side bound on connect + handshake.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Server-side bound on waiting for a method result.
    #[serde(with = "duration_millis")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default().identifier().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Select a registered codec.
    pub fn with_codec(mut self, codec: CodecType) -> Self {
        self.codec_type = codec.identifier().to_string();
        self
    }

    /// Set the connect timeout (zero = unbounded).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the server handle timeout (zero = unbounded).
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Fill in an empty codec identifier with the default codec.
    pub fn with_defaults(mut self) -> Self {
        if self.codec_type.is_empty() {
            self.codec_type = CodecType::default().identifier().to_string();
        }
        self
    }

    /// Check the magic number and resolve the codec.
    pub fn validate(&self) -> Result<CodecType> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(RpcError::InvalidMagic(self.magic_number));
        }
        self.codec_type.parse()
    }
}

/// Write the handshake frame.
pub async fn write_options<W>(writer: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(options).map_err(|e| RpcError::Encode(e.to_string()))?;
    let mut buf = bytes::BytesMut::new();
    encode_part(&mut buf, &json)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the handshake frame. Does not validate it.
pub async fn read_options<R>(reader: &mut R) -> Result<Options>
where
    R: AsyncRead + Unpin,
{
    let part = read_part(reader, MAX_OPTIONS_SIZE)
        .await?
        .ok_or(RpcError::ConnectionClosed)?;
    serde_json::from_slice(&part).map_err(|e| RpcError::Protocol(format!("options error: {e}")))
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.magic_number, MAGIC_NUMBER);
        assert_eq!(opts.codec_type, "application/msgpack");
        assert_eq!(opts.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(opts.handle_timeout.is_zero());
    }

    #[test]
    fn test_json_shape_uses_millis() {
        let opts = Options::default().with_handle_timeout(Duration::from_millis(1500));
        let value = serde_json::to_value(&opts).unwrap();
        assert_eq!(value["magic_number"], MAGIC_NUMBER);
        assert_eq!(value["handle_timeout"], 1500);
        assert_eq!(value["connect_timeout"], 10_000);
    }

    #[test]
    fn test_validate_rejects_bad_magic() {
        let opts = Options {
            magic_number: 0xdead,
            ..Options::default()
        };
        assert!(matches!(opts.validate(), Err(RpcError::InvalidMagic(0xdead))));
    }

    #[test]
    fn test_validate_rejects_unknown_codec() {
        let opts = Options {
            codec_type: "application/gob".into(),
            ..Options::default()
        };
        assert!(matches!(opts.validate(), Err(RpcError::UnknownCodec(_))));
    }

    #[tokio::test]
    async fn test_write_then_read_options() {
        let opts = Options::default()
            .with_codec(CodecType::Json)
            .with_connect_timeout(Duration::ZERO);
        let mut buf = Vec::new();
        write_options(&mut buf, &opts).await.unwrap();

        let mut reader = &buf[..];
        let decoded = read_options(&mut reader).await.unwrap();
        assert_eq!(decoded, opts);
        assert_eq!(decoded.validate().unwrap(), CodecType::Json);
    }

    #[tokio::test]
    async fn test_read_options_garbage() {
        let mut buf = bytes::BytesMut::new();
        encode_part(&mut buf, b"not json").unwrap();
        let mut reader = &buf[..];
        assert!(matches!(
            read_options(&mut reader).await,
            Err(RpcError::Protocol(_))
        ));
    }
}
