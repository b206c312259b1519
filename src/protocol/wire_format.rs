//! Wire format encoding and decoding.
//!
//! Every frame part is length-prefixed so a reader can skip a body without
//! knowing its type:
//! ```text
//! ┌──────────┬────────────────┬──────────┬────────────────┐
//! │ Hdr len  │ Header         │ Body len │ Body           │
//! │ uint32 BE│ codec-encoded  │ uint32 BE│ codec-encoded  │
//! └──────────┴────────────────┴──────────┴────────────────┘
//! ```
//!
//! The handshake ([`Options`](super::Options)) uses the same length prefix
//! around a JSON object.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RpcError, Result};

/// Magic number identifying an rpcwire connection.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Size of the length prefix in front of every part.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum size of a single header or body part (64 MiB).
pub const DEFAULT_MAX_PART_SIZE: u32 = 64 * 1024 * 1024;

/// Sequence number that is never assigned to a call.
pub const INVALID_SEQ: u64 = 0;

/// Message header; exactly one body follows each header on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Target in `Service.Method` form.
    pub service_method: String,
    /// Sequence number chosen by the client.
    pub seq: u64,
    /// Empty on success.
    #[serde(default)]
    pub error: String,
}

impl Header {
    /// Create a request header.
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Check if this header reports an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Turn this header into an error response for the same call.
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = error.to_string();
        self
    }
}

/// Body sent in place of the reply when the header carries an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidRequest {}

/// Append one length-prefixed part to `buf`.
pub fn encode_part(buf: &mut BytesMut, part: &[u8]) -> Result<()> {
    let len = u32::try_from(part.len())
        .ok()
        .filter(|len| *len <= DEFAULT_MAX_PART_SIZE)
        .ok_or_else(|| {
            RpcError::Protocol(format!(
                "part of {} bytes exceeds maximum {}",
                part.len(),
                DEFAULT_MAX_PART_SIZE
            ))
        })?;
    buf.reserve(LENGTH_PREFIX_SIZE + part.len());
    buf.put_u32(len);
    buf.put_slice(part);
    Ok(())
}

/// Build a complete frame (header part then body part) as one buffer.
///
/// # Example
///
/// ```
/// use rpcwire::protocol::{encode_frame, LENGTH_PREFIX_SIZE};
///
/// let frame = encode_frame(b"hdr", b"body").unwrap();
/// assert_eq!(frame.len(), 2 * LENGTH_PREFIX_SIZE + 3 + 4);
/// ```
pub fn encode_frame(header: &[u8], body: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(2 * LENGTH_PREFIX_SIZE + header.len() + body.len());
    encode_part(&mut buf, header)?;
    encode_part(&mut buf, body)?;
    Ok(buf.freeze())
}

/// Read one length-prefixed part.
///
/// Returns `Ok(None)` when the stream ends cleanly on a part boundary.
/// Ending anywhere else is an `UnexpectedEof` I/O error.
pub async fn read_part<R>(reader: &mut R, max_part_size: u32) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf);
    if len > max_part_size {
        return Err(RpcError::Protocol(format!(
            "part of {} bytes exceeds maximum {}",
            len, max_part_size
        )));
    }

    let mut part = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut part).await?;
    Ok(Some(part.freeze()))
}
