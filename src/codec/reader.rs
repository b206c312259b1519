//! Positional frame reader.
//!
//! Reads are strictly sequenced: one [`read_header`](CodecReader::read_header)
//! is followed by exactly one body read ([`read_body`](CodecReader::read_body),
//! [`read_body_raw`](CodecReader::read_body_raw) or
//! [`discard_body`](CodecReader::discard_body)) before the next header.
//! Because every part is length-prefixed, a discarded body is consumed
//! without knowing its type and the stream stays aligned.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, BufReader};

use super::CodecType;
use crate::error::{RpcError, Result};
use crate::protocol::{read_part, Header, DEFAULT_MAX_PART_SIZE};

/// Type-erased read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Read half of a negotiated connection.
pub struct CodecReader {
    reader: BufReader<BoxedReader>,
    codec: CodecType,
    max_part_size: u32,
    /// A header was read and its body has not been consumed yet.
    body_pending: bool,
}

impl CodecReader {
    /// Wrap an already-buffered reader (the handshake is read through the
    /// same buffer).
    pub fn new(reader: BufReader<BoxedReader>, codec: CodecType) -> Self {
        Self {
            reader,
            codec,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            body_pending: false,
        }
    }

    /// Codec this reader decodes with.
    #[inline]
    pub fn codec_type(&self) -> CodecType {
        self.codec
    }

    /// Read the next header.
    ///
    /// A clean end of stream yields [`RpcError::ConnectionClosed`].
    pub async fn read_header(&mut self) -> Result<Header> {
        if self.body_pending {
            return Err(RpcError::Protocol(
                "header read before previous body was consumed".into(),
            ));
        }
        let part = read_part(&mut self.reader, self.max_part_size)
            .await?
            .ok_or(RpcError::ConnectionClosed)?;
        let header = self.codec.decode(&part)?;
        self.body_pending = true;
        Ok(header)
    }

    /// Read the body that follows the last header, still encoded.
    ///
    /// Errors from here are stream-level: the connection is no longer
    /// aligned and must be dropped.
    pub async fn read_body_raw(&mut self) -> Result<Bytes> {
        if !self.body_pending {
            return Err(RpcError::Protocol("body read without a header".into()));
        }
        let part = match read_part(&mut self.reader, self.max_part_size).await? {
            Some(part) => part,
            None => {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        };
        self.body_pending = false;
        Ok(part)
    }

    /// Read and decode the body that follows the last header.
    ///
    /// A decode failure leaves the stream aligned.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        let part = self.read_body_raw().await?;
        self.codec.decode(&part)
    }

    /// Consume the body that follows the last header without decoding it.
    pub async fn discard_body(&mut self) -> Result<()> {
        self.read_body_raw().await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;

    fn reader_over(data: Vec<u8>, codec: CodecType) -> CodecReader {
        let boxed: BoxedReader = Box::new(std::io::Cursor::new(data));
        CodecReader::new(BufReader::new(boxed), codec)
    }

    fn frame(codec: CodecType, header: &Header, body: &impl serde::Serialize) -> Vec<u8> {
        let h = codec.encode(header).unwrap();
        let b = codec.encode(body).unwrap();
        encode_frame(&h, &b).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_header_then_body() {
        let codec = CodecType::MsgPack;
        let mut reader = reader_over(frame(codec, &Header::request("Foo.Sum", 1), &3i32), codec);

        let header = reader.read_header().await.unwrap();
        assert_eq!(header.seq, 1);
        let body: i32 = reader.read_body().await.unwrap();
        assert_eq!(body, 3);

        assert!(matches!(
            reader.read_header().await,
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_discard_keeps_alignment() {
        let codec = CodecType::Json;
        let mut data = frame(codec, &Header::request("Foo.Sum", 1), &"orphan");
        data.extend(frame(codec, &Header::request("Foo.Sum", 2), &7u64));
        let mut reader = reader_over(data, codec);

        assert_eq!(reader.read_header().await.unwrap().seq, 1);
        reader.discard_body().await.unwrap();
        assert_eq!(reader.read_header().await.unwrap().seq, 2);
        assert_eq!(reader.read_body::<u64>().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_alignment() {
        let codec = CodecType::Json;
        let mut data = frame(codec, &Header::request("Foo.Sum", 1), &"not a number");
        data.extend(frame(codec, &Header::request("Foo.Sum", 2), &7u64));
        let mut reader = reader_over(data, codec);

        reader.read_header().await.unwrap();
        assert!(matches!(
            reader.read_body::<u64>().await,
            Err(RpcError::Decode(_))
        ));
        assert_eq!(reader.read_header().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_out_of_order_reads_rejected() {
        let codec = CodecType::MsgPack;
        let mut reader = reader_over(frame(codec, &Header::request("A.B", 1), &()), codec);

        assert!(matches!(
            reader.discard_body().await,
            Err(RpcError::Protocol(_))
        ));
        reader.read_header().await.unwrap();
        assert!(matches!(
            reader.read_header().await,
            Err(RpcError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_body_is_eof() {
        let codec = CodecType::MsgPack;
        let mut data = Vec::new();
        let h = codec.encode(&Header::request("A.B", 1)).unwrap();
        let mut buf = bytes::BytesMut::new();
        crate::protocol::encode_part(&mut buf, &h).unwrap();
        data.extend_from_slice(&buf);
        let mut reader = reader_over(data, codec);

        reader.read_header().await.unwrap();
        let err = reader.read_body_raw().await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
