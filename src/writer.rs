//! Dedicated writer task for frame sending.
//!
//! Each connection owns one writer task fed by an mpsc channel. Frames are
//! encoded in full before they are queued, so a header and its body always
//! reach the socket back to back no matter how many handlers respond at once.
//!
//! # Architecture
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::UnboundedSender<OutboundFrame> ─► Writer Task ─► Socket
//! Call N    ─┘
//! ```
//!
//! Queue order is wire order. The client relies on this: it registers a call
//! and queues its request under one lock, so registration order matches send
//! order.

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::CodecType;
use crate::error::{RpcError, Result};
use crate::protocol::{encode_frame, Header};

/// Maximum frames to batch before flushing.
const MAX_BATCH_SIZE: usize = 64;

/// Type-erased write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A fully encoded frame waiting to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Header part and body part, length prefixes included.
    pub bytes: Bytes,
    /// Notified once the frame is flushed, or with the write error.
    done: oneshot::Sender<Result<()>>,
}

impl OutboundFrame {
    #[inline]
    fn complete(self, result: Result<()>) {
        let _ = self.done.send(result);
    }
}

/// Resolves when a queued frame has been written.
#[derive(Debug)]
pub struct WriteReceipt(oneshot::Receiver<Result<()>>);

impl WriteReceipt {
    /// Wait for the frame to reach the socket.
    pub async fn written(self) -> Result<()> {
        self.0.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable. The writer task exits once every handle is dropped.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    codec: CodecType,
}

impl WriterHandle {
    /// Codec frames are encoded with.
    #[inline]
    pub fn codec_type(&self) -> CodecType {
        self.codec
    }

    /// Encode a header and body and queue them as one frame.
    pub fn write<T: Serialize + ?Sized>(&self, header: &Header, body: &T) -> Result<WriteReceipt> {
        let body = self.codec.encode(body)?;
        self.write_encoded(header, &body)
    }

    /// Queue a frame whose body is already encoded.
    pub fn write_encoded(&self, header: &Header, body: &[u8]) -> Result<WriteReceipt> {
        let header = self.codec.encode(header)?;
        let bytes = encode_frame(&header, body)?;
        let (done, receipt) = oneshot::channel();
        self.tx
            .send(OutboundFrame { bytes, done })
            .map_err(|_| RpcError::ConnectionClosed)?;
        Ok(WriteReceipt(receipt))
    }

    /// Check if the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task stops when every handle is dropped (after writing what is
/// queued) or when `shutdown` is cancelled (dropping what is queued). In
/// both cases it shuts the write half down.
pub fn spawn_writer_task(
    writer: BoxedWriter,
    codec: CodecType,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(writer_loop(rx, writer, shutdown));
    (WriterHandle { tx, codec }, task)
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    writer: BoxedWriter,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut writer = BufWriter::new(writer);

    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("rpc writer: write error: {}", e);
            for frame in batch {
                frame.complete(Err(e.clone()));
            }
            fail_queued(&mut rx, &e);
            return Err(e);
        }
        for frame in batch {
            frame.complete(Ok(()));
        }
    }

    fail_queued(&mut rx, &RpcError::Shutdown);
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames and flush once.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for frame in batch {
        writer.write_all(&frame.bytes).await?;
    }
    writer.flush().await?;
    Ok(())
}

fn fail_queued(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>, err: &RpcError) {
    rx.close();
    while let Ok(frame) = rx.try_recv() {
        frame.complete(Err(err.clone()));
    }
}
