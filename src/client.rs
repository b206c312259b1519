//! RPC client: one connection, many concurrent calls.
//!
//! Every call ends exactly once, by whichever of these gets to its pending
//! entry first:
//!
//! 1. the reader task, when a response with its sequence number arrives;
//! 2. the send path, when the request frame could not be written;
//! 3. the shutdown sweep, when the reader stops for any reason.
//!
//! A caller that gives up (cancel or timeout) removes its own entry; the
//! response still arrives later and is read and dropped.
//!
//! # Example
//!
//! ```no_run
//! use rpcwire::{dial, Options};
//!
//! # async fn run() -> rpcwire::Result<()> {
//! let client = dial("127.0.0.1:9999", Options::default()).await?;
//!
//! let sum: i32 = client.call("Foo.Sum", &(1, 2)).await?;
//! assert_eq!(sum, 3);
//!
//! // Fire several calls and collect them later.
//! let calls: Vec<_> = (0..5).map(|i| client.go::<_, i32>("Foo.Sum", &(i, i * i))).collect();
//! for call in calls {
//!     println!("{}", call.await?);
//! }
//! client.close()?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::{BoxedReader, CodecReader, CodecType};
use crate::error::{RpcError, Result};
use crate::protocol::{write_options, Header, Options, INVALID_SEQ};
use crate::writer::{spawn_writer_task, WriteReceipt, WriterHandle};

/// Delivers the raw response body (or the terminal error) to a waiting call.
type Completer = Box<dyn FnOnce(Result<Bytes>) + Send>;

struct PendingCall {
    service_method: String,
    complete: Completer,
}

struct ClientState {
    /// Next sequence number; starts at 1.
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    /// The user called `close`.
    closing: bool,
    /// The connection failed or the reader stopped.
    shutdown: bool,
}

struct ClientInner {
    options: Options,
    codec: CodecType,
    writer: WriterHandle,
    /// Held while a call is registered and its frame queued.
    sending: Mutex<()>,
    state: Mutex<ClientState>,
    /// Stops the reader and writer tasks.
    closed: CancellationToken,
}

/// A connection to one server. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// An asynchronous call started with [`Client::go`].
///
/// Await it for the reply, or poll it with [`try_result`](Call::try_result).
#[must_use = "a call does nothing useful unless its result is read"]
pub struct Call<R> {
    seq: u64,
    service_method: String,
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Call<R> {
    /// Sequence number on the wire, [`INVALID_SEQ`] if the call never
    /// registered.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Target in `Service.Method` form.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// The result if the call has finished, without waiting.
    ///
    /// Yields the result once; later polls report [`RpcError::Shutdown`].
    pub fn try_result(&mut self) -> Option<Result<R>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RpcError::Shutdown)),
        }
    }
}

impl<R> Future for Call<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcError::Shutdown)))
    }
}

impl<R> std::fmt::Debug for Call<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("seq", &self.seq)
            .field("service_method", &self.service_method)
            .finish()
    }
}

impl Client {
    /// Handshake on an already connected stream and start the connection's
    /// reader and writer tasks.
    pub async fn new<S>(stream: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let options = options.with_defaults();
        let codec = options.validate().map_err(|e| {
            tracing::error!("rpc client: codec error: {}", e);
            e
        })?;

        let (read_half, mut write_half) = tokio::io::split(stream);
        if let Err(e) = write_options(&mut write_half, &options).await {
            tracing::error!("rpc client: options error: {}", e);
            return Err(e);
        }

        let closed = CancellationToken::new();
        let (writer, _writer_task) =
            spawn_writer_task(Box::new(write_half), codec, closed.clone());

        let inner = Arc::new(ClientInner {
            options,
            codec,
            writer,
            sending: Mutex::new(()),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            closed: closed.clone(),
        });

        let read_half: BoxedReader = Box::new(read_half);
        let reader = CodecReader::new(BufReader::new(read_half), codec);
        tokio::spawn(receive_loop(Arc::downgrade(&inner), reader, closed));

        tracing::debug!(%codec, "rpc client: connected");
        Ok(Self { inner })
    }

    /// Options this client negotiated with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Start a call and return without waiting for it.
    ///
    /// Failures before the request reaches the wire (closed client, argument
    /// encoding) are delivered through the returned [`Call`].
    pub fn go<A, R>(&self, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let codec = self.inner.codec;
        let complete: Completer = Box::new(move |result: Result<Bytes>| {
            let reply = result.and_then(|body| codec.decode::<R>(&body));
            let _ = tx.send(reply);
        });

        let seq = match codec.encode(args) {
            Ok(body) => self.send(service_method, body, complete),
            Err(e) => {
                complete(Err(e));
                INVALID_SEQ
            }
        };

        Call {
            seq,
            service_method: service_method.to_string(),
            rx,
        }
    }

    /// Call and wait for the reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.go(service_method, args).await
    }

    /// Call and wait for the reply or for `cancel`, whichever comes first.
    ///
    /// On cancellation the call is forgotten and [`RpcError::Canceled`] is
    /// returned; the request is not recalled from the server.
    pub async fn call_with_cancel<A, R>(
        &self,
        service_method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let call = self.go(service_method, args);
        let seq = call.seq();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.inner.remove_call(seq);
                Err(RpcError::Canceled)
            }
            result = call => result,
        }
    }

    /// Call and wait at most `timeout` for the reply.
    pub async fn call_timeout<A, R>(&self, service_method: &str, args: &A, timeout: Duration) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let call = self.go(service_method, args);
        let seq = call.seq();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.remove_call(seq);
                Err(RpcError::CallTimeout(timeout))
            }
        }
    }

    /// Close the connection. Pending calls fail with [`RpcError::Shutdown`].
    ///
    /// Closing twice returns [`RpcError::Shutdown`].
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        tracing::debug!("rpc client: closing");
        self.inner.closed.cancel();
        Ok(())
    }

    /// True until the client is closed or its connection fails.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown && !self.inner.writer.is_closed()
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// True while `seq` is waiting for a response.
    pub fn is_pending(&self, seq: u64) -> bool {
        self.inner.state.lock().pending.contains_key(&seq)
    }

    /// Register the call and queue its frame under the sending lock, so
    /// sequence order is wire order.
    fn send(&self, service_method: &str, body: Vec<u8>, complete: Completer) -> u64 {
        let _sending = self.inner.sending.lock();

        let seq = {
            let mut state = self.inner.state.lock();
            if state.closing || state.shutdown {
                drop(state);
                complete(Err(RpcError::Shutdown));
                return INVALID_SEQ;
            }
            let seq = state.seq;
            state.seq += 1;
            state.pending.insert(
                seq,
                PendingCall {
                    service_method: service_method.to_string(),
                    complete,
                },
            );
            seq
        };

        let header = Header::request(service_method, seq);
        match self.inner.writer.write_encoded(&header, &body) {
            Ok(receipt) => {
                tokio::spawn(watch_send(Arc::downgrade(&self.inner), seq, receipt));
            }
            Err(e) => self.inner.fail_call(seq, e),
        }
        seq
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Client")
            .field("codec", &self.inner.codec)
            .field("pending", &state.pending.len())
            .field("closing", &state.closing)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl ClientInner {
    fn remove_call(&self, seq: u64) -> Option<PendingCall> {
        self.state.lock().pending.remove(&seq)
    }

    fn fail_call(&self, seq: u64, err: RpcError) {
        if let Some(call) = self.remove_call(seq) {
            tracing::debug!(service_method = %call.service_method, seq, "rpc client: send failed: {}", err);
            (call.complete)(Err(err));
        }
    }

    /// Route one response to its call.
    fn dispatch(&self, header: Header, body: Bytes) {
        let Some(call) = self.remove_call(header.seq) else {
            tracing::debug!(seq = header.seq, "rpc client: response for unknown call dropped");
            return;
        };
        if header.is_error() {
            (call.complete)(Err(RpcError::Remote(header.error)));
        } else {
            (call.complete)(Ok(body));
        }
    }

    /// Mark the client unusable and fail every pending call with `err`.
    fn terminate_calls(&self, err: RpcError) {
        let _sending = self.sending.lock();
        let pending = {
            let mut state = self.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "rpc client: terminating pending calls: {}", err);
        }
        for (_, call) in pending {
            (call.complete)(Err(err.clone()));
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Fail the call if its request never made it to the socket.
async fn watch_send(inner: Weak<ClientInner>, seq: u64, receipt: WriteReceipt) {
    if let Err(e) = receipt.written().await {
        if let Some(inner) = inner.upgrade() {
            inner.fail_call(seq, e);
        }
    }
}

/// Read responses until the connection ends, then sweep what is left.
async fn receive_loop(inner: Weak<ClientInner>, mut reader: CodecReader, closed: CancellationToken) {
    let err = loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break RpcError::Shutdown,
            frame = read_frame(&mut reader) => frame,
        };
        let (header, body) = match frame {
            Ok(frame) => frame,
            Err(e) => {
                if !e.is_disconnect() {
                    tracing::warn!("rpc client: read error: {}", e);
                }
                break e;
            }
        };
        match inner.upgrade() {
            Some(inner) => inner.dispatch(header, body),
            None => break RpcError::Shutdown,
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.terminate_calls(err);
    }
}

async fn read_frame(reader: &mut CodecReader) -> Result<(Header, Bytes)> {
    let header = reader.read_header().await?;
    let body = reader.read_body_raw().await?;
    Ok((header, body))
}
