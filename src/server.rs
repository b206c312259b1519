//! RPC server: service table, accept loops and per-connection serving.
//!
//! Each connection moves through Handshake, Serving, Draining and Closed:
//!
//! 1. Read the JSON [`Options`] frame, check the magic number, pick a codec.
//!    Any failure drops the connection without a reply.
//! 2. Read header and body pairs in arrival order. Each request runs as its
//!    own task; responses go through the connection's writer task so frames
//!    from concurrent handlers never interleave.
//! 3. When the read side fails or ends, wait for every in-flight handler,
//!    then let the writer flush and shut the stream down.
//!
//! Routing and argument errors are answered per call and the connection
//! keeps serving. Only stream-level read errors end it.
//!
//! # Example
//!
//! ```no_run
//! use rpcwire::service::Service;
//! use rpcwire::Server;
//! use tokio::net::TcpListener;
//!
//! struct Foo;
//!
//! # async fn run() -> rpcwire::Result<()> {
//! let server = Server::new();
//! server.register(
//!     Service::builder(Foo)
//!         .method("Sum", |_: &Foo, args: (i32, i32), reply: &mut i32| {
//!             *reply = args.0 + args.1;
//!             Ok::<_, String>(())
//!         })
//!         .build(),
//! )?;
//!
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! server.accept(listener).await
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::{BoxedReader, CodecReader, CodecType};
use crate::error::{RpcError, Result};
use crate::protocol::{read_options, Header, InvalidRequest, Options};
use crate::service::{ErasedValue, MethodType, Service};
use crate::transport::http::{accept_tunnel, DEFAULT_RPC_PATH};
use crate::writer::{spawn_writer_task, WriteReceipt, WriterHandle};

/// RPC server. Cheap to clone; clones share one service table.
#[derive(Clone, Default)]
pub struct Server {
    inner: Arc<ServerInner>,
}

#[derive(Default)]
struct ServerInner {
    services: RwLock<HashMap<String, Arc<Service>>>,
    /// Stops accept loops; served connections run to completion.
    shutdown: CancellationToken,
}

/// One decoded request, ready for its handler.
struct Request {
    header: Header,
    method: Arc<MethodType>,
    args: ErasedValue,
    reply: ErasedValue,
}

impl Server {
    /// Create a server with no services.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide default server, created on first use.
    ///
    /// Lives for the rest of the process. Nothing else in the crate relies
    /// on it.
    pub fn global() -> &'static Server {
        static GLOBAL: OnceLock<Server> = OnceLock::new();
        GLOBAL.get_or_init(Server::new)
    }

    /// Publish a service.
    ///
    /// Fails with [`RpcError::DuplicateService`] if the name is taken and
    /// [`RpcError::InvalidServiceName`] if it is empty or contains `.`.
    pub fn register(&self, service: Service) -> Result<()> {
        service.validate()?;
        let mut services = self.inner.services.write();
        if services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name().to_string()));
        }
        tracing::info!(
            service = service.name(),
            methods = service.methods().count(),
            "rpc server: registered service"
        );
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Registered services, for introspection.
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.inner.services.read().values().cloned().collect()
    }

    /// Resolve `Service.Method`.
    ///
    /// The split is at the last `.`, so service names cannot contain one.
    pub fn find_service(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodType>)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::IllFormed(service_method.to_string()))?;
        let service = self
            .inner
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method_name.to_string()))?;
        Ok((service, method))
    }

    /// Stop accept loops. Connections already being served are not cut.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Accept TCP connections until [`shutdown`](Self::shutdown) or an
    /// accept error.
    pub async fn accept(&self, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = accepted.map_err(|e| {
                tracing::error!("rpc server: accept error: {}", e);
                RpcError::from(e)
            })?;
            tracing::debug!(%peer, "rpc server: accepted connection");
            let server = self.clone();
            tokio::spawn(async move { server.serve_conn(stream).await });
        }
    }

    /// Accept Unix domain socket connections.
    #[cfg(unix)]
    pub async fn accept_unix(&self, listener: tokio::net::UnixListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, _) = accepted.map_err(|e| {
                tracing::error!("rpc server: accept error: {}", e);
                RpcError::from(e)
            })?;
            let server = self.clone();
            tokio::spawn(async move { server.serve_conn(stream).await });
        }
    }

    /// Accept TCP connections that first upgrade with HTTP `CONNECT` on
    /// [`DEFAULT_RPC_PATH`].
    pub async fn accept_http(&self, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = accepted.map_err(|e| {
                tracing::error!("rpc server: accept error: {}", e);
                RpcError::from(e)
            })?;
            let server = self.clone();
            tokio::spawn(async move {
                match accept_tunnel(stream, DEFAULT_RPC_PATH).await {
                    Ok(Some(stream)) => server.serve_conn(stream).await,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(%peer, "rpc server: hijacking error: {}", e),
                }
            });
        }
    }

    /// Serve one connection until the peer goes away.
    ///
    /// Works over any byte stream; returns once every in-flight request on
    /// it has been answered.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: BoxedReader = Box::new(read_half);
        let mut reader = BufReader::new(read_half);

        let options = match read_options(&mut reader).await {
            Ok(options) => options,
            Err(e) => {
                tracing::warn!("rpc server: options error: {}", e);
                return;
            }
        };
        let codec = match options.validate() {
            Ok(codec) => codec,
            Err(e) => {
                tracing::warn!("rpc server: {}", e);
                return;
            }
        };
        tracing::debug!(%codec, "rpc server: handshake done");

        let reader = CodecReader::new(reader, codec);
        let (writer, writer_task) =
            spawn_writer_task(Box::new(write_half), codec, CancellationToken::new());

        self.serve_codec(reader, writer, &options).await;

        match writer_task.await {
            Ok(Err(e)) => tracing::debug!("rpc server: writer stopped: {}", e),
            Err(e) => tracing::error!("rpc server: writer task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    async fn serve_codec(&self, mut reader: CodecReader, writer: WriterHandle, options: &Options) {
        let handlers = TaskTracker::new();

        loop {
            let (header, body) = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    if !e.is_disconnect() {
                        tracing::warn!("rpc server: read request error: {}", e);
                    }
                    break;
                }
            };

            let request = match self.resolve(header.clone(), reader.codec_type(), &body) {
                Ok(request) => request,
                Err(e) => {
                    tracing::debug!(
                        service_method = %header.service_method,
                        seq = header.seq,
                        "rpc server: rejected request: {}",
                        e
                    );
                    handlers.spawn(send_error(writer.clone(), header, e.to_string()));
                    continue;
                }
            };

            handlers.spawn(handle_request(writer.clone(), request, options.handle_timeout));
        }

        handlers.close();
        handlers.wait().await;
    }

    fn resolve(&self, header: Header, codec: CodecType, body: &Bytes) -> Result<Request> {
        let (_, method) = self.find_service(&header.service_method)?;
        let args = method.new_args(codec, body)?;
        let reply = method.new_reply();
        Ok(Request {
            header,
            method,
            args,
            reply,
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services = self.inner.services.read();
        f.debug_struct("Server")
            .field("services", &services.keys().collect::<Vec<_>>())
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

async fn read_frame(reader: &mut CodecReader) -> Result<(Header, Bytes)> {
    let header = reader.read_header().await?;
    let body = reader.read_body_raw().await?;
    Ok((header, body))
}

/// Run one request and write exactly one response for it.
///
/// With a handle timeout the method runs as its own task; if the deadline
/// passes first a timeout error is sent and the task's late result is
/// dropped. The method itself is never interrupted.
async fn handle_request(writer: WriterHandle, request: Request, handle_timeout: Duration) {
    let Request {
        header,
        method,
        args,
        reply,
    } = request;

    let invocation = tokio::spawn(method.call(args, reply));
    let outcome = if handle_timeout.is_zero() {
        invocation.await
    } else {
        match tokio::time::timeout(handle_timeout, invocation).await {
            Ok(joined) => joined,
            Err(_) => {
                let err = RpcError::HandleTimeout(handle_timeout);
                tracing::warn!(service_method = %header.service_method, seq = header.seq, "{}", err);
                return send_error(writer, header, err.to_string()).await;
            }
        }
    };

    let reply = match outcome {
        Ok(Ok(reply)) => reply,
        Ok(Err(method_error)) => return send_error(writer, header, method_error).await,
        Err(join_error) => {
            let msg = format!("rpc server: method panicked: {join_error}");
            return send_error(writer, header, msg).await;
        }
    };

    match method.encode_reply(writer.codec_type(), &reply) {
        Ok(body) => send_response(writer.write_encoded(&header, &body), &header).await,
        Err(e) => send_error(writer, header, e.to_string()).await,
    }
}

/// Text sent when a method fails with an empty message; an empty error
/// field would read as success on the client.
const EMPTY_METHOD_ERROR: &str = "rpc server: method returned an empty error";

async fn send_error(writer: WriterHandle, header: Header, error: String) {
    let error = if error.is_empty() {
        EMPTY_METHOD_ERROR.to_string()
    } else {
        error
    };
    let header = header.with_error(error);
    send_response(writer.write(&header, &InvalidRequest {}), &header).await;
}

async fn send_response(queued: Result<WriteReceipt>, header: &Header) {
    let written = match queued {
        Ok(receipt) => receipt.written().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        tracing::error!(
            service_method = %header.service_method,
            seq = header.seq,
            "rpc server: write response error: {}",
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncWriteExt;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    struct Foo;

    fn foo_service() -> Service {
        Service::builder(Foo)
            .method("Sum", |_: &Foo, args: Args, reply: &mut i32| {
                *reply = args.num1 + args.num2;
                Ok::<_, String>(())
            })
            .build()
    }

    #[test]
    fn test_register_duplicate() {
        let server = Server::new();
        server.register(foo_service()).unwrap();
        assert!(matches!(
            server.register(foo_service()),
            Err(RpcError::DuplicateService(ref name)) if name == "Foo"
        ));
        assert_eq!(server.services().len(), 1);
    }

    #[test]
    fn test_register_rejects_dotted_name() {
        let server = Server::new();
        let service = Service::named("a.b", Foo).build();
        assert!(matches!(
            server.register(service),
            Err(RpcError::InvalidServiceName(_))
        ));
    }

    #[test]
    fn test_find_service_failures_are_distinct() {
        let server = Server::new();
        server.register(foo_service()).unwrap();

        let (service, method) = server.find_service("Foo.Sum").unwrap();
        assert_eq!(service.name(), "Foo");
        assert_eq!(method.name(), "Sum");

        assert!(matches!(server.find_service("FooSum"), Err(RpcError::IllFormed(_))));
        assert!(matches!(
            server.find_service("Bar.Sum"),
            Err(RpcError::ServiceNotFound(ref s)) if s == "Bar"
        ));
        assert!(matches!(
            server.find_service("Foo.Mul"),
            Err(RpcError::MethodNotFound(ref m)) if m == "Mul"
        ));
    }

    #[tokio::test]
    async fn test_empty_method_error_is_not_success() {
        let server = Server::new();
        server
            .register(
                Service::builder(Foo)
                    .method("Empty", |_: &Foo, _: (), _: &mut HashMap<String, i32>| Err(""))
                    .build(),
            )
            .unwrap();
        let (client_end, server_end) = tokio::io::duplex(4096);
        tokio::spawn(async move { server.serve_conn(server_end).await });

        let client = crate::Client::new(client_end, Options::default()).await.unwrap();
        let result: Result<HashMap<String, i32>> = client.call("Foo.Empty", &()).await;
        assert!(matches!(result, Err(RpcError::Remote(ref msg)) if msg == EMPTY_METHOD_ERROR));
    }

    #[tokio::test]
    async fn test_in_flight_response_written_after_peer_stops_sending() {
        let server = Server::new();
        server
            .register(
                Service::builder(Foo)
                    .async_method("Slow", |_: Arc<Foo>, ms: u64| async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok::<_, String>(ms)
                    })
                    .build(),
            )
            .unwrap();
        let (client_end, server_end) = tokio::io::duplex(4096);
        let serving = tokio::spawn(async move { server.serve_conn(server_end).await });

        let (read_half, mut write_half) = tokio::io::split(client_end);
        let codec = CodecType::MsgPack;
        crate::protocol::write_options(&mut write_half, &Options::default())
            .await
            .unwrap();
        let header = codec.encode(&Header::request("Foo.Slow", 1)).unwrap();
        let body = codec.encode(&200u64).unwrap();
        let frame = crate::protocol::encode_frame(&header, &body).unwrap();
        write_half.write_all(&frame).await.unwrap();
        write_half.shutdown().await.unwrap();

        let read_half: BoxedReader = Box::new(read_half);
        let mut reader = CodecReader::new(BufReader::new(read_half), codec);
        let header = reader.read_header().await.unwrap();
        assert_eq!(header.seq, 1);
        assert!(!header.is_error(), "{}", header.error);
        assert_eq!(reader.read_body::<u64>().await.unwrap(), 200);

        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("serve_conn returns after draining")
            .unwrap();
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(Server::global(), Server::global()));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let server = Server::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let accept = tokio::spawn({
            let server = server.clone();
            async move { server.accept(listener).await }
        });
        server.shutdown();
        accept.await.unwrap().unwrap();
    }
}
