//! HTTP CONNECT bridge.
//!
//! Lets the protocol pass through HTTP-aware intermediaries. The client sends
//! one `CONNECT` request; the server answers `200 Connected to rpcwire` and
//! from then on the upgraded stream carries the normal handshake and frames.
//!
//! Both halves speak HTTP/1 through hyper and hand back the upgraded
//! connection, which still holds any bytes read past the response head.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::error::{RpcError, Result};

/// Request path the server tunnels.
pub const DEFAULT_RPC_PATH: &str = "/_rpcwire_";

/// Status (code and reason) of a successful upgrade.
pub const CONNECTED_STATUS: &str = "200 Connected to rpcwire";

/// An upgraded connection, ready for the RPC handshake.
pub type Tunnel = TokioIo<Upgraded>;

/// Client half: request the upgrade and check the status.
pub async fn connect_tunnel<S>(stream: S, path: &str) -> Result<Tunnel>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(http_error)?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!("rpc client: http connection error: {}", e);
        }
    });

    let request = Request::connect(path)
        .body(Empty::<Bytes>::new())
        .map_err(|e| RpcError::HttpConnect(e.to_string()))?;
    let response = sender.send_request(request).await.map_err(http_error)?;

    if response.status() != StatusCode::OK {
        return Err(RpcError::HttpConnect(status_line(&response)));
    }
    let upgraded = hyper::upgrade::on(response).await.map_err(http_error)?;
    Ok(TokioIo::new(upgraded))
}

/// Server half: answer one request on `path`.
///
/// Returns `None` when the request was refused (a non-`CONNECT` method gets
/// `405`, any other path `404`); the refusal has already been written.
pub async fn accept_tunnel<S>(stream: S, path: &str) -> Result<Option<Tunnel>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (tx, rx) = oneshot::channel::<OnUpgrade>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let path: Arc<str> = Arc::from(path);

    let service = service_fn(move |mut req: Request<Incoming>| {
        let tx = Arc::clone(&tx);
        let path = Arc::clone(&path);
        async move {
            if req.method() != Method::CONNECT {
                tracing::debug!(method = %req.method(), "rpc server: http request refused, must CONNECT");
                return Ok::<_, Infallible>(refuse(StatusCode::METHOD_NOT_ALLOWED, "405 must CONNECT\n"));
            }
            if req.uri().path() != &*path {
                tracing::debug!(uri = %req.uri(), "rpc server: http request refused, unknown path");
                return Ok(refuse(StatusCode::NOT_FOUND, "404 page not found\n"));
            }
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(hyper::upgrade::on(&mut req));
            }
            Ok(connected())
        }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .map_err(http_error)?;

    match rx.await {
        Ok(on_upgrade) => {
            let upgraded = on_upgrade.await.map_err(http_error)?;
            Ok(Some(TokioIo::new(upgraded)))
        }
        Err(_) => Ok(None),
    }
}

fn connected() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    let reason = CONNECTED_STATUS.trim_start_matches("200 ");
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(reason.as_bytes()));
    response
}

fn refuse(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("close"));
    response
}

fn status_line<B>(response: &Response<B>) -> String {
    let status = response.status();
    let reason = response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned())
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_default();
    format!("{} {}", status.as_u16(), reason)
}

fn http_error(e: hyper::Error) -> RpcError {
    RpcError::HttpConnect(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tunnel_carries_bytes_both_ways() {
        let (client, server) = duplex(4096);
        let server = tokio::spawn(async move { accept_tunnel(server, DEFAULT_RPC_PATH).await });

        let mut client = connect_tunnel(client, DEFAULT_RPC_PATH).await.unwrap();
        let mut server = server.await.unwrap().unwrap().expect("tunnel accepted");

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_non_connect_gets_405() {
        let (mut client, server) = duplex(4096);
        let server = tokio::spawn(async move { accept_tunnel(server, DEFAULT_RPC_PATH).await });

        client
            .write_all(b"GET /_rpcwire_ HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert!(server.await.unwrap().unwrap().is_none());

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 405"), "{response}");
        assert!(response.ends_with("405 must CONNECT\n"), "{response}");
    }

    #[tokio::test]
    async fn test_wrong_path_gets_404() {
        let (client, server) = duplex(4096);
        let server = tokio::spawn(async move { accept_tunnel(server, DEFAULT_RPC_PATH).await });

        let err = connect_tunnel(client, "/elsewhere").await.unwrap_err();
        assert!(matches!(err, RpcError::HttpConnect(ref line) if line.starts_with("404")));
        assert!(server.await.unwrap().unwrap().is_none());
    }

    #[test]
    fn test_connected_reason_phrase() {
        let response = connected();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(status_line(&response), CONNECTED_STATUS);
    }
}
