//! Multi-server client.
//!
//! [`XClient`] asks a [`Discovery`] where to send each call and keeps one
//! [`Client`] per address, redialling any that has become unavailable.
//!
//! # Example
//!
//! ```no_run
//! use rpcwire::xclient::{MultiServerDiscovery, SelectMode, XClient};
//! use rpcwire::Options;
//!
//! # async fn run() -> rpcwire::Result<()> {
//! let discovery = MultiServerDiscovery::new(vec![
//!     "tcp@127.0.0.1:9001".into(),
//!     "tcp@127.0.0.1:9002".into(),
//! ]);
//! let xc = XClient::new(discovery, SelectMode::RoundRobin, Options::default());
//!
//! let sum: i32 = xc.call("Foo.Sum", &(1, 2)).await?;
//! let any: i32 = xc.broadcast("Foo.Sum", &(1, 2)).await?;
//! xc.close().await;
//! # Ok(())
//! # }
//! ```

mod discovery;

use std::collections::HashMap;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::dial::xdial;
use crate::error::{RpcError, Result};
use crate::protocol::Options;

pub use discovery::{Discovery, MultiServerDiscovery, SelectMode};

/// Client over a changing set of servers.
pub struct XClient<D> {
    discovery: D,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Client>>,
}

impl<D: Discovery> XClient<D> {
    /// Create a client; nothing is dialled until the first call.
    pub fn new(discovery: D, mode: SelectMode, options: Options) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The discovery source.
    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Cached client for `rpc_addr`, dialled if missing or unavailable.
    ///
    /// The cache lock is not held while dialling, so a slow server only
    /// delays calls to itself.
    async fn dial(&self, rpc_addr: &str) -> Result<Client> {
        {
            let mut clients = self.clients.lock();
            if let Some(client) = clients.get(rpc_addr) {
                if client.is_available() {
                    return Ok(client.clone());
                }
                tracing::debug!(addr = rpc_addr, "rpc xclient: dropping unavailable client");
                let _ = client.close();
                clients.remove(rpc_addr);
            }
        }

        let client = xdial(rpc_addr, self.options.clone()).await?;

        let mut clients = self.clients.lock();
        match clients.get(rpc_addr) {
            // Another call dialled the same server meanwhile; keep that one.
            Some(existing) if existing.is_available() => {
                let _ = client.close();
                Ok(existing.clone())
            }
            _ => {
                clients.insert(rpc_addr.to_string(), client.clone());
                Ok(client)
            }
        }
    }

    async fn call_addr<A, R>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let client = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Canceled),
            client = self.dial(rpc_addr) => client?,
        };
        client.call_with_cancel(service_method, args, cancel).await
    }

    /// Call one server picked by the select mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.call_with_cancel(service_method, args, &CancellationToken::new())
            .await
    }

    /// [`call`](Self::call), abandoned when `cancel` fires.
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
        let rpc_addr = self.discovery.get(self.mode)?;
        self.call_addr(&rpc_addr, service_method, args, cancel).await
    }

    /// Call every server at once.
    ///
    /// The first failure cancels the calls still running and is returned.
    /// Otherwise one of the replies is returned.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.discovery.get_all()?;
        let cancel = CancellationToken::new();
        let first_error: Mutex<Option<RpcError>> = Mutex::new(None);
        let reply: Mutex<Option<R>> = Mutex::new(None);

        join_all(servers.iter().map(|rpc_addr| {
            let cancel = &cancel;
            let first_error = &first_error;
            let reply = &reply;
            async move {
                match self.call_addr::<A, R>(rpc_addr, service_method, args, cancel).await {
                    Ok(r) => {
                        let mut reply = reply.lock();
                        if reply.is_none() {
                            *reply = Some(r);
                        }
                    }
                    Err(e) => {
                        let mut first_error = first_error.lock();
                        if first_error.is_none() {
                            tracing::debug!(addr = %rpc_addr, "rpc xclient: broadcast failed: {}", e);
                            *first_error = Some(e);
                            cancel.cancel();
                        }
                    }
                }
            }
        }))
        .await;

        if let Some(e) = first_error.into_inner() {
            return Err(e);
        }
        reply.into_inner().ok_or(RpcError::NoServers)
    }

    /// Close every cached client.
    pub async fn close(&self) {
        let clients: Vec<_> = self.clients.lock().drain().collect();
        for (addr, client) in clients {
            if let Err(e) = client.close() {
                tracing::debug!(%addr, "rpc xclient: close: {}", e);
            }
        }
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for XClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XClient")
            .field("discovery", &self.discovery)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    use crate::service::Service;
    use crate::Server;

    struct Foo;

    async fn start_server() -> String {
        let server = Server::new();
        server
            .register(
                Service::builder(Foo)
                    .method("Sum", |_: &Foo, args: (i32, i32), reply: &mut i32| {
                        *reply = args.0 + args.1;
                        Ok::<_, String>(())
                    })
                    .method("Fail", |_: &Foo, _: (), _: &mut i32| Err("always fails"))
                    .build(),
            )
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.accept(listener).await });
        format!("tcp@{addr}")
    }

    /// A listener nobody accepts on: the TCP connect succeeds but the HTTP
    /// upgrade never gets an answer.
    async fn silent_http() -> (String, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (format!("http@{addr}"), listener)
    }

    fn slow_dial_options() -> Options {
        Options::default().with_connect_timeout(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_stalled_dial_does_not_block_other_servers() {
        let good = start_server().await;
        let (silent, _listener) = silent_http().await;
        let discovery = MultiServerDiscovery::new(vec![silent.clone(), good.clone()]);
        let xc = Arc::new(XClient::new(discovery, SelectMode::RoundRobin, slow_dial_options()));

        let stalled = tokio::spawn({
            let xc = Arc::clone(&xc);
            async move {
                xc.call_addr::<_, i32>(&silent, "Foo.Sum", &(1, 2), &CancellationToken::new())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sum: i32 = tokio::time::timeout(
            Duration::from_secs(5),
            xc.call_addr(&good, "Foo.Sum", &(1, 2), &CancellationToken::new()),
        )
        .await
        .expect("call held up by another server's dial")
        .unwrap();
        assert_eq!(sum, 3);
        assert!(!stalled.is_finished());
        stalled.abort();
    }

    #[tokio::test]
    async fn test_broadcast_failure_interrupts_pending_dial() {
        let good = start_server().await;
        let (silent, _listener) = silent_http().await;
        let discovery = MultiServerDiscovery::new(vec![good, silent]);
        let xc = XClient::new(discovery, SelectMode::Random, slow_dial_options());

        let result: Result<i32> = tokio::time::timeout(Duration::from_secs(5), xc.broadcast("Foo.Fail", &()))
            .await
            .expect("broadcast waited for the stalled dial");
        assert!(matches!(result, Err(RpcError::Remote(ref msg)) if msg == "always fails"));
        xc.close().await;
    }
}
