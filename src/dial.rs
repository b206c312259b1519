//! Connecting clients.
//!
//! Connecting and the handshake run together as one task raced against
//! [`Options::connect_timeout`]. If the deadline passes first, or the caller
//! stops waiting, the task is aborted, which drops whatever part of the
//! connection it had built. A zero timeout waits forever.

use std::future::Future;

use tokio::net::TcpStream;
use tokio_util::task::AbortOnDropHandle;

use crate::client::Client;
use crate::error::{RpcError, Result};
use crate::protocol::Options;
use crate::transport::http::{connect_tunnel, DEFAULT_RPC_PATH};
use crate::transport::Address;

/// Connect over TCP and handshake.
pub async fn dial(addr: &str, options: Options) -> Result<Client> {
    let addr = addr.to_string();
    dial_timeout(options, move |options| async move {
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        Client::new(stream, options).await
    })
    .await
}

/// Connect over a Unix domain socket and handshake.
#[cfg(unix)]
pub async fn dial_unix(path: impl AsRef<std::path::Path>, options: Options) -> Result<Client> {
    let path = path.as_ref().to_path_buf();
    dial_timeout(options, move |options| async move {
        let stream = tokio::net::UnixStream::connect(&path).await?;
        Client::new(stream, options).await
    })
    .await
}

/// Connect over TCP, upgrade with HTTP `CONNECT`, then handshake.
pub async fn dial_http(addr: &str, options: Options) -> Result<Client> {
    let addr = addr.to_string();
    dial_timeout(options, move |options| async move {
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        let stream = connect_tunnel(stream, DEFAULT_RPC_PATH).await?;
        Client::new(stream, options).await
    })
    .await
}

/// Connect to a `protocol@addr` address.
///
/// ```no_run
/// # async fn run() -> rpcwire::Result<()> {
/// let options = rpcwire::Options::default();
/// let tcp = rpcwire::xdial("tcp@127.0.0.1:9999", options.clone()).await?;
/// let http = rpcwire::xdial("http@127.0.0.1:9998", options.clone()).await?;
/// let unix = rpcwire::xdial("unix@/tmp/rpcwire.sock", options).await?;
/// # Ok(())
/// # }
/// ```
pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Client> {
    match rpc_addr.parse::<Address>()? {
        Address::Tcp(addr) => dial(&addr, options).await,
        Address::Http(addr) => dial_http(&addr, options).await,
        #[cfg(unix)]
        Address::Unix(path) => dial_unix(path, options).await,
        #[cfg(not(unix))]
        Address::Unix(_) => Err(RpcError::InvalidAddress(rpc_addr.to_string())),
    }
}

async fn dial_timeout<F, Fut>(options: Options, connect: F) -> Result<Client>
where
    F: FnOnce(Options) -> Fut,
    Fut: Future<Output = Result<Client>> + Send + 'static,
{
    let timeout = options.connect_timeout;
    let mut task = AbortOnDropHandle::new(tokio::spawn(connect(options)));

    if timeout.is_zero() {
        return task.await.map_err(join_error)?;
    }
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => joined.map_err(join_error)?,
        Err(_) => {
            tracing::debug!(?timeout, "rpc client: connect timed out");
            Err(RpcError::ConnectTimeout(timeout))
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> RpcError {
    std::io::Error::other(format!("rpc client: connect task failed: {e}")).into()
}
