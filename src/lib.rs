//! # rpcwire
//!
//! Request/response RPC between Rust processes over TCP, Unix domain sockets
//! or an HTTP `CONNECT` tunnel.
//!
//! A server publishes [`Service`](service::Service)s whose methods are
//! addressed as `Service.Method`. A [`Client`] multiplexes any number of
//! concurrent calls over one connection and matches responses to calls by
//! sequence number.
//!
//! ## Wire protocol
//!
//! - **Handshake**: one length-prefixed JSON [`Options`] frame carrying the
//!   magic number, the codec identifier and the timeouts.
//! - **Frames**: a length-prefixed header then a length-prefixed body, both
//!   in the negotiated codec (MessagePack by default, or JSON).
//!
//! ## Example
//!
//! ```no_run
//! use rpcwire::service::Service;
//! use rpcwire::{dial, Options, Server};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i32,
//!     num2: i32,
//! }
//!
//! struct Foo;
//!
//! #[tokio::main]
//! async fn main() -> rpcwire::Result<()> {
//!     let server = Server::new();
//!     server.register(
//!         Service::builder(Foo)
//!             .method("Sum", |_: &Foo, args: Args, reply: &mut i32| {
//!                 *reply = args.num1 + args.num2;
//!                 Ok::<_, String>(())
//!             })
//!             .build(),
//!     )?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?.to_string();
//!     tokio::spawn(async move { server.accept(listener).await });
//!
//!     let client = dial(&addr, Options::default()).await?;
//!     let sum: i32 = client.call("Foo.Sum", &Args { num1: 1, num2: 2 }).await?;
//!     assert_eq!(sum, 3);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod xclient;

mod client;
mod dial;
mod server;
mod writer;

pub use client::{Call, Client};
#[cfg(unix)]
pub use dial::dial_unix;
pub use dial::{dial, dial_http, xdial};
pub use error::{Result, RpcError};
pub use protocol::Options;
pub use server::Server;
