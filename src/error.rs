//! Error types for rpcwire.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all rpcwire operations.
///
/// `Clone` so that a single terminal error can be handed to every pending
/// call when a client connection goes down.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Serialization of a header or body failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Deserialization of a header or body failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Protocol error (oversized part, out-of-order read, bad handshake frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer's handshake carried the wrong magic number.
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    /// The handshake named a codec that is not registered.
    #[error("invalid codec type {0}")]
    UnknownCodec(String),

    /// `service_method` has no `.` separator.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormed(String),

    /// No service registered under this name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    /// The service exists but has no such method.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    /// A service with this name is already registered.
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    /// Service name is empty or contains a `.`.
    #[error("rpc: invalid service name {0:?}")]
    InvalidServiceName(String),

    /// Error string reported by the server in a response header.
    #[error("{0}")]
    Remote(String),

    /// Server gave up waiting on a method.
    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    /// Connection plus handshake did not finish in time.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// The caller cancelled a synchronous call.
    #[error("rpc client: call failed: context canceled")]
    Canceled,

    /// A synchronous call exceeded its deadline.
    #[error("rpc client: call failed: deadline exceeded after {0:?}")]
    CallTimeout(Duration),

    /// The client has been closed or its connection has failed.
    #[error("connection is shut down")]
    Shutdown,

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The HTTP CONNECT handshake was refused or malformed.
    #[error("unexpected HTTP response: {0}")]
    HttpConnect(String),

    /// The discovery source has no servers.
    #[error("rpc discovery: no available servers")]
    NoServers,

    /// Address is not of the form `protocol@addr`.
    #[error("rpc client: wrong format '{0}', expect protocol@addr")]
    InvalidAddress(String),
}

impl RpcError {
    /// True when the error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RpcError::ConnectionClosed => true,
            RpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::Io(Arc::new(e))
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RpcError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RpcError::Decode(e.to_string())
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
