//! Transport module - addresses and connection bridges.
//!
//! Provides:
//! - [`Address`] - the `protocol@addr` form accepted by [`xdial`](crate::dial::xdial)
//! - [`http`] - HTTP CONNECT tunnel on both ends
//! - Unix domain socket helpers (Unix only)

pub mod http;
#[cfg(unix)]
mod unix;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{RpcError, Result};

#[cfg(unix)]
pub use unix::{bind_unix, generate_socket_path, SocketCleanup};

/// Where a server listens, as `protocol@addr`.
///
/// ```
/// use rpcwire::transport::Address;
///
/// let addr: Address = "http@127.0.0.1:9999".parse().unwrap();
/// assert_eq!(addr, Address::Http("127.0.0.1:9999".into()));
/// assert_eq!(addr.to_string(), "http@127.0.0.1:9999");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Plain TCP, `tcp@host:port`.
    Tcp(String),
    /// Unix domain socket, `unix@/path/to.sock`.
    Unix(PathBuf),
    /// TCP with an HTTP CONNECT upgrade, `http@host:port`.
    Http(String),
}

impl FromStr for Address {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let (protocol, addr) = s
            .split_once('@')
            .filter(|(_, addr)| !addr.is_empty())
            .ok_or_else(|| RpcError::InvalidAddress(s.to_string()))?;
        match protocol {
            "tcp" => Ok(Address::Tcp(addr.to_string())),
            "unix" => Ok(Address::Unix(PathBuf::from(addr))),
            "http" => Ok(Address::Http(addr.to_string())),
            _ => Err(RpcError::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "tcp@{addr}"),
            Address::Unix(path) => write!(f, "unix@{}", path.display()),
            Address::Http(addr) => write!(f, "http@{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_protocol() {
        assert_eq!(
            "tcp@localhost:1234".parse::<Address>().unwrap(),
            Address::Tcp("localhost:1234".into())
        );
        assert_eq!(
            "unix@/tmp/rpc.sock".parse::<Address>().unwrap(),
            Address::Unix("/tmp/rpc.sock".into())
        );
        assert_eq!(
            "http@[::1]:80".parse::<Address>().unwrap(),
            Address::Http("[::1]:80".into())
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["localhost:1234", "tcp@", "udp@localhost:1", "@x"] {
            assert!(
                matches!(bad.parse::<Address>(), Err(RpcError::InvalidAddress(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_display_matches_input() {
        for s in ["tcp@127.0.0.1:1", "unix@/tmp/a.sock", "http@example.com:80"] {
            assert_eq!(s.parse::<Address>().unwrap().to_string(), s);
        }
    }
}
