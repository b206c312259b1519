//! Unix domain socket helpers.
//!
//! # Example
//!
//! ```no_run
//! use rpcwire::transport::{bind_unix, generate_socket_path};
//!
//! # async fn run() -> rpcwire::Result<()> {
//! let path = generate_socket_path();
//! let (listener, _cleanup) = bind_unix(&path)?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use rand::Rng;
use tokio::net::UnixListener;

use crate::error::Result;

/// Generate a unique socket path for this process.
///
/// Format: `{tmp}/rpcwire-{pid}-{random}.sock`
pub fn generate_socket_path() -> PathBuf {
    let pid = std::process::id();
    let suffix: u64 = rand::rng().random();
    std::env::temp_dir().join(format!("rpcwire-{pid}-{suffix:x}.sock"))
}

/// Cleanup guard that removes the socket file on drop.
#[derive(Debug)]
pub struct SocketCleanup {
    path: PathBuf,
}

impl SocketCleanup {
    /// Path removed on drop.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Bind a Unix listener, replacing a stale socket file at `path`.
///
/// Must be called inside a tokio runtime.
pub fn bind_unix(path: impl AsRef<Path>) -> Result<(UnixListener, SocketCleanup)> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    Ok((
        listener,
        SocketCleanup {
            path: path.to_path_buf(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_unique() {
        let a = generate_socket_path();
        let b = generate_socket_path();
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("rpcwire-"));
        assert!(name.ends_with(".sock"));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_file_and_cleans_up() {
        let path = generate_socket_path();
        std::fs::write(&path, b"stale").unwrap();

        let (listener, cleanup) = bind_unix(&path).unwrap();
        assert_eq!(cleanup.path(), path.as_path());
        drop(listener);
        drop(cleanup);
        assert!(!path.exists());
    }
}
