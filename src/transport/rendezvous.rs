//! Unix socket rendezvous.
//!
//! A server binds a listener at a filesystem path and hands every accepted
//! connection to a [`SocketBackend`]; a client connects to the same path with
//! [`SocketBackend::connect`]. The socket file is removed when the listener
//! is dropped.
//!
//! # Example
//!
//! ```ignore
//! use procwire_ipc::transport::{generate_socket_path, SocketListener};
//!
//! let path = generate_socket_path();
//! let listener = SocketListener::bind(&path)?;
//! let backend = listener.accept().await?;
//! ```

use std::path::{Path, PathBuf};

use tokio::net::UnixListener;

use crate::backend::SocketBackend;
use crate::error::Result;

/// Generate a unique socket path for this process.
///
/// Format: `{tmp}/procwire-{pid}-{random}.sock`
pub fn generate_socket_path() -> PathBuf {
    let pid = std::process::id();
    std::env::temp_dir().join(format!("procwire-{}-{:x}.sock", pid, rand_u64()))
}

/// Simple random u64 using system time and process ID.
pub(crate) fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    // Mix in process ID and a counter so back-to-back calls differ
    let pid = std::process::id() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ count.rotate_left(32)
}

/// Listening Unix socket at a rendezvous path.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind to a Unix socket path.
    ///
    /// Removes any existing socket file at the path before binding.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!("Listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept one connection as a channel backend.
    pub async fn accept(&self) -> Result<SocketBackend> {
        let (stream, _addr) = self.listener.accept().await?;
        tracing::debug!("Accepted connection on {}", self.path.display());
        Ok(SocketBackend::new(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        // Clean up socket file when listener is dropped
        let _ = std::fs::remove_file(&self.path);
    }
}
