//! Transport module - rendezvous for the socket backend.
//!
//! Provides:
//! - Unique socket paths
//! - A listener that accepts connections as [`SocketBackend`](crate::backend::SocketBackend)s

mod rendezvous;

pub use rendezvous::{generate_socket_path, SocketListener};

#[cfg(not(target_os = "linux"))]
pub(crate) use rendezvous::rand_u64;
