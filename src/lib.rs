//! # procwire-ipc
//!
//! Typed message channels between cooperating processes.
//!
//! A [`Channel`] connects two peers over one of three backends: a port space
//! with capability rights, a Unix socket that passes descriptors, or a plain
//! byte stream. Messages are addressed by receiver and message name, carry a
//! statically typed argument tuple, and may carry live OS resources (port
//! rights, descriptors, shared memory) beside the bytes.
//!
//! ## Architecture
//!
//! - **Codec**: aligned binary encoding of primitives, strings and tuples,
//!   with an attachment stack for resources
//! - **Message**: routing header (flags, receiver, name, destination id)
//! - **Handler**: typed dispatch from a decoded message to a plain function
//! - **Backend**: the transport under a channel, chosen at runtime
//! - **Channel**: writer task, receive worker, sync calls and lifecycle
//!
//! ## Example
//!
//! ```
//! use procwire_ipc::backend::SocketBackend;
//! use procwire_ipc::message::Message;
//! use procwire_ipc::{ChannelBuilder, Role};
//!
//! struct Log;
//!
//! impl Message for Log {
//!     const RECEIVER: &'static str = "Console";
//!     const NAME: &'static str = "Log";
//!     type Arguments = (String,);
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> procwire_ipc::Result<()> {
//! let (a, b) = SocketBackend::pair()?;
//! let _server = ChannelBuilder::new()
//!     .handle::<Log, _>(|line: String| println!("peer: {}", line))
//!     .open(a, Role::Server)?;
//! let client = ChannelBuilder::new().open(b, Role::Client)?;
//!
//! client.send_message::<Log>(0, ("hello".to_string(),))?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("procwire-ipc needs Unix descriptors and memory mapping");

pub mod attachment;
pub mod backend;
pub mod channel;
pub mod codec;
pub mod error;
pub mod handler;
pub mod message;
pub mod port;
pub mod protocol;
pub mod shared_memory;
pub mod transport;

pub use attachment::Attachment;
pub use channel::{Channel, ChannelBuilder, ChannelClient, ChannelConfig, ChannelSender, ChannelState, Role};
pub use error::{IpcError, Result};
pub use message::{IncomingMessage, Message, OutgoingMessage, SyncMessage};
