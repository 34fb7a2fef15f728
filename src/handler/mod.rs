//! Handler module - message dispatch.
//!
//! Provides:
//! - [`Callable`] - call a plain function with a decoded argument tuple
//! - [`handle_message`] / [`handle_sync_message`] - decode, call, encode reply
//! - [`MessageRegistry`] - maps `(receiver, name, destination)` to handlers
//!
//! Handlers are synchronous functions. They run on the channel's receive
//! worker one at a time, in arrival order. A handler that needs to wait on
//! something should spawn a task and reply through its own message.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::handler::MessageRegistry;
//! use procwire_ipc::message::{Message, SyncMessage};
//!
//! struct Add;
//!
//! impl Message for Add {
//!     const RECEIVER: &'static str = "Calculator";
//!     const NAME: &'static str = "Add";
//!     type Arguments = (i64, i64);
//! }
//!
//! impl SyncMessage for Add {
//!     type Reply = (i64,);
//! }
//!
//! let mut registry = MessageRegistry::new();
//! registry.register_sync::<Add, _>(|a: i64, b: i64| (a + b,));
//! assert!(registry.contains::<Add>());
//! ```

mod callable;
mod dispatch;
mod registry;

pub use callable::Callable;
pub use dispatch::{handle_message, handle_sync_message};
pub use registry::{Handler, MessageRegistry, TypedHandler, TypedSyncHandler};

