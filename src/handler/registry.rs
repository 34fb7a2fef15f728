//! Handler registry for dispatching messages by receiver and message name.
//!
//! The registry maps `(receiver, name)` to handlers. A handler can be bound
//! for every destination id or for one destination id; a destination-specific
//! entry wins over the catch-all one.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::handler::MessageRegistry;
//! use procwire_ipc::message::{IncomingMessage, Message, OutgoingMessage};
//!
//! struct SetTitle;
//!
//! impl Message for SetTitle {
//!     const RECEIVER: &'static str = "WebPageProxy";
//!     const NAME: &'static str = "SetTitle";
//!     type Arguments = (String,);
//! }
//!
//! let mut registry = MessageRegistry::new();
//! registry.register::<SetTitle, _>(|title: String| println!("title: {}", title));
//!
//! let mut outgoing = OutgoingMessage::for_message::<SetTitle>(0);
//! outgoing.encode(("Example",));
//! let mut incoming = IncomingMessage::from_envelope(outgoing.into_envelope()).unwrap();
//! assert!(registry.dispatch(&mut incoming).unwrap().is_none());
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;

use super::dispatch::{handle_message, handle_sync_message, invalid_message};
use super::Callable;
use crate::error::Result;
use crate::message::{IncomingMessage, Message, OutgoingMessage, SyncMessage};

/// Trait for type-erased message handlers.
pub trait Handler: Send + Sync + 'static {
    /// Whether the handler produces a reply (and expects a sync request id).
    fn expects_reply(&self) -> bool;

    /// Decode the arguments from `message` and run the handler.
    fn call(&self, message: &mut IncomingMessage) -> Result<Option<OutgoingMessage>>;
}

/// Wrapper that decodes `M::Arguments` before calling a one-way handler.
pub struct TypedHandler<M, F> {
    handler: F,
    _phantom: PhantomData<fn() -> M>,
}

impl<M, F> TypedHandler<M, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<M, F> Handler for TypedHandler<M, F>
where
    M: Message + 'static,
    F: Callable<M::Arguments, Output = ()>,
{
    fn expects_reply(&self) -> bool {
        false
    }

    fn call(&self, message: &mut IncomingMessage) -> Result<Option<OutgoingMessage>> {
        handle_message::<M, F>(message, &self.handler)?;
        Ok(None)
    }
}

/// Wrapper that decodes the sync id and `M::Arguments`, then encodes the
/// handler's return value as the reply.
pub struct TypedSyncHandler<M, F> {
    handler: F,
    _phantom: PhantomData<fn() -> M>,
}

impl<M, F> TypedSyncHandler<M, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<M, F> Handler for TypedSyncHandler<M, F>
where
    M: SyncMessage + 'static,
    F: Callable<M::Arguments, Output = M::Reply>,
{
    fn expects_reply(&self) -> bool {
        true
    }

    fn call(&self, message: &mut IncomingMessage) -> Result<Option<OutgoingMessage>> {
        let sync_id = message
            .decode::<u64>()
            .ok_or_else(|| invalid_message(message))?;
        handle_sync_message::<M, F>(message, sync_id, &self.handler).map(Some)
    }
}

/// Handlers for one `(receiver, name)` pair.
#[derive(Default)]
struct Route {
    any: Option<Box<dyn Handler>>,
    by_destination: HashMap<u64, Box<dyn Handler>>,
}

/// Registry mapping message names to handlers.
#[derive(Default)]
pub struct MessageRegistry {
    receivers: HashMap<&'static str, HashMap<&'static str, Route>>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn route_mut(&mut self, receiver: &'static str, name: &'static str) -> &mut Route {
        self.receivers
            .entry(receiver)
            .or_default()
            .entry(name)
            .or_default()
    }

    /// Bind `handler` for `M` on any destination.
    ///
    /// A later registration for the same message replaces the earlier one.
    pub fn register<M, F>(&mut self, handler: F)
    where
        M: Message + 'static,
        F: Callable<M::Arguments, Output = ()>,
    {
        self.route_mut(M::RECEIVER, M::NAME).any = Some(Box::new(TypedHandler::<M, F>::new(handler)));
    }

    /// Bind `handler` for `M` on one destination id.
    pub fn register_for<M, F>(&mut self, destination_id: u64, handler: F)
    where
        M: Message + 'static,
        F: Callable<M::Arguments, Output = ()>,
    {
        self.route_mut(M::RECEIVER, M::NAME)
            .by_destination
            .insert(destination_id, Box::new(TypedHandler::<M, F>::new(handler)));
    }

    /// Bind a reply-producing `handler` for `M` on any destination.
    pub fn register_sync<M, F>(&mut self, handler: F)
    where
        M: SyncMessage + 'static,
        F: Callable<M::Arguments, Output = M::Reply>,
    {
        self.route_mut(M::RECEIVER, M::NAME).any =
            Some(Box::new(TypedSyncHandler::<M, F>::new(handler)));
    }

    /// Bind a reply-producing `handler` for `M` on one destination id.
    pub fn register_sync_for<M, F>(&mut self, destination_id: u64, handler: F)
    where
        M: SyncMessage + 'static,
        F: Callable<M::Arguments, Output = M::Reply>,
    {
        self.route_mut(M::RECEIVER, M::NAME)
            .by_destination
            .insert(destination_id, Box::new(TypedSyncHandler::<M, F>::new(handler)));
    }

    /// Find the handler for a routing triple.
    pub fn lookup(&self, receiver: &[u8], name: &[u8], destination_id: u64) -> Option<&dyn Handler> {
        let receiver = std::str::from_utf8(receiver).ok()?;
        let name = std::str::from_utf8(name).ok()?;
        let route = self.receivers.get(receiver)?.get(name)?;
        route
            .by_destination
            .get(&destination_id)
            .or(route.any.as_ref())
            .map(|handler| handler.as_ref())
    }

    /// Whether anything is registered for `M`.
    pub fn contains<M: Message>(&self) -> bool {
        self.receivers
            .get(M::RECEIVER)
            .is_some_and(|names| names.contains_key(M::NAME))
    }

    /// Route `message` to its handler.
    ///
    /// Returns the reply for a sync message. A message with no handler, or
    /// whose sync flag disagrees with the handler kind, is an invalid message.
    pub fn dispatch(&self, message: &mut IncomingMessage) -> Result<Option<OutgoingMessage>> {
        let handler = self
            .lookup(
                message.receiver_name(),
                message.message_name(),
                message.destination_id(),
            )
            .ok_or_else(|| invalid_message(message))?;

        if handler.expects_reply() != message.is_sync() {
            return Err(invalid_message(message));
        }
        handler.call(message)
    }

    /// Number of registered `(receiver, name)` pairs.
    pub fn len(&self) -> usize {
        self.receivers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("messages", &self.len())
            .finish()
    }
}
