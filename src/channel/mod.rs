//! Channel - a bidirectional, typed message connection to one peer.
//!
//! The [`ChannelBuilder`] collects handlers and limits, then opens a channel
//! over any [`ChannelBackend`]. A running [`Channel`]:
//! 1. Sends through a dedicated writer task, in queue order
//! 2. Receives on a worker task that dispatches to handlers one at a time
//! 3. Intercepts the `IPC` control messages (handshake, exception port, sync
//!    replies) before they reach user handlers
//! 4. Matches sync replies to waiting callers by request id
//!
//! Lifecycle: `Uninitialized → (Handshaking) → Connected → Invalidated`. The
//! client side passes through `Handshaking` while it sends its receive
//! capability; the server side is connected as soon as it opens. Losing the
//! peer, receiving an undecodable message, or an explicit
//! [`invalidate`](Channel::invalidate) all end in `Invalidated`, which is
//! terminal.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::backend::SocketBackend;
//! use procwire_ipc::channel::{ChannelBuilder, Role};
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
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> procwire_ipc::Result<()> {
//! let (server_end, client_end) = SocketBackend::pair()?;
//!
//! let _server = ChannelBuilder::new()
//!     .handle_sync::<Add, _>(|a: i64, b: i64| (a + b,))
//!     .open(server_end, Role::Server)?;
//! let client = ChannelBuilder::new().open(client_end, Role::Client)?;
//!
//! let (sum,) = client.send_sync::<Add>(0, (2, 3)).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

mod config;
mod pending;
mod writer;

pub use config::ChannelConfig;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::attachment::Attachment;
use crate::backend::{BackendKind, BackendReceiver, ChannelBackend, Envelope, Limits};
use crate::error::{IpcError, Result};
use crate::handler::{Callable, MessageRegistry};
use crate::message::{
    flags, IncomingMessage, Message, OutgoingMessage, SyncMessage, INITIALIZE_CONNECTION,
    IPC_RECEIVER, SET_EXCEPTION_PORT, SYNC_MESSAGE_REPLY,
};
use crate::port::PortRight;
use pending::PendingReplies;
use writer::{spawn_writer_task, WriterHandle};

/// Which end of the connection this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Handed an already-open transport; connected immediately.
    Server,
    /// Must send its receive capability before the channel is usable.
    Client,
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Uninitialized = 0,
    Handshaking = 1,
    Connected = 2,
    Invalidated = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Uninitialized,
            1 => ChannelState::Handshaking,
            2 => ChannelState::Connected,
            _ => ChannelState::Invalidated,
        }
    }
}

/// Callbacks a channel owner receives.
///
/// Both are invoked from the channel's worker task.
pub trait ChannelClient: Send + Sync + 'static {
    /// The peer went away. Called at most once, and never after a local
    /// [`Channel::invalidate`].
    fn did_close(&self) {}

    /// A message could not be routed or decoded. The channel is invalidated
    /// right after this returns.
    fn did_receive_invalid_message(&self, _receiver: &str, _message: &str) {}
}

/// Builder for configuring and opening a [`Channel`].
pub struct ChannelBuilder {
    registry: MessageRegistry,
    client: Option<Arc<dyn ChannelClient>>,
    config: ChannelConfig,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self {
            registry: MessageRegistry::new(),
            client: None,
            config: ChannelConfig::default(),
        }
    }

    /// Register a one-way handler for `M` on any destination.
    pub fn handle<M, F>(mut self, handler: F) -> Self
    where
        M: Message + 'static,
        F: Callable<M::Arguments, Output = ()>,
    {
        self.registry.register::<M, F>(handler);
        self
    }

    /// Register a one-way handler for `M` on one destination id.
    pub fn handle_for<M, F>(mut self, destination_id: u64, handler: F) -> Self
    where
        M: Message + 'static,
        F: Callable<M::Arguments, Output = ()>,
    {
        self.registry.register_for::<M, F>(destination_id, handler);
        self
    }

    /// Register a reply-producing handler for `M` on any destination.
    pub fn handle_sync<M, F>(mut self, handler: F) -> Self
    where
        M: SyncMessage + 'static,
        F: Callable<M::Arguments, Output = M::Reply>,
    {
        self.registry.register_sync::<M, F>(handler);
        self
    }

    /// Register a reply-producing handler for `M` on one destination id.
    pub fn handle_sync_for<M, F>(mut self, destination_id: u64, handler: F) -> Self
    where
        M: SyncMessage + 'static,
        F: Callable<M::Arguments, Output = M::Reply>,
    {
        self.registry.register_sync_for::<M, F>(destination_id, handler);
        self
    }

    /// Receive lifecycle callbacks.
    pub fn client(mut self, client: Arc<dyn ChannelClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Replace all limits at once.
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Largest body accepted in either direction.
    /// Default: 64 MiB
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Bodies above this many bytes travel out of line where possible.
    /// Default: 4096
    pub fn inline_threshold(mut self, threshold: usize) -> Self {
        self.config.inline_threshold = threshold;
        self
    }

    /// Most attachments per message.
    /// Default: 64
    pub fn max_attachments(mut self, count: u32) -> Self {
        self.config.max_attachments = count;
        self
    }

    /// Give up on a sync reply after `timeout`.
    /// Default: wait forever
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Open the channel over `backend`.
    ///
    /// Must be called from within a Tokio runtime; the channel's tasks run
    /// on it.
    pub fn open<B: ChannelBackend>(self, backend: B, role: Role) -> Result<Channel> {
        self.open_boxed(Box::new(backend), role)
    }

    /// Open the channel over a backend chosen at runtime.
    pub fn open_boxed(self, mut backend: Box<dyn ChannelBackend>, role: Role) -> Result<Channel> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            IpcError::Unsupported("a channel must be opened inside a Tokio runtime".into())
        })?;

        backend.configure(&self.config);
        let backend_kind = backend.kind();
        let handshake = match role {
            Role::Client => Some(backend.handshake_attachment()?),
            Role::Server => None,
        };

        let (receiver, sender) = backend.into_split();
        let (writer, writer_task) = spawn_writer_task(sender);

        let inner = Arc::new(Inner {
            role,
            backend_kind,
            limits: Limits::from(&self.config),
            sync_timeout: self.config.sync_timeout(),
            state: AtomicU8::new(ChannelState::Uninitialized as u8),
            writer,
            pending: Mutex::new(PendingReplies::new()),
            next_sync_id: AtomicU64::new(1),
            failed_sends: AtomicU64::new(0),
            client: self.client,
            shutdown: Notify::new(),
            closed: Notify::new(),
            exception_port: Mutex::new(None),
            handshake_seen: AtomicBool::new(false),
            runtime: runtime.clone(),
        });

        if let Some(attachment) = handshake {
            inner.set_state(ChannelState::Handshaking);
            let mut message = OutgoingMessage::new(IPC_RECEIVER, INITIALIZE_CONNECTION, 0);
            match attachment {
                Some(attachment) => {
                    message.encode(true);
                    message.encode(attachment);
                }
                None => message.encode(false),
            }
            // First in the writer queue, ahead of anything the caller sends
            inner.writer.send(message.into_envelope())?;
        }
        inner.set_state(ChannelState::Connected);
        tracing::debug!(role = ?role, backend = ?backend_kind, "channel connected");

        runtime.spawn(watch_writer(inner.clone(), writer_task));
        let worker = runtime.spawn(receive_loop(inner.clone(), receiver, self.registry));

        Ok(Channel {
            sender: ChannelSender { inner },
            _worker: worker,
        })
    }
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the channel, its senders and its tasks.
struct Inner {
    role: Role,
    backend_kind: BackendKind,
    limits: Limits,
    sync_timeout: Option<Duration>,
    state: AtomicU8,
    writer: WriterHandle,
    pending: Mutex<PendingReplies>,
    next_sync_id: AtomicU64,
    /// Sends attempted after invalidation.
    failed_sends: AtomicU64,
    client: Option<Arc<dyn ChannelClient>>,
    /// Stops the receive worker.
    shutdown: Notify,
    /// Wakes `wait_closed` callers.
    closed: Notify,
    exception_port: Mutex<Option<PortRight>>,
    /// Server side: the client's handshake has arrived.
    handshake_seen: AtomicBool,
    runtime: Handle,
}

impl Inner {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn enqueue(&self, message: OutgoingMessage) -> Result<()> {
        if self.state() == ChannelState::Invalidated {
            self.failed_sends.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                receiver = message.receiver_name(),
                message = message.message_name(),
                "dropping send on invalid channel"
            );
            return Err(IpcError::ChannelInvalid);
        }

        let envelope = message.into_envelope();
        self.check(&envelope)?;
        self.writer.send(envelope)
    }

    fn check(&self, envelope: &Envelope) -> Result<()> {
        self.limits.check(envelope)?;
        if let Some(attachment) = envelope
            .attachments
            .iter()
            .find(|a| !self.backend_kind.carries(a.kind()))
        {
            return Err(IpcError::Unsupported(format!(
                "{:?} backend cannot carry {:?} attachments",
                self.backend_kind,
                attachment.kind()
            )));
        }
        Ok(())
    }

    async fn send_sync<M: SyncMessage>(
        &self,
        destination_id: u64,
        arguments: M::Arguments,
    ) -> Result<M::Reply> {
        if self.state() == ChannelState::Invalidated {
            self.failed_sends.fetch_add(1, Ordering::Relaxed);
            return Err(IpcError::ChannelInvalid);
        }

        // Register before sending so the reply can never arrive unclaimed
        let sync_id = self.next_sync_id.fetch_add(1, Ordering::Relaxed);
        let reply_rx = self.pending.lock().register(sync_id)?;

        let mut message = OutgoingMessage::for_message::<M>(destination_id);
        message.set_flag(flags::SYNC);
        message.encode(sync_id);
        message.encode(arguments);
        if let Err(e) = self.enqueue(message) {
            self.pending.lock().cancel(sync_id);
            return Err(e);
        }

        let outcome = match self.sync_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().cancel(sync_id);
                    tracing::warn!(sync_id, "{}::{} timed out", M::RECEIVER, M::NAME);
                    return Err(IpcError::Timeout);
                }
            },
            None => reply_rx.await,
        };
        let mut reply = outcome.map_err(|_| IpcError::Disconnected)??;

        match reply.decode::<M::Reply>() {
            Some(value) => Ok(value),
            None => {
                self.received_invalid(M::RECEIVER, M::NAME);
                Err(IpcError::InvalidMessage {
                    receiver: M::RECEIVER.to_string(),
                    message: M::NAME.to_string(),
                })
            }
        }
    }

    /// Move to `Invalidated`. Returns `false` if already there.
    fn invalidate(&self) -> bool {
        let previous = self
            .state
            .swap(ChannelState::Invalidated as u8, Ordering::AcqRel);
        if previous == ChannelState::Invalidated as u8 {
            return false;
        }

        self.pending.lock().fail_all();
        self.shutdown.notify_one();
        self.writer.shutdown();
        self.closed.notify_waiters();
        tracing::debug!(role = ?self.role, "channel invalidated");
        true
    }

    /// The peer is gone.
    fn connection_lost(&self) {
        if self.invalidate() {
            tracing::debug!(role = ?self.role, "peer closed the connection");
            if let Some(client) = &self.client {
                client.did_close();
            }
        }
    }

    fn received_invalid(&self, receiver: &str, message: &str) {
        if self.state() == ChannelState::Invalidated {
            return;
        }
        tracing::warn!("Received invalid message {}::{}", receiver, message);
        if let Some(client) = &self.client {
            client.did_receive_invalid_message(receiver, message);
        }
        self.invalidate();
    }

    fn handle_envelope(&self, envelope: Envelope, registry: &MessageRegistry) {
        let Some(mut message) = IncomingMessage::from_envelope(envelope) else {
            self.received_invalid("", "");
            return;
        };

        if message.is_control() {
            self.handle_control(message);
            return;
        }

        if message.should_dispatch_while_waiting_for_sync() && self.pending.lock().len() > 0 {
            tracing::trace!("dispatching while a sync call waits");
        }

        match registry.dispatch(&mut message) {
            Ok(Some(reply)) => {
                // The peer is blocked on this reply
                if let Err(e) = self.enqueue(reply) {
                    let (receiver, name) = message.description();
                    tracing::error!("Failed to send reply to {}::{}: {}", receiver, name, e);
                    self.received_invalid(&receiver, &name);
                }
            }
            Ok(None) => {}
            Err(IpcError::InvalidMessage { receiver, message }) => {
                self.received_invalid(&receiver, &message);
            }
            Err(e) => {
                let (receiver, name) = message.description();
                tracing::error!("Handler error for {}::{}: {}", receiver, name, e);
                self.received_invalid(&receiver, &name);
            }
        }
    }

    fn handle_control(&self, mut message: IncomingMessage) {
        if message.matches(IPC_RECEIVER, SYNC_MESSAGE_REPLY) {
            let sync_id = message.destination_id();
            if self.pending.lock().complete(sync_id, message).is_some() {
                tracing::warn!(sync_id, "dropping reply nobody is waiting for");
            }
        } else if message.matches(IPC_RECEIVER, INITIALIZE_CONNECTION) && self.role == Role::Server {
            if self.handshake_seen.swap(true, Ordering::AcqRel) {
                tracing::warn!("duplicate connection handshake");
                return self.received_invalid(IPC_RECEIVER, INITIALIZE_CONNECTION);
            }
            let peer = match message.decode::<bool>() {
                Some(true) => match message.decode::<Attachment>() {
                    Some(attachment) => Some(attachment),
                    None => return self.received_invalid(IPC_RECEIVER, INITIALIZE_CONNECTION),
                },
                Some(false) => None,
                None => return self.received_invalid(IPC_RECEIVER, INITIALIZE_CONNECTION),
            };
            // The port backend needs the client's port; the others take none
            match (self.backend_kind, peer) {
                (BackendKind::Port, Some(peer @ Attachment::Port(_))) => {
                    tracing::debug!(kind = ?peer.kind(), "client handed over its port");
                    if self.writer.install_peer(peer).is_err() {
                        self.connection_lost();
                    }
                }
                (BackendKind::Port, _) | (_, Some(_)) => {
                    self.received_invalid(IPC_RECEIVER, INITIALIZE_CONNECTION)
                }
                (_, None) => {}
            }
        } else if message.matches(IPC_RECEIVER, SET_EXCEPTION_PORT) {
            let Some(right) = message.decode::<PortRight>() else {
                return self.received_invalid(IPC_RECEIVER, SET_EXCEPTION_PORT);
            };
            tracing::debug!(port = right.name(), "peer set its exception port");
            let previous = self.exception_port.lock().replace(right);
            drop(previous);
        } else {
            let (receiver, name) = message.description();
            self.received_invalid(&receiver, &name);
        }
    }
}

/// Invalidate the channel if the writer task fails.
async fn watch_writer(inner: Arc<Inner>, task: JoinHandle<Result<()>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!("Writer error: {}", e);
            inner.connection_lost();
        }
        Err(e) => {
            tracing::error!("Writer task failed: {}", e);
            inner.connection_lost();
        }
    }
}

/// Main receive loop - reads messages and dispatches them in arrival order.
async fn receive_loop(
    inner: Arc<Inner>,
    mut receiver: Box<dyn BackendReceiver>,
    registry: MessageRegistry,
) {
    while inner.state() != ChannelState::Invalidated {
        let received = tokio::select! {
            _ = inner.shutdown.notified() => break,
            received = receiver.receive() => received,
        };

        match received {
            Ok(Some(envelope)) => inner.handle_envelope(envelope, &registry),
            Ok(None) => inner.connection_lost(),
            Err(e) => {
                tracing::error!("Receive error: {}", e);
                inner.connection_lost();
            }
        }
    }
    tracing::trace!("receive worker finished");
}

/// Cheaply cloneable handle for sending on a channel.
///
/// A sender does not keep the channel open; once the [`Channel`] is dropped
/// every send fails with [`IpcError::ChannelInvalid`].
#[derive(Clone)]
pub struct ChannelSender {
    inner: Arc<Inner>,
}

impl ChannelSender {
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_valid(&self) -> bool {
        self.state() != ChannelState::Invalidated
    }

    /// Queue a prepared message.
    pub fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.inner.enqueue(message)
    }

    /// Encode `arguments` as an `M` to `destination_id` and queue it.
    pub fn send_message<M: Message>(&self, destination_id: u64, arguments: M::Arguments) -> Result<()> {
        let mut message = OutgoingMessage::for_message::<M>(destination_id);
        message.encode(arguments);
        self.send(message)
    }

    /// Send an `M` and wait for its reply.
    ///
    /// Only the calling task waits; incoming messages keep being dispatched.
    ///
    /// # Errors
    ///
    /// - [`IpcError::Disconnected`] if the channel closes first
    /// - [`IpcError::Timeout`] if a sync timeout is configured and expires
    /// - [`IpcError::InvalidMessage`] if the reply does not decode; the
    ///   channel is invalidated
    pub async fn send_sync<M: SyncMessage>(
        &self,
        destination_id: u64,
        arguments: M::Arguments,
    ) -> Result<M::Reply> {
        self.inner.send_sync::<M>(destination_id, arguments).await
    }

    /// Like [`send_sync`](Self::send_sync), blocking the current thread.
    ///
    /// Returns [`IpcError::WouldDeadlock`] when called from inside a Tokio
    /// runtime.
    pub fn send_sync_blocking<M: SyncMessage>(
        &self,
        destination_id: u64,
        arguments: M::Arguments,
    ) -> Result<M::Reply> {
        if Handle::try_current().is_ok() {
            return Err(IpcError::WouldDeadlock);
        }
        self.inner
            .runtime
            .block_on(self.inner.send_sync::<M>(destination_id, arguments))
    }

    /// Hand the peer a port to report exceptions to (port backend only).
    pub fn send_exception_port(&self, port: PortRight) -> Result<()> {
        if self.inner.backend_kind != BackendKind::Port {
            return Err(IpcError::Unsupported(format!(
                "{:?} backend has no exception ports",
                self.inner.backend_kind
            )));
        }
        let mut message = OutgoingMessage::new(IPC_RECEIVER, SET_EXCEPTION_PORT, 0);
        message.encode(port);
        self.send(message)
    }

    /// Sends refused because the channel was already invalid.
    pub fn failed_send_count(&self) -> u64 {
        self.inner.failed_sends.load(Ordering::Relaxed)
    }

    /// Sync calls still waiting for a reply.
    pub fn pending_sync_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Messages queued for the writer and not yet handed to the backend.
    pub fn queued_messages(&self) -> usize {
        self.inner.writer.pending_count()
    }
}

/// An open channel.
///
/// Dropping it invalidates the channel, which fails outstanding sync calls
/// and releases the transport.
pub struct Channel {
    sender: ChannelSender,
    _worker: JoinHandle<()>,
}

impl Channel {
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder::new()
    }

    /// A handle that can send from other tasks and threads.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn role(&self) -> Role {
        self.sender.inner.role
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.sender.inner.backend_kind
    }

    pub fn state(&self) -> ChannelState {
        self.sender.state()
    }

    pub fn is_valid(&self) -> bool {
        self.sender.is_valid()
    }

    /// See [`ChannelSender::send`].
    pub fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.sender.send(message)
    }

    /// See [`ChannelSender::send_message`].
    pub fn send_message<M: Message>(&self, destination_id: u64, arguments: M::Arguments) -> Result<()> {
        self.sender.send_message::<M>(destination_id, arguments)
    }

    /// See [`ChannelSender::send_sync`].
    pub async fn send_sync<M: SyncMessage>(
        &self,
        destination_id: u64,
        arguments: M::Arguments,
    ) -> Result<M::Reply> {
        self.sender.send_sync::<M>(destination_id, arguments).await
    }

    /// See [`ChannelSender::send_sync_blocking`].
    pub fn send_sync_blocking<M: SyncMessage>(
        &self,
        destination_id: u64,
        arguments: M::Arguments,
    ) -> Result<M::Reply> {
        self.sender.send_sync_blocking::<M>(destination_id, arguments)
    }

    /// See [`ChannelSender::send_exception_port`].
    pub fn send_exception_port(&self, port: PortRight) -> Result<()> {
        self.sender.send_exception_port(port)
    }

    /// The exception port the peer handed over, if any.
    pub fn take_exception_port(&self) -> Option<PortRight> {
        self.sender.inner.exception_port.lock().take()
    }

    pub fn failed_send_count(&self) -> u64 {
        self.sender.failed_send_count()
    }

    pub fn pending_sync_calls(&self) -> usize {
        self.sender.pending_sync_calls()
    }

    pub fn queued_messages(&self) -> usize {
        self.sender.queued_messages()
    }

    /// Close the channel locally.
    ///
    /// Outstanding sync calls fail with [`IpcError::Disconnected`]; later
    /// sends fail with [`IpcError::ChannelInvalid`]. The peer sees the
    /// connection close.
    pub fn invalidate(&self) {
        self.sender.inner.invalidate();
    }

    /// Wait until the channel is invalidated, locally or by the peer.
    pub async fn wait_closed(&self) {
        loop {
            let closed = self.sender.inner.closed.notified();
            if self.state() == ChannelState::Invalidated {
                return;
            }
            closed.await;
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Worker and writer exit on their own once invalidated
        self.sender.inner.invalidate();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role())
            .field("backend", &self.backend_kind())
            .field("state", &self.state())
            .finish()
    }
}
