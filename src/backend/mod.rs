//! Channel backends - the transports a [`Channel`](crate::channel::Channel)
//! runs over.
//!
//! A backend is a runtime strategy object. The channel configures it, asks it
//! for a handshake capability (client side only), then splits it into a
//! receive half owned by the receive worker and a send half owned by the
//! writer task.
//!
//! | Backend | Transport | Attachments | Large bodies |
//! |---|---|---|---|
//! | [`PortBackend`] | [`PortSpace`](crate::port::PortSpace) messages | `Port`, `OolMemory` | `OolMemory` descriptor |
//! | [`SocketBackend`] | Unix stream socket | `Socket`, `MappedMemory` via `SCM_RIGHTS` | `MappedMemory` region |
//! | [`StreamBackend`] | any `AsyncRead + AsyncWrite` | none | inline |

mod port;
mod socket;
mod stream;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::attachment::{Attachment, AttachmentKind};
use crate::channel::ChannelConfig;
use crate::error::{IpcError, Result};

pub use port::PortBackend;
pub use socket::SocketBackend;
pub use stream::StreamBackend;

/// Boxed future for backend operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One message as a backend sees it: body bytes plus attachments in push
/// order.
#[derive(Debug, Default)]
pub struct Envelope {
    pub body: Bytes,
    pub attachments: Vec<Attachment>,
}

impl Envelope {
    pub fn new(body: Bytes, attachments: Vec<Attachment>) -> Self {
        Self { body, attachments }
    }
}

/// Which transport a backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Port,
    Socket,
    Stream,
}

impl BackendKind {
    /// Whether this transport can carry an attachment of `kind`.
    pub fn carries(self, kind: AttachmentKind) -> bool {
        match self {
            BackendKind::Port => matches!(kind, AttachmentKind::Port | AttachmentKind::OolMemory),
            BackendKind::Socket => {
                matches!(kind, AttachmentKind::Socket | AttachmentKind::MappedMemory)
            }
            BackendKind::Stream => false,
        }
    }
}

/// A transport a channel can be opened on.
pub trait ChannelBackend: Send + 'static {
    fn kind(&self) -> BackendKind;

    /// Apply channel limits before the backend is split.
    fn configure(&mut self, _config: &ChannelConfig) {}

    /// Client side: create the receive capability the server will send to.
    ///
    /// Returns `None` when the transport is already bidirectional.
    fn handshake_attachment(&mut self) -> Result<Option<Attachment>> {
        Ok(None)
    }

    /// Split into the receive half and the send half.
    fn into_split(self: Box<Self>) -> (Box<dyn BackendReceiver>, Box<dyn BackendSender>);
}

/// Receive half of a backend.
pub trait BackendReceiver: Send + 'static {
    /// Wait for the next message. `Ok(None)` means the peer is gone.
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Envelope>>>;
}

/// Send half of a backend.
pub trait BackendSender: Send + 'static {
    /// Transmit one message.
    fn send(&mut self, envelope: Envelope) -> BoxFuture<'_, Result<()>>;

    /// Server side: start sending to the capability the client handed over.
    fn install_peer(&mut self, attachment: Attachment) -> Result<()> {
        Err(IpcError::Unsupported(format!(
            "backend cannot install a {:?} peer",
            attachment.kind()
        )))
    }
}

/// Limits every backend enforces, taken from the channel config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_message_size: u32,
    pub max_attachments: u32,
    pub inline_threshold: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

impl From<&ChannelConfig> for Limits {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            max_attachments: config.max_attachments,
            inline_threshold: config.inline_threshold,
        }
    }
}

impl Limits {
    /// Check an outgoing envelope against the limits.
    pub(crate) fn check(&self, envelope: &Envelope) -> Result<()> {
        if envelope.body.len() > self.max_message_size as usize {
            return Err(IpcError::MessageTooLarge {
                size: envelope.body.len(),
                max: self.max_message_size as usize,
            });
        }
        // One slot is kept free for an out-of-line body
        if envelope.attachments.len() >= self.max_attachments as usize {
            return Err(IpcError::TooManyAttachments {
                count: envelope.attachments.len(),
                max: self.max_attachments.saturating_sub(1) as usize,
            });
        }
        Ok(())
    }
}
