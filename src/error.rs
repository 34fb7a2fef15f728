//! Error types for procwire-ipc.

use thiserror::Error;

use crate::port::PortName;

/// Main error type for all channel, codec and resource operations.
#[derive(Debug, Error)]
pub enum IpcError {
    /// I/O error during socket or stream operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error for a structured argument slot.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// Protocol error (malformed frame, reserved bits set, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message body could not be decoded into the expected arguments.
    #[error("Invalid message {receiver}::{message}")]
    InvalidMessage {
        /// Receiver name as it appeared on the wire.
        receiver: String,
        /// Message name as it appeared on the wire.
        message: String,
    },

    /// The channel closed while a synchronous call was outstanding.
    #[error("Channel disconnected")]
    Disconnected,

    /// The channel has been invalidated and accepts no more traffic.
    #[error("Channel is invalid")]
    ChannelInvalid,

    /// No reply arrived within the configured timeout.
    #[error("Timed out waiting for reply")]
    Timeout,

    /// A blocking call was made from inside the async runtime.
    #[error("Blocking send from inside the runtime would deadlock")]
    WouldDeadlock,

    /// The operation is not available on this backend.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Outgoing message exceeds the configured maximum.
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Outgoing message carries more attachments than a frame can hold.
    #[error("Attachment count {count} exceeds maximum {max}")]
    TooManyAttachments {
        /// Number of attachments requested.
        count: usize,
        /// Configured limit.
        max: usize,
    },

    /// The destination port has no receiver anymore.
    #[error("Port {0} is dead")]
    DeadPort(PortName),

    /// The port name is not known to the port space.
    #[error("Invalid port name {0}")]
    InvalidPort(PortName),

    /// Duplicating, mapping or transferring an OS resource failed.
    #[error("Resource error: {0}")]
    Resource(String),
}

/// Result type alias using IpcError.
pub type Result<T> = std::result::Result<T, IpcError>;
