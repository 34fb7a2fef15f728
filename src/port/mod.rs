//! Kernel-style message ports.
//!
//! A [`PortSpace`] is a namespace of ports. Each port has at most one
//! [`ReceiveRight`] and any number of send references, each held by a
//! [`PortRight`]. Messages sent to a port are queued until the receive right
//! reads them. Ports named in a message travel as rights, so the receiver
//! ends up holding a live reference rather than a number it has to look up.
//!
//! The space is an ordinary value: create it before the first channel that
//! uses it and share it by `Arc`. It lives as long as any right in it.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::port::{PortMessage, PortSpace};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let space = PortSpace::new();
//! let mut receive = space.allocate_receive();
//! let send = receive.make_send();
//!
//! send.send(PortMessage::new(7, "hi".into())).unwrap();
//! let message = receive.receive().await.unwrap();
//! assert_eq!(message.id, 7);
//! # }
//! ```

mod right;
mod space;

use bytes::Bytes;

use crate::attachment::Attachment;

pub use right::{PortDisposition, PortRight, ReceiveRight};
pub use space::PortSpace;

/// Name of a port within its space.
pub type PortName = u32;

/// Message id of a dead-name notification. The body is the dead port's name.
pub const DEAD_NAME_NOTIFICATION_ID: u32 = 0x48;

/// One message queued on a port.
#[derive(Debug)]
pub struct PortMessage {
    /// Application-defined message id.
    pub id: u32,
    /// Header bits (see [`crate::protocol::frame_flags`]).
    pub bits: u32,
    /// Inline body.
    pub body: Bytes,
    /// Rights and out-of-line regions, in push order.
    pub descriptors: Vec<Attachment>,
}

impl PortMessage {
    pub fn new(id: u32, body: Bytes) -> Self {
        Self {
            id,
            bits: 0,
            body,
            descriptors: Vec::new(),
        }
    }

    /// Name carried by a dead-name notification.
    pub fn dead_name(&self) -> Option<PortName> {
        if self.id != DEAD_NAME_NOTIFICATION_ID {
            return None;
        }
        let bytes = <[u8; 4]>::try_from(self.body.get(..4)?).ok()?;
        Some(PortName::from_ne_bytes(bytes))
    }
}
