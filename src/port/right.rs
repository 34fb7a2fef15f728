//! Owned port rights.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{PortMessage, PortName, PortSpace};
use crate::error::Result;

/// How a send right was produced when it was put into a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDisposition {
    /// Minted from the receive right.
    MakeSend,
    /// Copied from an existing send right, which the sender keeps.
    CopySend,
    /// The sender gave up its own send right.
    MoveSend,
}

/// One send reference to a port.
///
/// Not `Clone`: use [`PortRight::copy_send`] to take another reference.
/// Dropping the value releases the reference.
pub struct PortRight {
    name: PortName,
    disposition: PortDisposition,
    space: Arc<PortSpace>,
}

impl PortRight {
    /// Wrap a send reference that has already been counted.
    pub(crate) fn new(space: Arc<PortSpace>, name: PortName, disposition: PortDisposition) -> Self {
        Self {
            name,
            disposition,
            space,
        }
    }

    #[inline]
    pub fn name(&self) -> PortName {
        self.name
    }

    #[inline]
    pub fn disposition(&self) -> PortDisposition {
        self.disposition
    }

    #[inline]
    pub fn space(&self) -> &Arc<PortSpace> {
        &self.space
    }

    /// Take another send reference to the same port.
    pub fn copy_send(&self) -> PortRight {
        self.space.retain_send(self.name);
        PortRight::new(self.space.clone(), self.name, PortDisposition::CopySend)
    }

    /// Mark this right as given away by its holder.
    pub fn into_move(mut self) -> PortRight {
        self.disposition = PortDisposition::MoveSend;
        self
    }

    /// Queue a message on the port.
    pub fn send(&self, message: PortMessage) -> Result<()> {
        self.space.send(self.name, message)
    }

    /// Whether the port's receive right is gone.
    pub fn is_dead(&self) -> bool {
        self.space.is_dead(self.name)
    }
}

impl Drop for PortRight {
    fn drop(&mut self) {
        self.space.release_send(self.name);
    }
}

impl fmt::Debug for PortRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRight")
            .field("name", &self.name)
            .field("disposition", &self.disposition)
            .finish()
    }
}

/// The unique right to read a port's queue.
///
/// Dropping it destroys the port: queued messages are disposed, later sends
/// fail with `DeadPort`, and every registered dead-name notification fires.
pub struct ReceiveRight {
    name: PortName,
    space: Arc<PortSpace>,
    rx: mpsc::UnboundedReceiver<PortMessage>,
}

impl ReceiveRight {
    pub(crate) fn new(
        space: Arc<PortSpace>,
        name: PortName,
        rx: mpsc::UnboundedReceiver<PortMessage>,
    ) -> Self {
        Self { name, space, rx }
    }

    #[inline]
    pub fn name(&self) -> PortName {
        self.name
    }

    #[inline]
    pub fn space(&self) -> &Arc<PortSpace> {
        &self.space
    }

    /// Mint a send right to this port.
    pub fn make_send(&self) -> PortRight {
        self.space.retain_send(self.name);
        PortRight::new(self.space.clone(), self.name, PortDisposition::MakeSend)
    }

    /// Wait for the next message.
    pub async fn receive(&mut self) -> Option<PortMessage> {
        self.rx.recv().await
    }

    /// Take the next message if one is queued.
    pub fn try_receive(&mut self) -> Option<PortMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ReceiveRight {
    fn drop(&mut self) {
        self.space.destroy_receive(self.name);
    }
}

impl fmt::Debug for ReceiveRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveRight").field("name", &self.name).finish()
    }
}
