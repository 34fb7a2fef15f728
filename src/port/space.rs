//! Port namespace.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{PortDisposition, PortMessage, PortName, PortRight, ReceiveRight};
use super::DEAD_NAME_NOTIFICATION_ID;
use crate::attachment::Attachment;
use crate::error::{IpcError, Result};
use crate::shared_memory::Protection;

/// Memory object named by a port (see [`PortSpace::make_memory_entry`]).
struct MemoryObject {
    fd: OwnedFd,
    size: u64,
    protection: Protection,
}

#[derive(Default)]
struct PortEntry {
    /// Present while the receive right is alive.
    queue: Option<mpsc::UnboundedSender<PortMessage>>,
    send_rights: usize,
    /// Ports to notify when this one dies.
    dead_name_requests: Vec<PortName>,
    memory: Option<MemoryObject>,
}

impl PortEntry {
    fn is_unreferenced(&self) -> bool {
        self.queue.is_none() && self.send_rights == 0
    }
}

/// A namespace of ports shared by every endpoint that exchanges rights.
///
/// Never hold the lock while a [`PortRight`] may be dropped: its destructor
/// re-enters the space.
pub struct PortSpace {
    ports: Mutex<HashMap<PortName, PortEntry>>,
    next_name: AtomicU32,
}

impl PortSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(HashMap::new()),
            // 0 stays reserved as the null name
            next_name: AtomicU32::new(0x103),
        })
    }

    fn next_name(&self) -> PortName {
        self.next_name.fetch_add(4, Ordering::Relaxed)
    }

    /// Create a port and return its receive right.
    pub fn allocate_receive(self: &Arc<Self>) -> ReceiveRight {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = self.next_name();
        self.ports.lock().insert(
            name,
            PortEntry {
                queue: Some(tx),
                ..PortEntry::default()
            },
        );
        tracing::trace!(port = name, "allocated receive right");
        ReceiveRight::new(self.clone(), name, rx)
    }

    /// Queue `message` on `dest`.
    ///
    /// On failure the message, including its rights, is disposed.
    pub fn send(&self, dest: PortName, mut message: PortMessage) -> Result<()> {
        let queue = {
            let ports = self.ports.lock();
            let entry = ports.get(&dest).ok_or(IpcError::InvalidPort(dest))?;
            entry.queue.clone().ok_or(IpcError::DeadPort(dest))?
        };

        message.descriptors = message
            .descriptors
            .into_iter()
            .map(|descriptor| match descriptor {
                Attachment::OolMemory(memory) => Attachment::OolMemory(memory.deliver()),
                other => other,
            })
            .collect();

        queue.send(message).map_err(|_| IpcError::DeadPort(dest))
    }

    /// Ask for a dead-name notification on `notify` when `watched` dies.
    ///
    /// Fires immediately if `watched` is already dead.
    pub fn request_dead_name_notification(&self, watched: PortName, notify: PortName) -> Result<()> {
        let already_dead = {
            let mut ports = self.ports.lock();
            let entry = ports.get_mut(&watched).ok_or(IpcError::InvalidPort(watched))?;
            if entry.queue.is_some() {
                entry.dead_name_requests.push(notify);
                false
            } else {
                true
            }
        };

        if already_dead {
            self.notify_dead_name(watched, notify);
        }
        Ok(())
    }

    fn notify_dead_name(&self, dead: PortName, notify: PortName) {
        let message = PortMessage::new(
            DEAD_NAME_NOTIFICATION_ID,
            Bytes::copy_from_slice(&dead.to_ne_bytes()),
        );
        if let Err(e) = self.send(notify, message) {
            tracing::debug!(port = dead, "dead-name notification not delivered: {}", e);
        }
    }

    /// Name a memory object with a fresh port and return a send right to it.
    pub fn make_memory_entry(
        self: &Arc<Self>,
        fd: OwnedFd,
        size: u64,
        protection: Protection,
    ) -> PortRight {
        let name = self.next_name();
        self.ports.lock().insert(
            name,
            PortEntry {
                send_rights: 1,
                memory: Some(MemoryObject {
                    fd,
                    size,
                    protection,
                }),
                ..PortEntry::default()
            },
        );
        PortRight::new(self.clone(), name, PortDisposition::MakeSend)
    }

    /// Duplicate the backing descriptor of a memory entry.
    pub fn memory_entry(&self, name: PortName) -> Result<(OwnedFd, u64, Protection)> {
        let ports = self.ports.lock();
        let memory = ports
            .get(&name)
            .and_then(|entry| entry.memory.as_ref())
            .ok_or(IpcError::InvalidPort(name))?;
        let fd = memory.fd.try_clone()?;
        Ok((fd, memory.size, memory.protection))
    }

    /// Whether `name` has lost its receive right (or never had one).
    pub fn is_dead(&self, name: PortName) -> bool {
        self.ports
            .lock()
            .get(&name)
            .map_or(true, |entry| entry.queue.is_none())
    }

    /// Outstanding send references for `name`.
    pub fn send_right_count(&self, name: PortName) -> Option<usize> {
        self.ports.lock().get(&name).map(|entry| entry.send_rights)
    }

    /// Number of live port names.
    pub fn port_count(&self) -> usize {
        self.ports.lock().len()
    }

    pub(crate) fn retain_send(&self, name: PortName) {
        if let Some(entry) = self.ports.lock().get_mut(&name) {
            entry.send_rights += 1;
        }
    }

    pub(crate) fn release_send(&self, name: PortName) {
        let removed = {
            let mut ports = self.ports.lock();
            match ports.get_mut(&name) {
                Some(entry) => {
                    entry.send_rights = entry.send_rights.saturating_sub(1);
                    if entry.is_unreferenced() {
                        ports.remove(&name)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        drop(removed);
    }

    pub(crate) fn destroy_receive(&self, name: PortName) {
        let (queue, requests) = {
            let mut ports = self.ports.lock();
            let Some(entry) = ports.get_mut(&name) else {
                return;
            };
            let queue = entry.queue.take();
            let requests = std::mem::take(&mut entry.dead_name_requests);
            let removed = if entry.is_unreferenced() {
                ports.remove(&name)
            } else {
                None
            };
            drop(removed);
            (queue, requests)
        };
        drop(queue);

        tracing::trace!(port = name, "receive right destroyed");
        for notify in requests {
            self.notify_dead_name(name, notify);
        }
    }
}

impl std::fmt::Debug for PortSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSpace")
            .field("ports", &self.port_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::OolMemory;

    #[tokio::test]
    async fn test_send_and_receive() {
        let space = PortSpace::new();
        let mut receive = space.allocate_receive();
        let send = receive.make_send();

        send.send(PortMessage::new(1, Bytes::from_static(b"one"))).unwrap();
        send.send(PortMessage::new(2, Bytes::from_static(b"two"))).unwrap();

        assert_eq!(receive.receive().await.unwrap().id, 1);
        assert_eq!(receive.receive().await.unwrap().body, Bytes::from_static(b"two"));
        assert!(receive.try_receive().is_none());
    }

    #[test]
    fn test_send_to_dead_port_fails() {
        let space = PortSpace::new();
        let receive = space.allocate_receive();
        let send = receive.make_send();
        let name = send.name();
        drop(receive);

        assert!(send.is_dead());
        assert!(matches!(
            send.send(PortMessage::new(1, Bytes::new())),
            Err(IpcError::DeadPort(n)) if n == name
        ));
    }

    #[test]
    fn test_entry_removed_when_last_reference_goes() {
        let space = PortSpace::new();
        let receive = space.allocate_receive();
        let first = receive.make_send();
        let second = first.copy_send();
        assert_eq!(second.disposition(), PortDisposition::CopySend);
        assert_eq!(space.send_right_count(receive.name()), Some(2));

        drop(receive);
        assert_eq!(space.port_count(), 1);
        drop(first);
        drop(second);
        assert_eq!(space.port_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_name_notification() {
        let space = PortSpace::new();
        let watched = space.allocate_receive();
        let mut notify = space.allocate_receive();
        let watched_name = watched.name();

        space
            .request_dead_name_notification(watched_name, notify.name())
            .unwrap();
        drop(watched);

        let message = notify.receive().await.unwrap();
        assert_eq!(message.dead_name(), Some(watched_name));
    }

    #[tokio::test]
    async fn test_dead_name_request_on_already_dead_port_fires_immediately() {
        let space = PortSpace::new();
        let watched = space.allocate_receive();
        let keep = watched.make_send();
        let mut notify = space.allocate_receive();
        drop(watched);

        space
            .request_dead_name_notification(keep.name(), notify.name())
            .unwrap();
        assert_eq!(notify.try_receive().unwrap().dead_name(), Some(keep.name()));
    }

    #[test]
    fn test_rights_in_undelivered_messages_are_released() {
        let space = PortSpace::new();
        let target = space.allocate_receive();
        let carried = space.allocate_receive();
        let carried_name = carried.name();

        let mut message = PortMessage::new(1, Bytes::new());
        message
            .descriptors
            .push(Attachment::Port(carried.make_send()));
        target.make_send().send(message).unwrap();
        assert_eq!(space.send_right_count(carried_name), Some(1));

        // Destroying the target disposes its queue
        drop(target);
        assert_eq!(space.send_right_count(carried_name), Some(0));
    }

    #[tokio::test]
    async fn test_ool_memory_is_delivered() {
        let space = PortSpace::new();
        let mut receive = space.allocate_receive();

        let mut message = PortMessage::new(3, Bytes::new());
        message
            .descriptors
            .push(Attachment::OolMemory(OolMemory::new(Bytes::from(vec![5u8; 8192]))));
        receive.make_send().send(message).unwrap();

        let message = receive.receive().await.unwrap();
        match &message.descriptors[0] {
            Attachment::OolMemory(memory) => assert_eq!(memory.len(), 8192),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_name_is_invalid() {
        let space = PortSpace::new();
        assert!(matches!(
            space.send(0, PortMessage::new(0, Bytes::new())),
            Err(IpcError::InvalidPort(0))
        ));
        assert!(space.memory_entry(0).is_err());
    }
}
