//! Port backend.
//!
//! Each side owns a receive right and holds a send right to the other. The
//! server starts with only its receive right; the client starts with a send
//! right to it, mints its own receive right during the handshake and hands
//! the server a send right to that. Until the server installs it, outgoing
//! messages wait in a backlog.
//!
//! Each side watches the other's port with a dead-name notification, which
//! the receiver reports as end of stream.

use std::sync::Arc;

use bytes::Bytes;

use super::{BackendKind, BackendReceiver, BackendSender, BoxFuture, ChannelBackend, Envelope, Limits};
use crate::attachment::{Attachment, OolMemory};
use crate::channel::ChannelConfig;
use crate::error::{IpcError, Result};
use crate::port::{PortMessage, PortName, PortRight, PortSpace, ReceiveRight};
use crate::protocol::frame_flags;

/// Message id for ordinary channel traffic.
const CHANNEL_MESSAGE_ID: u32 = 0x1000;

/// Channel backend over a [`PortSpace`].
pub struct PortBackend {
    space: Arc<PortSpace>,
    receive: Option<ReceiveRight>,
    peer: Option<PortRight>,
    limits: Limits,
}

impl PortBackend {
    /// Server end: owns the port clients connect to.
    pub fn server(receive: ReceiveRight) -> Self {
        Self {
            space: receive.space().clone(),
            receive: Some(receive),
            peer: None,
            limits: Limits::default(),
        }
    }

    /// Client end: holds a send right to the server's port.
    pub fn client(peer: PortRight) -> Self {
        Self {
            space: peer.space().clone(),
            receive: None,
            peer: Some(peer),
            limits: Limits::default(),
        }
    }

    pub fn space(&self) -> &Arc<PortSpace> {
        &self.space
    }
}

impl ChannelBackend for PortBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Port
    }

    fn configure(&mut self, config: &ChannelConfig) {
        self.limits = Limits::from(config);
    }

    fn handshake_attachment(&mut self) -> Result<Option<Attachment>> {
        let Some(peer) = &self.peer else {
            return Err(IpcError::Protocol(
                "client handshake needs a send right to the server".into(),
            ));
        };
        if self.receive.is_some() {
            return Ok(None);
        }

        let receive = self.space.allocate_receive();
        self.space
            .request_dead_name_notification(peer.name(), receive.name())?;
        let send = receive.make_send();
        tracing::debug!(
            port = receive.name(),
            server = peer.name(),
            "created client receive right"
        );
        self.receive = Some(receive);
        Ok(Some(Attachment::Port(send)))
    }

    fn into_split(self: Box<Self>) -> (Box<dyn BackendReceiver>, Box<dyn BackendSender>) {
        let local = self.receive.as_ref().map(ReceiveRight::name);
        let receiver = PortReceiver {
            receive: self.receive,
        };
        let sender = PortSender {
            space: self.space,
            local,
            peer: self.peer,
            backlog: Vec::new(),
            limits: self.limits,
        };
        (Box::new(receiver), Box::new(sender))
    }
}

struct PortReceiver {
    receive: Option<ReceiveRight>,
}

impl PortReceiver {
    async fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        let Some(receive) = &mut self.receive else {
            return Err(IpcError::Protocol("no receive right".into()));
        };
        let Some(message) = receive.receive().await else {
            return Ok(None);
        };
        if let Some(dead) = message.dead_name() {
            tracing::debug!(port = dead, "peer port died");
            return Ok(None);
        }

        let PortMessage {
            bits,
            body,
            mut descriptors,
            ..
        } = message;
        let body = if frame_flags::has_flag(bits, frame_flags::BODY_IS_OUT_OF_LINE) {
            match descriptors.pop() {
                Some(Attachment::OolMemory(region)) => region.into_data(),
                _ => {
                    return Err(IpcError::Protocol(
                        "out-of-line body without a region".into(),
                    ))
                }
            }
        } else {
            body
        };
        Ok(Some(Envelope::new(body, descriptors)))
    }
}

impl BackendReceiver for PortReceiver {
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Envelope>>> {
        Box::pin(self.next_envelope())
    }
}

struct PortSender {
    space: Arc<PortSpace>,
    /// Our receive port, watched-for by the peer.
    local: Option<PortName>,
    peer: Option<PortRight>,
    /// Messages queued before the peer's port is known.
    backlog: Vec<Envelope>,
    limits: Limits,
}

impl PortSender {
    fn transmit(&mut self, envelope: Envelope) -> Result<()> {
        self.limits.check(&envelope)?;
        if let Some(attachment) = envelope
            .attachments
            .iter()
            .find(|a| !BackendKind::Port.carries(a.kind()))
        {
            return Err(IpcError::Unsupported(format!(
                "port transport cannot carry {:?} attachments",
                attachment.kind()
            )));
        }

        let Some(peer) = &self.peer else {
            self.backlog.push(envelope);
            return Ok(());
        };

        let Envelope {
            body,
            mut attachments,
        } = envelope;
        let mut message = PortMessage::new(CHANNEL_MESSAGE_ID, Bytes::new());
        if body.len() > self.limits.inline_threshold {
            attachments.push(Attachment::OolMemory(OolMemory::new(body)));
            message.bits |= frame_flags::BODY_IS_OUT_OF_LINE;
        } else {
            message.body = body;
        }
        message.descriptors = attachments;
        peer.send(message)
    }
}

impl BackendSender for PortSender {
    fn send(&mut self, envelope: Envelope) -> BoxFuture<'_, Result<()>> {
        let result = self.transmit(envelope);
        Box::pin(std::future::ready(result))
    }

    fn install_peer(&mut self, attachment: Attachment) -> Result<()> {
        let peer = match attachment {
            Attachment::Port(peer) => peer,
            other => {
                return Err(IpcError::Protocol(format!(
                    "expected a port right, got {:?}",
                    other.kind()
                )))
            }
        };
        if self.peer.is_some() {
            return Err(IpcError::Protocol("peer port already installed".into()));
        }
        if let Some(local) = self.local {
            self.space.request_dead_name_notification(peer.name(), local)?;
        }
        tracing::debug!(port = peer.name(), backlog = self.backlog.len(), "installed peer port");
        self.peer = Some(peer);

        for envelope in std::mem::take(&mut self.backlog) {
            self.transmit(envelope)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(
        space: &Arc<PortSpace>,
    ) -> (
        (Box<dyn BackendReceiver>, Box<dyn BackendSender>),
        (Box<dyn BackendReceiver>, Box<dyn BackendSender>),
    ) {
        let server_port = space.allocate_receive();
        let mut client = PortBackend::client(server_port.make_send());
        let server = PortBackend::server(server_port);

        let handshake = client.handshake_attachment().unwrap().unwrap();
        let (server_rx, mut server_tx) = Box::new(server).into_split();
        server_tx.install_peer(handshake).unwrap();
        ((server_rx, server_tx), Box::new(client).into_split())
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let space = PortSpace::new();
        let ((mut server_rx, mut server_tx), (mut client_rx, mut client_tx)) = connected(&space);

        client_tx
            .send(Envelope::new(Bytes::from_static(b"up"), Vec::new()))
            .await
            .unwrap();
        server_tx
            .send(Envelope::new(Bytes::from_static(b"down"), Vec::new()))
            .await
            .unwrap();

        assert_eq!(&server_rx.receive().await.unwrap().unwrap().body[..], b"up");
        assert_eq!(&client_rx.receive().await.unwrap().unwrap().body[..], b"down");
    }

    #[tokio::test]
    async fn test_server_backlog_flushes_on_install() {
        let space = PortSpace::new();
        let server_port = space.allocate_receive();
        let mut client = PortBackend::client(server_port.make_send());
        let (_server_rx, mut server_tx) = Box::new(PortBackend::server(server_port)).into_split();

        server_tx
            .send(Envelope::new(Bytes::from_static(b"early"), Vec::new()))
            .await
            .unwrap();

        let handshake = client.handshake_attachment().unwrap().unwrap();
        let (mut client_rx, _client_tx) = Box::new(client).into_split();
        server_tx.install_peer(handshake).unwrap();

        assert_eq!(&client_rx.receive().await.unwrap().unwrap().body[..], b"early");
    }

    #[tokio::test]
    async fn test_large_body_travels_out_of_line() {
        let space = PortSpace::new();
        let ((mut server_rx, _), (_, mut client_tx)) = connected(&space);

        let body = Bytes::from(vec![3u8; 8192]);
        client_tx
            .send(Envelope::new(body.clone(), Vec::new()))
            .await
            .unwrap();

        let envelope = server_rx.receive().await.unwrap().unwrap();
        assert_eq!(envelope.body, body);
        assert!(envelope.attachments.is_empty());
    }

    #[tokio::test]
    async fn test_peer_death_is_end_of_stream() {
        let space = PortSpace::new();
        let ((mut server_rx, server_tx), client) = connected(&space);

        drop(client);
        assert!(server_rx.receive().await.unwrap().is_none());
        drop(server_tx);
    }

    #[tokio::test]
    async fn test_descriptor_attachments_are_refused() {
        let space = PortSpace::new();
        let ((_, mut server_tx), _client) = connected(&space);

        let fd = std::os::fd::OwnedFd::from(tempfile::tempfile().unwrap());
        let envelope = Envelope::new(Bytes::new(), vec![Attachment::Socket { fd, size: 0 }]);
        assert!(matches!(
            server_tx.send(envelope).await,
            Err(IpcError::Unsupported(_))
        ));
    }
}
