//! Dedicated writer task.
//!
//! Every send goes through an mpsc queue to one task that owns the backend's
//! send half, so callers on any thread never contend on the transport and
//! messages leave in the order they were queued.
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::UnboundedSender<WriterCommand> ─► Writer Task ─► Backend
//! Worker   ─┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::attachment::Attachment;
use crate::backend::{BackendSender, Envelope};
use crate::error::{IpcError, Result};

/// Work for the writer task.
#[derive(Debug)]
pub(crate) enum WriterCommand {
    /// Transmit one message.
    Send(Envelope),
    /// Start sending to the peer capability received in the handshake.
    InstallPeer(Attachment),
    /// Finish queued work and release the send half.
    Shutdown,
}

/// Handle for queueing work on the writer task.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::UnboundedSender<WriterCommand>,
    /// Messages queued but not yet handed to the backend.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Queue a message.
    pub(crate) fn send(&self, envelope: Envelope) -> Result<()> {
        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(WriterCommand::Send(envelope)).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            IpcError::ChannelInvalid
        })
    }

    pub(crate) fn install_peer(&self, attachment: Attachment) -> Result<()> {
        self.tx
            .send(WriterCommand::InstallPeer(attachment))
            .map_err(|_| IpcError::ChannelInvalid)
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
    }

    #[inline]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task over `sender`.
///
/// The task ends cleanly on [`WriterCommand::Shutdown`] or when every handle
/// is gone, and with the error of the first failed backend operation.
pub(crate) fn spawn_writer_task(
    sender: Box<dyn BackendSender>,
) -> (WriterHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, sender, pending));

    (handle, task)
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    mut sender: Box<dyn BackendSender>,
    pending: Arc<AtomicUsize>,
) -> Result<()> {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(envelope) => {
                let result = sender.send(envelope).await;
                pending.fetch_sub(1, Ordering::Release);
                result?;
            }
            WriterCommand::InstallPeer(attachment) => sender.install_peer(attachment)?,
            WriterCommand::Shutdown => break,
        }
    }
    tracing::trace!("writer task finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChannelBackend, StreamBackend};
    use bytes::Bytes;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_messages_leave_in_queue_order() {
        let (a, b) = duplex(64);
        let (_, sender) = Box::new(StreamBackend::from_stream(a)).into_split();
        let (mut receiver, _) = Box::new(StreamBackend::from_stream(b)).into_split();

        let (handle, task) = spawn_writer_task(sender);
        for i in 0..10u8 {
            handle
                .send(Envelope::new(Bytes::from(vec![i; 100]), Vec::new()))
                .unwrap();
        }

        for i in 0..10u8 {
            let envelope = receiver.receive().await.unwrap().unwrap();
            assert_eq!(envelope.body[0], i);
        }

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_error_ends_task() {
        let (a, _b) = duplex(64);
        let (_, sender) = Box::new(StreamBackend::from_stream(a)).into_split();

        let (handle, task) = spawn_writer_task(sender);
        handle
            .install_peer(Attachment::Uninitialized)
            .unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(handle
            .send(Envelope::new(Bytes::new(), Vec::new()))
            .is_err());
    }
}
