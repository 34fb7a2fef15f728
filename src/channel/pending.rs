//! Outstanding synchronous calls, keyed by sync request id.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{IpcError, Result};
use crate::message::IncomingMessage;

type ReplySender = oneshot::Sender<Result<IncomingMessage>>;

/// Waiters for sync replies.
///
/// Once closed, every waiter has been failed and no new one is accepted.
#[derive(Default)]
pub(crate) struct PendingReplies {
    waiting: HashMap<u64, ReplySender>,
    closed: bool,
}

impl PendingReplies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the reply to `sync_id`.
    pub(crate) fn register(&mut self, sync_id: u64) -> Result<oneshot::Receiver<Result<IncomingMessage>>> {
        if self.closed {
            return Err(IpcError::ChannelInvalid);
        }
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(sync_id, tx);
        Ok(rx)
    }

    /// Hand `reply` to the waiter for `sync_id`.
    ///
    /// Returns the reply back if nobody is waiting for it.
    pub(crate) fn complete(&mut self, sync_id: u64, reply: IncomingMessage) -> Option<IncomingMessage> {
        let Some(tx) = self.waiting.remove(&sync_id) else {
            return Some(reply);
        };
        match tx.send(Ok(reply)) {
            Ok(()) => None,
            // Waiter gave up (timeout or dropped future)
            Err(Ok(reply)) => Some(reply),
            Err(Err(_)) => None,
        }
    }

    /// Stop waiting for `sync_id`.
    pub(crate) fn cancel(&mut self, sync_id: u64) {
        self.waiting.remove(&sync_id);
    }

    /// Fail every waiter with [`IpcError::Disconnected`] and refuse new ones.
    pub(crate) fn fail_all(&mut self) {
        self.closed = true;
        for (sync_id, tx) in self.waiting.drain() {
            tracing::debug!(sync_id, "failing pending sync call");
            let _ = tx.send(Err(IpcError::Disconnected));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}
