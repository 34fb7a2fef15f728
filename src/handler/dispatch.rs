//! Decode-and-call glue between a message and a statically typed handler.

use crate::error::IpcError;
use crate::message::{IncomingMessage, Message, OutgoingMessage, SyncMessage};

use super::Callable;

/// The error reported when `message` cannot be handled.
pub(crate) fn invalid_message(message: &IncomingMessage) -> IpcError {
    let (receiver, message) = message.description();
    IpcError::InvalidMessage { receiver, message }
}

/// Decode `M::Arguments` from `message` and call `handler` with them.
///
/// # Errors
///
/// Returns [`IpcError::InvalidMessage`] if the arguments do not decode.
pub fn handle_message<M, F>(message: &mut IncomingMessage, handler: &F) -> Result<(), IpcError>
where
    M: Message,
    F: Callable<M::Arguments, Output = ()>,
{
    let arguments = message
        .decode::<M::Arguments>()
        .ok_or_else(|| invalid_message(message))?;
    handler.call(arguments);
    Ok(())
}

/// Decode `M::Arguments`, call `handler`, and encode what it returns as the
/// reply to `sync_id`.
///
/// # Errors
///
/// Returns [`IpcError::InvalidMessage`] if the arguments do not decode.
pub fn handle_sync_message<M, F>(
    message: &mut IncomingMessage,
    sync_id: u64,
    handler: &F,
) -> Result<OutgoingMessage, IpcError>
where
    M: SyncMessage,
    F: Callable<M::Arguments, Output = M::Reply>,
{
    let arguments = message
        .decode::<M::Arguments>()
        .ok_or_else(|| invalid_message(message))?;
    let reply = handler.call(arguments);

    let mut outgoing = OutgoingMessage::sync_reply(sync_id);
    outgoing.encode(reply);
    Ok(outgoing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Ping;
    impl Message for Ping {
        const RECEIVER: &'static str = "Test";
        const NAME: &'static str = "Ping";
        type Arguments = (u32, bool);
    }
    impl SyncMessage for Ping {
        type Reply = (u32,);
    }

    struct TakeFd;
    impl Message for TakeFd {
        const RECEIVER: &'static str = "Test";
        const NAME: &'static str = "TakeFd";
        type Arguments = (OwnedFd, u32);
    }

    fn message_with<T: crate::codec::Encode>(
        receiver: &'static str,
        name: &'static str,
        args: T,
    ) -> IncomingMessage {
        let mut outgoing = OutgoingMessage::new(receiver, name, 0);
        outgoing.encode(args);
        IncomingMessage::from_envelope(outgoing.into_envelope()).unwrap()
    }

    #[test]
    fn test_handler_receives_positional_arguments() {
        let mut message = message_with("Test", "Ping", (7u32, true));

        let (tx, rx) = std::sync::mpsc::channel();
        let handler = move |value: u32, flag: bool| {
            tx.send((value, flag)).unwrap();
        };
        handle_message::<Ping, _>(&mut message, &handler).unwrap();
        assert_eq!(rx.recv().unwrap(), (7, true));
    }

    #[test]
    fn test_reply_is_routed_to_sync_id() {
        let mut message = message_with("Test", "Ping", (20u32, false));
        let reply = handle_sync_message::<Ping, _>(&mut message, 42, &|v: u32, _: bool| (v + 1,))
            .unwrap();
        assert_eq!(reply.destination_id(), 42);

        let mut reply = IncomingMessage::from_envelope(reply.into_envelope()).unwrap();
        assert_eq!(reply.decode::<(u32,)>(), Some((21,)));
    }

    #[test]
    fn test_decode_failure_names_the_message() {
        let mut message = message_with("Test", "Ping", (1u8,));
        let err = handle_message::<Ping, _>(&mut message, &|_: u32, _: bool| {}).unwrap_err();
        assert_eq!(err.to_string(), "Invalid message Test::Ping");
    }

    #[test]
    fn test_missing_attachment_fails_without_calling_handler() {
        // Arguments name a descriptor but none was attached
        let mut message = message_with("Test", "TakeFd", 5u32);

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let handler = move |_: OwnedFd, _: u32| flag.store(true, Ordering::SeqCst);
        assert!(handle_message::<TakeFd, _>(&mut message, &handler).is_err());
        assert!(!called.load(Ordering::SeqCst));
    }
}
