//! Routed messages.
//!
//! A message body starts with a small routing header followed by the
//! encoded argument tuple:
//!
//! ```text
//! ┌───────┬───────────────┬──────────────┬────────────────┬──────────┐
//! │ Flags │ Receiver name │ Message name │ Destination id │ Payload  │
//! │ u8    │ u64 len+bytes │ u64 len+bytes│ u64            │ ...      │
//! └───────┴───────────────┴──────────────┴────────────────┴──────────┘
//! ```
//!
//! Integers are host-endian and aligned as the codec aligns them. Names are
//! static strings on the sending side and zero-copy slices of the received
//! body on the receiving side. A message flagged [`flags::SYNC`] carries its
//! request id as the first payload field.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::message::{IncomingMessage, OutgoingMessage};
//!
//! let mut outgoing = OutgoingMessage::new("WebPage", "LoadURL", 3);
//! outgoing.encode(("https://example.org", true));
//! let envelope = outgoing.into_envelope();
//!
//! let mut incoming = IncomingMessage::from_envelope(envelope).unwrap();
//! assert!(incoming.matches("WebPage", "LoadURL"));
//! assert_eq!(incoming.destination_id(), 3);
//! let (url, reload): (String, bool) = incoming.decode().unwrap();
//! assert_eq!(url, "https://example.org");
//! assert!(reload);
//! ```

use bytes::Bytes;

use crate::attachment::Attachment;
use crate::backend::Envelope;
use crate::codec::{Decode, Decoder, Encode, Encoder};

/// Receiver name reserved for channel control messages.
pub const IPC_RECEIVER: &str = "IPC";
/// Carries the client's freshly minted receive capability during handshake.
pub const INITIALIZE_CONNECTION: &str = "InitializeConnection";
/// Carries a capability for forwarding fatal-exception notifications.
pub const SET_EXCEPTION_PORT: &str = "SetExceptionPort";
/// Carries the reply to a synchronous call; destination id is the request id.
pub const SYNC_MESSAGE_REPLY: &str = "SyncMessageReply";

/// Message flag constants.
pub mod flags {
    /// The sender waits for exactly one correlated reply.
    pub const SYNC: u8 = 0b0000_0001;
    /// Deliver even while the receiver is itself waiting on a sync reply.
    pub const DISPATCH_WHILE_WAITING_FOR_SYNC: u8 = 0b0000_0010;

    /// Reserved bits mask (bits 2-7).
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// A one-way message type: its routing names and argument tuple.
///
/// ```
/// use procwire_ipc::message::Message;
///
/// struct DidFinishLoad;
///
/// impl Message for DidFinishLoad {
///     const RECEIVER: &'static str = "WebPageProxy";
///     const NAME: &'static str = "DidFinishLoad";
///     type Arguments = (u64, String);
/// }
/// ```
pub trait Message {
    const RECEIVER: &'static str;
    const NAME: &'static str;
    type Arguments: Encode + Decode;
}

/// A message that expects exactly one reply.
pub trait SyncMessage: Message {
    type Reply: Encode + Decode;
}

/// A message being built for sending.
#[derive(Debug)]
pub struct OutgoingMessage {
    encoder: Encoder,
    flags: u8,
    receiver: &'static str,
    name: &'static str,
    destination_id: u64,
}

impl OutgoingMessage {
    /// Start a message and write its routing header.
    pub fn new(receiver: &'static str, name: &'static str, destination_id: u64) -> Self {
        let mut encoder = Encoder::with_capacity(64);
        encoder.encode(0u8);
        encoder.encode(receiver);
        encoder.encode(name);
        encoder.encode(destination_id);
        Self {
            encoder,
            flags: 0,
            receiver,
            name,
            destination_id,
        }
    }

    /// Start a message of type `M`.
    pub fn for_message<M: Message>(destination_id: u64) -> Self {
        Self::new(M::RECEIVER, M::NAME, destination_id)
    }

    /// Start the reply to synchronous request `sync_id`.
    pub(crate) fn sync_reply(sync_id: u64) -> Self {
        Self::new(IPC_RECEIVER, SYNC_MESSAGE_REPLY, sync_id)
    }

    /// Set a flag bit in the already-written header.
    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
        self.encoder.patch_byte(0, self.flags);
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    #[inline]
    pub fn receiver_name(&self) -> &'static str {
        self.receiver
    }

    #[inline]
    pub fn message_name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn destination_id(&self) -> u64 {
        self.destination_id
    }

    /// Append a value to the payload.
    #[inline]
    pub fn encode<T: Encode>(&mut self, value: T) {
        self.encoder.encode(value);
    }

    pub fn encoder_mut(&mut self) -> &mut Encoder {
        &mut self.encoder
    }

    /// Encoded size so far, header included.
    #[inline]
    pub fn len(&self) -> usize {
        self.encoder.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.encoder.is_empty()
    }

    pub fn into_envelope(self) -> Envelope {
        let (body, attachments) = self.encoder.into_parts();
        Envelope::new(Bytes::from(body), attachments)
    }
}

/// A received message with its routing header already parsed.
#[derive(Debug)]
pub struct IncomingMessage {
    flags: u8,
    receiver: Bytes,
    name: Bytes,
    destination_id: u64,
    decoder: Decoder,
}

impl IncomingMessage {
    /// Parse the routing header of `body`.
    ///
    /// Returns `None` if the header is truncated or uses reserved flag bits.
    /// Attachments are disposed in that case.
    pub fn parse(body: Bytes, attachments: Vec<Attachment>) -> Option<Self> {
        let mut decoder = Decoder::with_attachments(body, attachments);
        let flags = decoder.decode::<u8>()?;
        if flags & self::flags::RESERVED_MASK != 0 {
            return None;
        }
        let receiver = decoder.decode::<Bytes>()?;
        let name = decoder.decode::<Bytes>()?;
        let destination_id = decoder.decode::<u64>()?;
        Some(Self {
            flags,
            receiver,
            name,
            destination_id,
            decoder,
        })
    }

    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        Self::parse(envelope.body, envelope.attachments)
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    #[inline]
    pub fn is_sync(&self) -> bool {
        flags::has_flag(self.flags, flags::SYNC)
    }

    #[inline]
    pub fn should_dispatch_while_waiting_for_sync(&self) -> bool {
        flags::has_flag(self.flags, flags::DISPATCH_WHILE_WAITING_FOR_SYNC)
    }

    #[inline]
    pub fn receiver_name(&self) -> &[u8] {
        &self.receiver
    }

    #[inline]
    pub fn message_name(&self) -> &[u8] {
        &self.name
    }

    #[inline]
    pub fn destination_id(&self) -> u64 {
        self.destination_id
    }

    /// Whether this message is routed to `receiver`/`name`.
    #[inline]
    pub fn matches(&self, receiver: &str, name: &str) -> bool {
        self.receiver == receiver.as_bytes() && self.name == name.as_bytes()
    }

    /// Whether this message is a `M`.
    #[inline]
    pub fn is<M: Message>(&self) -> bool {
        self.matches(M::RECEIVER, M::NAME)
    }

    /// Whether this message is channel-internal.
    #[inline]
    pub fn is_control(&self) -> bool {
        self.receiver == IPC_RECEIVER.as_bytes()
    }

    /// `receiver::name` for diagnostics.
    pub fn description(&self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.receiver).into_owned(),
            String::from_utf8_lossy(&self.name).into_owned(),
        )
    }

    /// Decode the next payload value.
    #[inline]
    pub fn decode<T: Decode>(&mut self) -> Option<T> {
        self.decoder.decode()
    }

    pub fn decoder_mut(&mut self) -> &mut Decoder {
        &mut self.decoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::{AttachmentKind, OolMemory};

    #[test]
    fn test_header_round_trip() {
        let mut outgoing = OutgoingMessage::new("Plugin", "Paint", 0xABCD);
        outgoing.set_flag(flags::DISPATCH_WHILE_WAITING_FOR_SYNC);
        outgoing.encode(5u32);

        let mut incoming = IncomingMessage::from_envelope(outgoing.into_envelope()).unwrap();
        assert!(incoming.matches("Plugin", "Paint"));
        assert!(!incoming.matches("Plugin", "Other"));
        assert_eq!(incoming.destination_id(), 0xABCD);
        assert!(incoming.should_dispatch_while_waiting_for_sync());
        assert!(!incoming.is_sync());
        assert!(!incoming.is_control());
        assert_eq!(incoming.decode::<u32>(), Some(5));
    }

    #[test]
    fn test_names_reference_the_received_body() {
        let envelope = OutgoingMessage::new("Receiver", "Name", 0).into_envelope();
        let body = envelope.body.clone();
        let incoming = IncomingMessage::from_envelope(envelope).unwrap();

        let offset = incoming.receiver_name().as_ptr() as usize - body.as_ptr() as usize;
        assert_eq!(&body[offset..offset + 8], b"Receiver");
    }

    #[test]
    fn test_reserved_flag_bits_rejected() {
        let mut outgoing = OutgoingMessage::new("A", "B", 0);
        outgoing.set_flag(0b1000_0000);
        assert!(IncomingMessage::from_envelope(outgoing.into_envelope()).is_none());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let envelope = OutgoingMessage::new("Receiver", "Name", 9).into_envelope();
        for cut in 0..envelope.body.len() {
            assert!(IncomingMessage::parse(envelope.body.slice(..cut), Vec::new()).is_none());
        }
    }

    #[test]
    fn test_attachments_travel_with_the_message() {
        let mut outgoing = OutgoingMessage::new("A", "B", 0);
        outgoing.encode(Attachment::OolMemory(OolMemory::new(Bytes::from_static(b"x"))));
        let envelope = outgoing.into_envelope();
        assert_eq!(envelope.attachments.len(), 1);

        let mut incoming = IncomingMessage::from_envelope(envelope).unwrap();
        let attachment: Attachment = incoming.decode().unwrap();
        assert_eq!(attachment.kind(), AttachmentKind::OolMemory);
    }

    #[test]
    fn test_sync_reply_header() {
        let incoming =
            IncomingMessage::from_envelope(OutgoingMessage::sync_reply(42).into_envelope()).unwrap();
        assert!(incoming.is_control());
        assert!(incoming.matches(IPC_RECEIVER, SYNC_MESSAGE_REPLY));
        assert_eq!(incoming.destination_id(), 42);
    }
}
