//! OS resources that travel beside a message body.
//!
//! An [`Attachment`] owns the resource it carries. Dropping it closes the
//! descriptor or releases the port reference, so a decode failure that
//! discards half-read attachments cannot leak anything. Handing an attachment
//! to an [`Encoder`](crate::codec::Encoder) moves it into the outgoing message.

use std::fmt;
use std::os::fd::OwnedFd;

use bytes::Bytes;

use crate::codec::{Decode, Decoder, Encode, Encoder};
use crate::port::PortRight;

/// Wire tag for an attachment variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AttachmentKind {
    Uninitialized = 0,
    Port = 1,
    OolMemory = 2,
    Socket = 3,
    MappedMemory = 4,
}

impl AttachmentKind {
    /// Tag as written in an attachment info.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a wire tag; `None` for unknown values.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::Port),
            2 => Some(Self::OolMemory),
            3 => Some(Self::Socket),
            4 => Some(Self::MappedMemory),
            _ => None,
        }
    }
}

/// How the port backend moves an out-of-line region to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyPolicy {
    /// Share pages copy-on-write.
    #[default]
    Virtual,
    /// Copy the bytes eagerly.
    Physical,
}

/// Out-of-line memory region (port backend).
#[derive(Clone)]
pub struct OolMemory {
    data: Bytes,
    copy_policy: CopyPolicy,
    deallocate: bool,
}

impl OolMemory {
    /// Region that shares `data` virtually and is released after sending.
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            copy_policy: CopyPolicy::Virtual,
            deallocate: true,
        }
    }

    /// Region with an explicit copy policy and release flag.
    pub fn with_policy(data: Bytes, copy_policy: CopyPolicy, deallocate: bool) -> Self {
        Self {
            data,
            copy_policy,
            deallocate,
        }
    }

    /// The region's bytes.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// How the region reaches the receiver.
    #[inline]
    pub fn copy_policy(&self) -> CopyPolicy {
        self.copy_policy
    }

    /// Whether the sender gives up the region once it is sent.
    #[inline]
    pub fn should_deallocate(&self) -> bool {
        self.deallocate
    }

    /// Materialize the region as it appears on the receiving side.
    pub(crate) fn deliver(self) -> Self {
        let data = match self.copy_policy {
            CopyPolicy::Virtual => self.data,
            CopyPolicy::Physical => Bytes::copy_from_slice(&self.data),
        };
        Self {
            data,
            copy_policy: self.copy_policy,
            deallocate: true,
        }
    }

    /// Take the bytes, ending the region.
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl fmt::Debug for OolMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OolMemory")
            .field("size", &self.data.len())
            .field("copy_policy", &self.copy_policy)
            .field("deallocate", &self.deallocate)
            .finish()
    }
}

/// A live OS resource queued beside a message body.
#[derive(Debug, Default)]
pub enum Attachment {
    /// Empty slot.
    #[default]
    Uninitialized,
    /// A send right in a port space.
    Port(PortRight),
    /// Out-of-line memory (port backend).
    OolMemory(OolMemory),
    /// A descriptor passed as ancillary data (socket backend).
    Socket { fd: OwnedFd, size: u64 },
    /// A descriptor to a shared-memory backing store (socket backend).
    MappedMemory { fd: OwnedFd, size: u64 },
}

impl Attachment {
    /// Wire tag for this variant.
    pub fn kind(&self) -> AttachmentKind {
        match self {
            Self::Uninitialized => AttachmentKind::Uninitialized,
            Self::Port(_) => AttachmentKind::Port,
            Self::OolMemory(_) => AttachmentKind::OolMemory,
            Self::Socket { .. } => AttachmentKind::Socket,
            Self::MappedMemory { .. } => AttachmentKind::MappedMemory,
        }
    }

    /// Byte length recorded for this attachment on the wire.
    pub fn size(&self) -> u64 {
        match self {
            Self::Socket { size, .. } | Self::MappedMemory { size, .. } => *size,
            Self::OolMemory(memory) => memory.len() as u64,
            Self::Uninitialized | Self::Port(_) => 0,
        }
    }

    /// The descriptor carried by a socket-backend attachment.
    pub fn fd(&self) -> Option<&OwnedFd> {
        match self {
            Self::Socket { fd, .. } | Self::MappedMemory { fd, .. } => Some(fd),
            _ => None,
        }
    }

    /// Release the underlying resource now.
    pub fn dispose(self) {
        if !matches!(self, Self::Uninitialized) {
            tracing::trace!("disposing {:?} attachment", self.kind());
        }
    }
}

impl Encode for Attachment {
    fn encode(self, encoder: &mut Encoder) {
        encoder.add_attachment(self);
    }
}

impl Decode for Attachment {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.take_attachment()
    }
}

impl Encode for OwnedFd {
    fn encode(self, encoder: &mut Encoder) {
        encoder.add_attachment(Attachment::Socket { fd: self, size: 0 });
    }
}

impl Decode for OwnedFd {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        match decoder.take_attachment()? {
            Attachment::Socket { fd, .. } => Some(fd),
            _ => None,
        }
    }
}

impl Encode for PortRight {
    fn encode(self, encoder: &mut Encoder) {
        encoder.add_attachment(Attachment::Port(self));
    }
}

impl Decode for PortRight {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        match decoder.take_attachment()? {
            Attachment::Port(right) => Some(right),
            _ => None,
        }
    }
}
