//! Frame wire format for the socket and stream backends.
//!
//! Each message travels as one frame:
//! ```text
//! ┌───────────┬──────────────┬─────────────┬─────────────────────┬──────────┐
//! │ Body size │ Attach count │ Frame flags │ Attachment infos    │ Body     │
//! │ u32       │ u32          │ u32         │ 16 bytes × count    │ N bytes  │
//! └───────────┴──────────────┴─────────────┴─────────────────────┴──────────┘
//! ```
//!
//! Attachment info:
//! ```text
//! ┌──────────┬──────────┬──────────┐
//! │ Kind     │ Reserved │ Size     │
//! │ u32      │ u32 (0)  │ u64      │
//! └──────────┴──────────┴──────────┘
//! ```
//!
//! Infos are written in stack order: the last attachment pushed comes first.
//! All integers are host-endian; both peers run on the same machine.

use crate::attachment::AttachmentKind;
use crate::error::{IpcError, Result};

/// Header size in bytes (fixed, exactly 12).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Attachment info size in bytes (fixed, exactly 16).
pub const ATTACHMENT_INFO_SIZE: usize = 16;

/// Default maximum body size (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Default maximum attachments per frame.
pub const MAX_ATTACHMENTS: u32 = 64;

/// Bodies larger than this travel out of line.
pub const INLINE_BODY_THRESHOLD: usize = 4096;

/// Frame flag constants.
pub mod frame_flags {
    /// The body travels in the last attachment instead of inline.
    pub const BODY_IS_OUT_OF_LINE: u32 = 0b0000_0001;

    /// Reserved bits mask (bits 1-31).
    pub const RESERVED_MASK: u32 = !BODY_IS_OUT_OF_LINE;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u32, flag: u32) -> bool {
        flags & flag != 0
    }
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Inline body length in bytes.
    pub body_size: u32,
    /// Number of attachment infos that follow the header.
    pub attachment_count: u32,
    /// Flags (see `frame_flags` module).
    pub flags: u32,
}

impl FrameHeader {
    pub fn new(body_size: u32, attachment_count: u32, flags: u32) -> Self {
        Self {
            body_size,
            attachment_count,
            flags,
        }
    }

    /// Encode header to bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use procwire_ipc::protocol::{frame_flags, FrameHeader};
    ///
    /// let header = FrameHeader::new(100, 2, frame_flags::BODY_IS_OUT_OF_LINE);
    /// assert_eq!(header.encode().len(), 12);
    /// ```
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `FRAME_HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.body_size.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.attachment_count.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_ne_bytes());
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            body_size: read_u32(buf, 0),
            attachment_count: read_u32(buf, 4),
            flags: read_u32(buf, 8),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Body size doesn't exceed max
    /// - Attachment count doesn't exceed max
    /// - Reserved flag bits are 0
    /// - An out-of-line body has an attachment to live in and no inline bytes
    pub fn validate(&self, max_message_size: u32, max_attachments: u32) -> Result<()> {
        if self.body_size > max_message_size {
            return Err(IpcError::Protocol(format!(
                "Body size {} exceeds maximum {}",
                self.body_size, max_message_size
            )));
        }

        if self.attachment_count > max_attachments {
            return Err(IpcError::Protocol(format!(
                "Attachment count {} exceeds maximum {}",
                self.attachment_count, max_attachments
            )));
        }

        if self.flags & frame_flags::RESERVED_MASK != 0 {
            return Err(IpcError::Protocol(
                "Reserved frame flag bits must be 0".to_string(),
            ));
        }

        if self.is_body_out_of_line() && (self.attachment_count == 0 || self.body_size != 0) {
            return Err(IpcError::Protocol(
                "Out-of-line body needs one attachment and no inline bytes".to_string(),
            ));
        }

        Ok(())
    }

    /// Bytes that follow the header: infos plus inline body.
    #[inline]
    pub fn trailing_len(&self) -> usize {
        self.attachment_count as usize * ATTACHMENT_INFO_SIZE + self.body_size as usize
    }

    #[inline]
    pub fn is_body_out_of_line(&self) -> bool {
        frame_flags::has_flag(self.flags, frame_flags::BODY_IS_OUT_OF_LINE)
    }
}

/// Describes one attachment in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub kind: AttachmentKind,
    pub size: u64,
}

impl AttachmentInfo {
    pub fn new(kind: AttachmentKind, size: u64) -> Self {
        Self { kind, size }
    }

    pub fn encode(&self) -> [u8; ATTACHMENT_INFO_SIZE] {
        let mut buf = [0u8; ATTACHMENT_INFO_SIZE];
        buf[0..4].copy_from_slice(&self.kind.as_u32().to_ne_bytes());
        buf[8..16].copy_from_slice(&self.size.to_ne_bytes());
        buf
    }

    /// Decode and validate one info record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ATTACHMENT_INFO_SIZE {
            return Err(IpcError::Protocol("Truncated attachment info".to_string()));
        }
        let kind = read_u32(buf, 0);
        let kind = AttachmentKind::from_u32(kind)
            .ok_or_else(|| IpcError::Protocol(format!("Unknown attachment kind {}", kind)))?;
        if read_u32(buf, 4) != 0 {
            return Err(IpcError::Protocol(
                "Reserved attachment info bits must be 0".to_string(),
            ));
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[8..16]);
        Ok(Self {
            kind,
            size: u64::from_ne_bytes(size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = FrameHeader::new(100, 3, frame_flags::BODY_IS_OUT_OF_LINE);
        let decoded = FrameHeader::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_byte_layout() {
        let header = FrameHeader::new(0x0102_0304, 5, 0);
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &0x0102_0304u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &5u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 11]; // One byte short
        assert!(FrameHeader::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_body_too_large() {
        let header = FrameHeader::new(1_000_000, 0, 0);
        let result = header.validate(100, MAX_ATTACHMENTS);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_too_many_attachments() {
        let header = FrameHeader::new(0, MAX_ATTACHMENTS + 1, 0);
        assert!(header
            .validate(DEFAULT_MAX_MESSAGE_SIZE, MAX_ATTACHMENTS)
            .is_err());
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let header = FrameHeader::new(0, 0, 0b10);
        let result = header.validate(DEFAULT_MAX_MESSAGE_SIZE, MAX_ATTACHMENTS);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Reserved frame flag bits"));
    }

    #[test]
    fn test_validate_out_of_line_shape() {
        let ok = FrameHeader::new(0, 1, frame_flags::BODY_IS_OUT_OF_LINE);
        assert!(ok.validate(DEFAULT_MAX_MESSAGE_SIZE, MAX_ATTACHMENTS).is_ok());

        let no_attachment = FrameHeader::new(0, 0, frame_flags::BODY_IS_OUT_OF_LINE);
        assert!(no_attachment
            .validate(DEFAULT_MAX_MESSAGE_SIZE, MAX_ATTACHMENTS)
            .is_err());

        let inline_bytes = FrameHeader::new(4, 1, frame_flags::BODY_IS_OUT_OF_LINE);
        assert!(inline_bytes
            .validate(DEFAULT_MAX_MESSAGE_SIZE, MAX_ATTACHMENTS)
            .is_err());
    }

    #[test]
    fn test_trailing_len() {
        let header = FrameHeader::new(10, 2, 0);
        assert_eq!(header.trailing_len(), 2 * ATTACHMENT_INFO_SIZE + 10);
    }

    #[test]
    fn test_attachment_info_roundtrip() {
        let info = AttachmentInfo::new(AttachmentKind::MappedMemory, 8192);
        assert_eq!(AttachmentInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn test_attachment_info_rejects_unknown_kind_and_reserved_bits() {
        let mut bytes = AttachmentInfo::new(AttachmentKind::Socket, 0).encode();
        bytes[0..4].copy_from_slice(&77u32.to_ne_bytes());
        assert!(AttachmentInfo::decode(&bytes).is_err());

        let mut bytes = AttachmentInfo::new(AttachmentKind::Socket, 0).encode();
        bytes[4] = 1;
        assert!(AttachmentInfo::decode(&bytes).is_err());
    }
}
