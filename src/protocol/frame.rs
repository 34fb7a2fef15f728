//! Frame struct with typed accessors.
//!
//! Represents a complete frame: header, attachment infos and inline body.
//! Uses `bytes::Bytes` for zero-copy body sharing.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::attachment::AttachmentKind;
//! use procwire_ipc::protocol::{build_frame, AttachmentInfo, FrameBuffer};
//!
//! let infos = [AttachmentInfo::new(AttachmentKind::Socket, 0)];
//! let bytes = build_frame(&infos, b"hello", 0);
//!
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&bytes).unwrap();
//! assert_eq!(frames[0].body(), b"hello");
//! assert_eq!(frames[0].infos.len(), 1);
//! ```

use std::io::IoSlice;

use bytes::Bytes;

use super::wire_format::{AttachmentInfo, FrameHeader, ATTACHMENT_INFO_SIZE, FRAME_HEADER_SIZE};

/// A complete frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Attachment infos in stack order (last pushed first).
    pub infos: Vec<AttachmentInfo>,
    /// Inline body bytes (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, infos: Vec<AttachmentInfo>, body: Bytes) -> Self {
        Self {
            header,
            infos,
            body,
        }
    }

    /// Get a reference to the inline body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub fn attachment_count(&self) -> usize {
        self.infos.len()
    }

    #[inline]
    pub fn is_body_out_of_line(&self) -> bool {
        self.header.is_body_out_of_line()
    }
}

/// Encode the header and infos that precede a body.
///
/// `infos` are given in push order and written in stack order.
pub fn build_frame_prefix(infos: &[AttachmentInfo], body_size: u32, flags: u32) -> Vec<u8> {
    let header = FrameHeader::new(body_size, infos.len() as u32, flags);
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + infos.len() * ATTACHMENT_INFO_SIZE);
    buf.extend_from_slice(&header.encode());
    for info in infos.iter().rev() {
        buf.extend_from_slice(&info.encode());
    }
    buf
}

/// Build a complete frame as a single byte vector.
///
/// Use `build_frame_prefix` plus the body for scatter/gather I/O (writev).
pub fn build_frame(infos: &[AttachmentInfo], body: &[u8], flags: u32) -> Vec<u8> {
    let mut buf = build_frame_prefix(infos, body.len() as u32, flags);
    buf.extend_from_slice(body);
    buf
}

/// A frame ready to be written: encoded prefix plus inline body.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Header and attachment infos.
    pub prefix: Vec<u8>,
    /// Inline body bytes.
    pub body: Bytes,
}

impl OutboundFrame {
    pub fn new(infos: &[AttachmentInfo], body: Bytes, flags: u32) -> Self {
        Self {
            prefix: build_frame_prefix(infos, body.len() as u32, flags),
            body,
        }
    }

    /// Total size of this frame (prefix + body).
    #[inline]
    pub fn size(&self) -> usize {
        self.prefix.len() + self.body.len()
    }

    /// IoSlice array for the bytes after the first `skip_bytes`.
    pub fn remaining_slices(&self, skip_bytes: usize) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(2);
        let prefix_len = self.prefix.len();

        if skip_bytes < prefix_len {
            slices.push(IoSlice::new(&self.prefix[skip_bytes..]));
        }
        if !self.body.is_empty() && skip_bytes < prefix_len + self.body.len() {
            let start_in_body = skip_bytes.saturating_sub(prefix_len);
            slices.push(IoSlice::new(&self.body[start_in_body..]));
        }
        slices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentKind;
    use crate::protocol::frame_flags;

    #[test]
    fn test_frame_accessors() {
        let header = FrameHeader::new(5, 0, 0);
        let frame = Frame::new(header, Vec::new(), Bytes::from_static(b"hello"));

        assert_eq!(frame.body(), b"hello");
        assert_eq!(frame.attachment_count(), 0);
        assert!(!frame.is_body_out_of_line());
    }

    #[test]
    fn test_infos_written_in_stack_order() {
        let infos = [
            AttachmentInfo::new(AttachmentKind::Socket, 1),
            AttachmentInfo::new(AttachmentKind::MappedMemory, 2),
        ];
        let bytes = build_frame_prefix(&infos, 0, frame_flags::BODY_IS_OUT_OF_LINE);

        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 2 * ATTACHMENT_INFO_SIZE);
        let first = AttachmentInfo::decode(&bytes[FRAME_HEADER_SIZE..]).unwrap();
        assert_eq!(first.kind, AttachmentKind::MappedMemory);
    }

    #[test]
    fn test_build_frame_appends_body() {
        let bytes = build_frame(&[], b"abc", 0);
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 3);
        assert_eq!(&bytes[FRAME_HEADER_SIZE..], b"abc");

        let header = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(header.body_size, 3);
        assert_eq!(header.attachment_count, 0);
    }

    #[test]
    fn test_remaining_slices_after_partial_write() {
        let frame = OutboundFrame::new(&[], Bytes::from_static(b"hello"), 0);
        assert_eq!(frame.size(), FRAME_HEADER_SIZE + 5);

        assert_eq!(frame.remaining_slices(0).len(), 2);

        let slices = frame.remaining_slices(4);
        assert_eq!(slices[0].len(), FRAME_HEADER_SIZE - 4);
        assert_eq!(&*slices[1], b"hello");

        let slices = frame.remaining_slices(FRAME_HEADER_SIZE + 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"llo");

        assert!(frame.remaining_slices(frame.size()).is_empty());
    }
}
