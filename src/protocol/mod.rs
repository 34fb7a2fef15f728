//! Protocol module - frame format for the socket and stream backends.
//!
//! This module implements the byte-level framing around a message body:
//! - 12-byte header plus 16-byte attachment infos
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, build_frame_prefix, Frame, OutboundFrame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    frame_flags, AttachmentInfo, FrameHeader, ATTACHMENT_INFO_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
    FRAME_HEADER_SIZE, INLINE_BODY_THRESHOLD, MAX_ATTACHMENTS,
};
