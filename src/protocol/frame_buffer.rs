//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 12 bytes
//! - `WaitingForTrailer`: Header parsed, need the infos and inline body
//!
//! # Example
//!
//! ```
//! use procwire_ipc::protocol::{build_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(&[], b"payload", 0);
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[5..]).unwrap();
//! assert_eq!(frames[0].body(), b"payload");
//! ```

use bytes::BytesMut;

use super::wire_format::{
    AttachmentInfo, FrameHeader, ATTACHMENT_INFO_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
    FRAME_HEADER_SIZE, MAX_ATTACHMENTS,
};
use super::Frame;
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 12 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for infos and body.
    WaitingForTrailer { header: FrameHeader },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Uses a state machine to handle partial reads efficiently.
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    max_message_size: u32,
    max_attachments: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 64 MiB, max attachments: 64.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_MESSAGE_SIZE, MAX_ATTACHMENTS)
    }

    /// Create a new frame buffer with custom limits.
    pub fn with_limits(max_message_size: u32, max_attachments: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_message_size,
            max_attachments,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a header fails validation or an info record is bad.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let Some(header) = FrameHeader::decode(&self.buffer) else {
                        return Ok(None);
                    };
                    header.validate(self.max_message_size, self.max_attachments)?;

                    // Consume header bytes
                    let _ = self.buffer.split_to(FRAME_HEADER_SIZE);
                    self.state = State::WaitingForTrailer { header };
                }

                State::WaitingForTrailer { header } => {
                    let header = *header;
                    if self.buffer.len() < header.trailing_len() {
                        return Ok(None);
                    }

                    let info_bytes = self
                        .buffer
                        .split_to(header.attachment_count as usize * ATTACHMENT_INFO_SIZE);
                    let infos = info_bytes
                        .chunks_exact(ATTACHMENT_INFO_SIZE)
                        .map(AttachmentInfo::decode)
                        .collect::<Result<Vec<_>>>()?;

                    // Extract body (zero-copy freeze)
                    let body = self.buffer.split_to(header.body_size as usize).freeze();

                    // Reset state for next frame
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Frame::new(header, infos, body)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Whether a frame has been started but not completed.
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForTrailer { .. })
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForTrailer { .. } => "WaitingForTrailer",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
