//! Payload encoder.
//!
//! Appends fixed-size primitives and variable-length byte ranges to a growable
//! buffer. Every write is aligned relative to the start of the buffer, so the
//! decoder can mirror the same padding without knowing anything about the
//! physical address of either buffer.
//!
//! OS resources never enter the byte stream. They are pushed onto a separate
//! attachment list that the backend transports beside the body.

use super::Encode;
use crate::attachment::Attachment;

/// Round `offset` up to the next multiple of `alignment` (a power of two).
#[inline]
pub(crate) fn align_up(offset: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

/// Growable buffer that values encode themselves into.
#[derive(Debug, Default)]
pub struct Encoder {
    buffer: Vec<u8>,
    attachments: Vec<Attachment>,
}

impl Encoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an encoder with pre-allocated buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            attachments: Vec::new(),
        }
    }

    /// Encode a value, consuming it.
    ///
    /// Values that own OS resources move them into the attachment list, so
    /// the caller cannot keep using a capability it has promised away.
    #[inline]
    pub fn encode<T: Encode>(&mut self, value: T) {
        value.encode(self);
    }

    /// Append raw bytes after padding the buffer to `alignment`.
    pub fn encode_fixed_length_data(&mut self, data: &[u8], alignment: usize) {
        let start = align_up(self.buffer.len(), alignment);
        self.buffer.resize(start, 0);
        self.buffer.extend_from_slice(data);
    }

    /// Append a 64-bit length followed by the raw bytes.
    pub fn encode_variable_length_bytes(&mut self, data: &[u8]) {
        self.encode(data.len() as u64);
        self.encode_fixed_length_data(data, 1);
    }

    /// Queue an attachment to travel beside the body.
    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    /// Encoded bytes so far.
    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Encoded length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing has been encoded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Attachments in push order.
    #[inline]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Overwrite a byte that was already encoded (used to patch header flags).
    pub(crate) fn patch_byte(&mut self, offset: usize, value: u8) {
        if let Some(byte) = self.buffer.get_mut(offset) {
            *byte = value;
        }
    }

    /// Split into the body and the attachments (in push order).
    pub fn into_parts(self) -> (Vec<u8>, Vec<Attachment>) {
        (self.buffer, self.attachments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 4), 12);
        assert_eq!(align_up(5, 1), 5);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn test_primitive_is_padded_to_its_alignment() {
        let mut encoder = Encoder::new();
        encoder.encode(1u8);
        encoder.encode(0x0102_0304u32);

        // 1 byte, 3 padding bytes, 4 bytes
        assert_eq!(encoder.len(), 8);
        assert_eq!(&encoder.buffer()[1..4], &[0, 0, 0]);
        assert_eq!(&encoder.buffer()[4..8], &0x0102_0304u32.to_ne_bytes());
    }

    #[test]
    fn test_variable_length_bytes_layout() {
        let mut encoder = Encoder::new();
        encoder.encode_variable_length_bytes(b"abc");

        assert_eq!(encoder.len(), 8 + 3);
        assert_eq!(&encoder.buffer()[..8], &3u64.to_ne_bytes());
        assert_eq!(&encoder.buffer()[8..], b"abc");
    }

    #[test]
    fn test_patch_byte_out_of_range_is_ignored() {
        let mut encoder = Encoder::new();
        encoder.encode(7u8);
        encoder.patch_byte(0, 9);
        encoder.patch_byte(10, 1);
        assert_eq!(encoder.buffer(), &[9]);
    }
}
