//! Payload decoder.
//!
//! Consumes what [`Encoder`](super::Encoder) produced. The decoder tracks a
//! logical end and refuses any read that would cross it. The first failed read
//! marks the decoder invalid, and every later read fails without looking at
//! the buffer again.
//!
//! Attachments arrive in push order and are kept as a stack, so
//! [`Decoder::take_attachment`] hands them back in the order they were pushed.

use bytes::Bytes;

use super::encoder::align_up;
use super::Decode;
use crate::attachment::Attachment;

/// Bounds-checked reader over a received message body.
#[derive(Debug)]
pub struct Decoder {
    buffer: Bytes,
    position: usize,
    end: usize,
    valid: bool,
    /// Top of the stack is the next attachment to hand out.
    attachments: Vec<Attachment>,
}

impl Decoder {
    /// Create a decoder over `buffer` with no attachments.
    pub fn new(buffer: impl Into<Bytes>) -> Self {
        Self::with_attachments(buffer, Vec::new())
    }

    /// Create a decoder over `buffer` with attachments given in push order.
    pub fn with_attachments(buffer: impl Into<Bytes>, mut attachments: Vec<Attachment>) -> Self {
        let buffer = buffer.into();
        attachments.reverse();
        Self {
            end: buffer.len(),
            buffer,
            position: 0,
            valid: true,
            attachments,
        }
    }

    /// Decode a value. Returns `None` and invalidates the decoder on failure.
    #[inline]
    pub fn decode<T: Decode>(&mut self) -> Option<T> {
        if !self.valid {
            return None;
        }
        let value = T::decode(self);
        if value.is_none() {
            self.mark_invalid();
        }
        value
    }

    /// Whether every read so far has succeeded.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Poison the decoder; all further reads fail.
    #[inline]
    pub fn mark_invalid(&mut self) {
        self.valid = false;
    }

    /// Current read offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left before the logical end.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.position)
    }

    /// Whether the buffer can still satisfy an aligned read of `size` bytes.
    pub fn buffer_is_large_enough_to_contain(&self, alignment: usize, size: usize) -> bool {
        let start = align_up(self.position, alignment);
        start <= self.end && self.end - start >= size
    }

    /// Take `size` bytes after aligning the cursor, or fail.
    pub fn take_aligned(&mut self, alignment: usize, size: usize) -> Option<&[u8]> {
        if !self.valid || !self.buffer_is_large_enough_to_contain(alignment, size) {
            self.mark_invalid();
            return None;
        }
        let start = align_up(self.position, alignment);
        self.position = start + size;
        self.buffer.get(start..start + size)
    }

    /// Take exactly `N` bytes as an array.
    #[inline]
    pub(crate) fn take_array<const N: usize>(&mut self, alignment: usize) -> Option<[u8; N]> {
        let bytes = self.take_aligned(alignment, N)?;
        <[u8; N]>::try_from(bytes).ok()
    }

    /// Fill `out` from the buffer after aligning the cursor.
    pub fn decode_fixed_length_data(&mut self, out: &mut [u8], alignment: usize) -> bool {
        match self.take_aligned(alignment, out.len()) {
            Some(bytes) => {
                out.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Read a 64-bit length and then that many bytes.
    ///
    /// The returned `Bytes` shares the decoder's buffer; nothing is copied.
    /// A claimed length larger than what is left is rejected before any
    /// allocation happens.
    pub fn decode_variable_length_bytes(&mut self) -> Option<Bytes> {
        let length = self.decode::<u64>()?;
        let length = match usize::try_from(length) {
            Ok(length) if length <= self.remaining() => length,
            _ => {
                self.mark_invalid();
                return None;
            }
        };
        let start = self.position;
        self.position += length;
        Some(self.buffer.slice(start..start + length))
    }

    /// Pop the next attachment in push order.
    pub fn take_attachment(&mut self) -> Option<Attachment> {
        if !self.valid {
            return None;
        }
        let attachment = self.attachments.pop();
        if attachment.is_none() {
            self.mark_invalid();
        }
        attachment
    }

    /// Number of attachments not yet taken.
    #[inline]
    pub fn remaining_attachments(&self) -> usize {
        self.attachments.len()
    }

    /// Attachments in their stored (stack) order; the last one is taken next.
    #[inline]
    pub fn attachment_stack(&self) -> &[Attachment] {
        &self.attachments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::OolMemory;
    use crate::codec::Encoder;

    #[test]
    fn test_read_past_end_poisons_decoder() {
        let mut decoder = Decoder::new(vec![1u8, 2, 3]);
        assert!(decoder.decode::<u32>().is_none());
        assert!(!decoder.is_valid());

        // Even a read that would fit now fails
        assert!(decoder.decode::<u8>().is_none());
    }

    #[test]
    fn test_alignment_mirrors_encoder() {
        let mut encoder = Encoder::new();
        encoder.encode(3u8);
        encoder.encode(0xDEAD_BEEF_u32);
        encoder.encode(0x1122_3344_5566_7788_u64);
        let (body, _) = encoder.into_parts();

        let mut decoder = Decoder::new(body);
        assert_eq!(decoder.decode::<u8>(), Some(3));
        assert_eq!(decoder.decode::<u32>(), Some(0xDEAD_BEEF));
        assert_eq!(decoder.decode::<u64>(), Some(0x1122_3344_5566_7788));
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn test_huge_claimed_length_is_rejected_without_allocation() {
        let mut body = vec![0u8; 200];
        body[..8].copy_from_slice(&(1u64 << 40).to_ne_bytes());

        let mut decoder = Decoder::new(body);
        assert!(decoder.decode_variable_length_bytes().is_none());
        assert!(!decoder.is_valid());
    }

    #[test]
    fn test_variable_length_bytes_share_the_buffer() {
        let mut encoder = Encoder::new();
        encoder.encode_variable_length_bytes(b"payload");
        let (body, _) = encoder.into_parts();
        let body = Bytes::from(body);

        let mut decoder = Decoder::new(body.clone());
        let bytes = decoder.decode_variable_length_bytes().unwrap();
        assert_eq!(&bytes[..], b"payload");
        assert_eq!(bytes.as_ptr(), body[8..].as_ptr());
    }

    fn ool(tag: u8) -> Attachment {
        Attachment::OolMemory(OolMemory::new(Bytes::from(vec![tag])))
    }

    fn tag_of(attachment: &Attachment) -> u8 {
        match attachment {
            Attachment::OolMemory(memory) => memory.data()[0],
            other => panic!("unexpected attachment {:?}", other.kind()),
        }
    }

    #[test]
    fn test_attachments_come_back_in_push_order() {
        let mut decoder = Decoder::with_attachments(Vec::new(), vec![ool(b'A'), ool(b'B')]);

        // Stored as a stack: [B, A]
        let stored: Vec<u8> = decoder.attachment_stack().iter().map(tag_of).collect();
        assert_eq!(stored, vec![b'B', b'A']);

        assert_eq!(tag_of(&decoder.take_attachment().unwrap()), b'A');
        assert_eq!(tag_of(&decoder.take_attachment().unwrap()), b'B');
        assert!(decoder.take_attachment().is_none());
        assert!(!decoder.is_valid());
    }
}
