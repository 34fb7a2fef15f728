//! Codec module - typed argument encoding for message bodies.
//!
//! Values are written into an [`Encoder`] and read back from a [`Decoder`]
//! in the same order and with the same static types on both sides. There is
//! no schema on the wire:
//!
//! - primitives are written in native byte order, aligned to
//!   `min(size, natural alignment)` relative to the start of the body
//! - byte ranges and strings are a `u64` length followed by the bytes
//! - OS resources (ports, descriptors, memory) go to a side list of
//!   attachments, never into the byte stream
//!
//! # Design
//!
//! [`Encode::encode`] takes `self` by value. Encoding a resource moves it out
//! of the sender, so a capability that was promised to the peer cannot also
//! stay usable locally. [`Decode::decode`] returns `None` on any failure, and
//! the decoder refuses every read after the first failure.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::codec::{Decoder, Encoder};
//!
//! let mut encoder = Encoder::new();
//! encoder.encode((7u32, true, "name"));
//! let (body, attachments) = encoder.into_parts();
//! assert!(attachments.is_empty());
//!
//! let mut decoder = Decoder::new(body);
//! let (id, flag, name): (u32, bool, String) = decoder.decode().unwrap();
//! assert_eq!((id, flag, name.as_str()), (7, true, "name"));
//! ```

mod decoder;
mod encoder;
mod msgpack;
mod primitives;
mod tuples;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use msgpack::MsgPack;

/// A value that can write itself into an [`Encoder`].
pub trait Encode {
    /// Append `self` to the encoder, consuming it.
    fn encode(self, encoder: &mut Encoder);
}

/// A value that can read itself back from a [`Decoder`].
pub trait Decode: Sized {
    /// Read one value, or `None` if the bytes do not describe one.
    fn decode(decoder: &mut Decoder) -> Option<Self>;
}
