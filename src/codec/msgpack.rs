//! MsgPack argument slot using `rmp-serde`.
//!
//! Lets a serde record ride inside a typed argument tuple as one
//! length-prefixed byte range. Serialization happens up front in
//! [`MsgPack::new`], so encoding the slot itself cannot fail.
//!
//! Always `to_vec_named`: structs are written as maps so that adding a field
//! on one side does not silently shift positional fields on the other.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::codec::{Decoder, Encoder, MsgPack};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
//! struct Cookie {
//!     name: String,
//!     secure: bool,
//! }
//!
//! let cookie = Cookie { name: "sid".into(), secure: true };
//! let mut encoder = Encoder::new();
//! encoder.encode((42u64, MsgPack::new(cookie.clone()).unwrap()));
//! let (body, _) = encoder.into_parts();
//!
//! let mut decoder = Decoder::new(body);
//! let (id, record): (u64, MsgPack<Cookie>) = decoder.decode().unwrap();
//! assert_eq!(id, 42);
//! assert_eq!(record.into_inner(), cookie);
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Decode, Decoder, Encode, Encoder};
use crate::error::Result;

/// A serde value carried as a MsgPack blob.
#[derive(Debug, Clone)]
pub struct MsgPack<T> {
    value: T,
    bytes: Bytes,
}

impl<T: Serialize> MsgPack<T> {
    /// Serialize `value` into a slot ready to encode.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn new(value: T) -> Result<Self> {
        // CRITICAL: to_vec_named, NOT to_vec!
        let bytes = rmp_serde::to_vec_named(&value)?;
        Ok(Self {
            value,
            bytes: Bytes::from(bytes),
        })
    }
}

impl<T> MsgPack<T> {
    /// Serialized bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Borrow the carried value.
    #[inline]
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Take the carried value.
    #[inline]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Encode for MsgPack<T> {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_variable_length_bytes(&self.bytes);
    }
}

impl<T: DeserializeOwned> Decode for MsgPack<T> {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let bytes = decoder.decode_variable_length_bytes()?;
        let value = rmp_serde::from_slice(&bytes).ok()?;
        Some(Self { value, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
    struct HistoryItem {
        url: String,
        visits: u32,
    }

    #[test]
    fn test_record_round_trip() {
        let item = HistoryItem {
            url: "https://example.org".to_string(),
            visits: 3,
        };

        let mut encoder = Encoder::new();
        encoder.encode(MsgPack::new(item.clone()).unwrap());
        let (body, _) = encoder.into_parts();

        let decoded: MsgPack<HistoryItem> = Decoder::new(body).decode().unwrap();
        assert_eq!(decoded.get(), &item);
        assert_eq!(decoded.into_inner(), item);
    }

    #[test]
    fn test_struct_written_as_map() {
        let item = HistoryItem {
            url: "x".to_string(),
            visits: 1,
        };
        let slot = MsgPack::new(item.clone()).unwrap();

        // fixmap with 2 entries
        assert_eq!(slot.as_bytes()[0], 0x82);
    }

    #[test]
    fn test_garbage_fails_decode() {
        let mut encoder = Encoder::new();
        encoder.encode(&b"\xc1not msgpack"[..]);
        let (body, _) = encoder.into_parts();

        let mut decoder = Decoder::new(body);
        assert!(decoder.decode::<MsgPack<HistoryItem>>().is_none());
        assert!(!decoder.is_valid());
    }
}
