//! `Encode`/`Decode` for primitives and composite standard types.
//!
//! Composites are written purely in terms of primitive operations:
//! - sequences: `u64` count, then each element
//! - maps: `u64` count, then key/value pairs; duplicate keys are rejected
//! - `Option<T>`: `bool` presence flag, then the value
//! - strings and byte ranges: `u64` length, then raw bytes

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::mem::{align_of, size_of};

use bytes::Bytes;

use super::{Decode, Decoder, Encode, Encoder};

/// Alignment used on the wire for a primitive: `min(size, natural alignment)`.
const fn primitive_alignment<T>() -> usize {
    let size = size_of::<T>();
    let align = align_of::<T>();
    if size < align {
        size
    } else {
        align
    }
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {$(
        impl Encode for $ty {
            #[inline]
            fn encode(self, encoder: &mut Encoder) {
                encoder.encode_fixed_length_data(&self.to_ne_bytes(), primitive_alignment::<$ty>());
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode(decoder: &mut Decoder) -> Option<Self> {
                decoder
                    .take_array(primitive_alignment::<$ty>())
                    .map(<$ty>::from_ne_bytes)
            }
        }
    )*};
}

impl_primitive!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Encode for bool {
    #[inline]
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(u8::from(self));
    }
}

impl Decode for bool {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        match decoder.decode::<u8>()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }
}

// Pointer-width agnostic only by convention: always 64 bits on the wire.
impl Encode for usize {
    #[inline]
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self as u64);
    }
}

impl Decode for usize {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        usize::try_from(decoder.decode::<u64>()?).ok()
    }
}

impl Encode for &[u8] {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_variable_length_bytes(self);
    }
}

impl Encode for Bytes {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_variable_length_bytes(&self);
    }
}

impl Decode for Bytes {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        decoder.decode_variable_length_bytes()
    }
}

impl Encode for &str {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_variable_length_bytes(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode_variable_length_bytes(self.as_bytes());
    }
}

impl Decode for String {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let bytes = decoder.decode_variable_length_bytes()?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(self, encoder: &mut Encoder) {
        match self {
            Some(value) => {
                encoder.encode(true);
                encoder.encode(value);
            }
            None => encoder.encode(false),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        if decoder.decode::<bool>()? {
            decoder.decode::<T>().map(Some)
        } else {
            Some(None)
        }
    }
}

/// Read a sequence count that cannot claim more elements than bytes remain.
fn decode_count(decoder: &mut Decoder) -> Option<usize> {
    let count = decoder.decode::<u64>()?;
    usize::try_from(count)
        .ok()
        .filter(|&count| count <= decoder.remaining())
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self.len() as u64);
        for item in self {
            encoder.encode(item);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let count = decode_count(decoder)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(decoder.decode::<T>()?);
        }
        Some(items)
    }
}

impl<K: Encode, V: Encode, S> Encode for HashMap<K, V, S> {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self.len() as u64);
        for (key, value) in self {
            encoder.encode(key);
            encoder.encode(value);
        }
    }
}

impl<K: Decode + Eq + Hash, V: Decode> Decode for HashMap<K, V> {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let count = decode_count(decoder)?;
        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = decoder.decode::<K>()?;
            let value = decoder.decode::<V>()?;
            if map.insert(key, value).is_some() {
                return None;
            }
        }
        Some(map)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self.len() as u64);
        for (key, value) in self {
            encoder.encode(key);
            encoder.encode(value);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let count = decode_count(decoder)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = decoder.decode::<K>()?;
            let value = decoder.decode::<V>()?;
            if map.insert(key, value).is_some() {
                return None;
            }
        }
        Some(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Encode + Decode>(value: T) -> Option<T> {
        let mut encoder = Encoder::new();
        encoder.encode(value);
        let (body, _) = encoder.into_parts();
        let mut decoder = Decoder::new(body);
        let decoded = decoder.decode::<T>();
        assert_eq!(decoder.remaining(), 0);
        decoded
    }

    #[test]
    fn test_integers_and_floats() {
        assert_eq!(round_trip(u8::MAX), Some(u8::MAX));
        assert_eq!(round_trip(-12345i32), Some(-12345));
        assert_eq!(round_trip(u64::MAX), Some(u64::MAX));
        assert_eq!(round_trip(i64::MIN), Some(i64::MIN));
        assert_eq!(round_trip(2.5f32), Some(2.5));
        assert_eq!(round_trip(-0.125f64), Some(-0.125));
        assert_eq!(round_trip(usize::MAX), Some(usize::MAX));
    }

    #[test]
    fn test_bool_rejects_other_bytes() {
        assert_eq!(round_trip(true), Some(true));
        assert_eq!(round_trip(false), Some(false));

        let mut decoder = Decoder::new(vec![2u8]);
        assert_eq!(decoder.decode::<bool>(), None);
    }

    #[test]
    fn test_strings() {
        assert_eq!(round_trip(String::from("héllo")), Some(String::from("héllo")));
        assert_eq!(round_trip(String::new()), Some(String::new()));

        let mut encoder = Encoder::new();
        encoder.encode(&[0xFFu8, 0xFE][..]);
        let (body, _) = encoder.into_parts();
        assert_eq!(Decoder::new(body).decode::<String>(), None);
    }

    #[test]
    fn test_option_and_vec() {
        assert_eq!(round_trip(Some(7u16)), Some(Some(7)));
        assert_eq!(round_trip(None::<u16>), Some(None));
        assert_eq!(
            round_trip(vec![String::from("a"), String::from("bc")]),
            Some(vec![String::from("a"), String::from("bc")])
        );
        assert_eq!(round_trip(Vec::<u32>::new()), Some(Vec::new()));
    }

    #[test]
    fn test_vec_count_larger_than_buffer_is_rejected() {
        let mut encoder = Encoder::new();
        encoder.encode(1u64 << 40);
        encoder.encode(1u8);
        let (body, _) = encoder.into_parts();

        assert_eq!(Decoder::new(body).decode::<Vec<u8>>(), None);
    }

    #[test]
    fn test_maps_round_trip() {
        let mut map = HashMap::new();
        map.insert(String::from("one"), 1u32);
        map.insert(String::from("two"), 2u32);
        assert_eq!(round_trip(map.clone()), Some(map));

        let mut tree = BTreeMap::new();
        tree.insert(3u8, vec![1u64, 2]);
        assert_eq!(round_trip(tree.clone()), Some(tree));
    }

    #[test]
    fn test_map_with_duplicate_key_is_rejected() {
        let mut encoder = Encoder::new();
        encoder.encode(2u64);
        encoder.encode(5u32);
        encoder.encode(10u32);
        encoder.encode(5u32);
        encoder.encode(20u32);
        let (body, _) = encoder.into_parts();

        assert_eq!(Decoder::new(body.clone()).decode::<HashMap<u32, u32>>(), None);
        assert_eq!(Decoder::new(body).decode::<BTreeMap<u32, u32>>(), None);
    }

    #[test]
    fn test_bytes_round_trip() {
        let bytes = Bytes::from_static(b"\x00\x01\x02");
        assert_eq!(round_trip(bytes.clone()), Some(bytes));
    }
}
