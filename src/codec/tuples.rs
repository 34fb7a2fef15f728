//! Typed argument tuples.
//!
//! A message's arguments are a plain Rust tuple of arity 0 through 10. Slots
//! are written and read in declared order; there is no type descriptor on the
//! wire, only position and the static types both endpoints were built with.
//! Tuples nest, so `(u32, (bool, String))` is a valid slot layout too.

use super::{Decode, Decoder, Encode, Encoder};

macro_rules! impl_tuple {
    ($($name:ident)*) => {
        impl<$($name: Encode),*> Encode for ($($name,)*) {
            #[allow(non_snake_case, unused_variables)]
            #[inline]
            fn encode(self, encoder: &mut Encoder) {
                let ($($name,)*) = self;
                $(encoder.encode($name);)*
            }
        }

        impl<$($name: Decode),*> Decode for ($($name,)*) {
            #[allow(unused_variables)]
            #[inline]
            fn decode(decoder: &mut Decoder) -> Option<Self> {
                Some(($(decoder.decode::<$name>()?,)*))
            }
        }
    };
}

impl_tuple!();
impl_tuple!(A);
impl_tuple!(A B);
impl_tuple!(A B C);
impl_tuple!(A B C D);
impl_tuple!(A B C D E);
impl_tuple!(A B C D E F);
impl_tuple!(A B C D E F G);
impl_tuple!(A B C D E F G H);
impl_tuple!(A B C D E F G H I);
impl_tuple!(A B C D E F G H I J);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_slot_tuple_across_loopback_buffer() {
        let mut encoder = Encoder::new();
        encoder.encode((7u32, true));
        let (body, _) = encoder.into_parts();

        let mut decoder = Decoder::new(body);
        let decoded: (u32, bool) = decoder.decode().unwrap();
        assert_eq!(decoded, (7, true));
    }

    #[test]
    fn test_empty_tuple_encodes_nothing() {
        let mut encoder = Encoder::new();
        encoder.encode(());
        assert!(encoder.is_empty());
        assert_eq!(Decoder::new(Vec::new()).decode::<()>(), Some(()));
    }

    #[test]
    fn test_ten_slot_tuple() {
        let value = (
            1u8,
            2u16,
            3u32,
            4u64,
            -5i8,
            -6i16,
            -7i32,
            -8i64,
            String::from("nine"),
            Some(10u32),
        );

        let mut encoder = Encoder::new();
        encoder.encode(value.clone());
        let (body, _) = encoder.into_parts();

        let mut decoder = Decoder::new(body);
        assert_eq!(decoder.decode(), Some(value));
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn test_nested_tuples() {
        let value = (1u32, (true, (String::from("x"), vec![3u8, 4])));

        let mut encoder = Encoder::new();
        encoder.encode(value.clone());
        let (body, _) = encoder.into_parts();

        assert_eq!(Decoder::new(body).decode(), Some(value));
    }

    #[test]
    fn test_mismatched_slot_types_fail_on_short_buffer() {
        let mut encoder = Encoder::new();
        encoder.encode((1u8, 2u8));
        let (body, _) = encoder.into_parts();

        assert_eq!(Decoder::new(body).decode::<(u8, u64)>(), None);
    }
}
