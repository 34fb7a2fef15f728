//! Property tests for the argument codec.

use std::os::fd::OwnedFd;

use bytes::Bytes;
use proptest::prelude::*;

use procwire_ipc::attachment::Attachment;
use procwire_ipc::codec::{Decode, Decoder, Encode, Encoder};

fn round_trip<T: Encode + Decode>(value: T) -> Option<T> {
    let mut encoder = Encoder::new();
    encoder.encode(value);
    let (body, attachments) = encoder.into_parts();
    let mut decoder = Decoder::with_attachments(body, attachments);
    let decoded = decoder.decode::<T>()?;
    assert_eq!(decoder.remaining(), 0);
    Some(decoded)
}

fn encoded<T: Encode>(value: T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.encode(value);
    encoder.into_parts().0
}

#[test]
fn test_two_slot_tuple_over_loopback() {
    let body = encoded((7u32, true));

    let mut decoder = Decoder::new(Bytes::from(body));
    let (id, flag): (u32, bool) = decoder.decode().unwrap();
    assert_eq!((id, flag), (7, true));
}

#[test]
fn test_huge_length_claim_is_rejected() {
    let mut body = encoded(1u64 << 40);
    body.resize(200, 0xAB);

    let mut decoder = Decoder::new(body);
    assert!(decoder.decode_variable_length_bytes().is_none());
    assert!(!decoder.is_valid());
    assert!(decoder.decode::<u8>().is_none());
}

#[test]
fn test_attachments_come_back_in_push_order() {
    let first = OwnedFd::from(tempfile::tempfile().unwrap());
    let second = OwnedFd::from(tempfile::tempfile().unwrap());
    let first_raw = std::os::fd::AsRawFd::as_raw_fd(&first);
    let second_raw = std::os::fd::AsRawFd::as_raw_fd(&second);

    let mut encoder = Encoder::new();
    encoder.encode((first, second));
    let (body, attachments) = encoder.into_parts();

    let mut decoder = Decoder::with_attachments(body, attachments);
    // Stored as a stack: the last pushed sits at the bottom
    let stack: Vec<_> = decoder
        .attachment_stack()
        .iter()
        .filter_map(Attachment::fd)
        .map(std::os::fd::AsRawFd::as_raw_fd)
        .collect();
    assert_eq!(stack, vec![second_raw, first_raw]);

    let (a, b): (OwnedFd, OwnedFd) = decoder.decode().unwrap();
    assert_eq!(std::os::fd::AsRawFd::as_raw_fd(&a), first_raw);
    assert_eq!(std::os::fd::AsRawFd::as_raw_fd(&b), second_raw);
}

proptest! {
    #[test]
    fn prop_integers_round_trip(a: u8, b: i16, c: u32, d: i64, e: u64) {
        prop_assert_eq!(round_trip((a, b, c, d, e)), Some((a, b, c, d, e)));
    }

    #[test]
    fn prop_floats_round_trip_bitwise(x: f32, y: f64) {
        let (rx, ry) = round_trip((x, y)).unwrap();
        prop_assert_eq!(rx.to_bits(), x.to_bits());
        prop_assert_eq!(ry.to_bits(), y.to_bits());
    }

    #[test]
    fn prop_strings_round_trip(text in ".{0,64}", tag: u8) {
        prop_assert_eq!(round_trip((tag, text.clone())), Some((tag, text)));
    }

    #[test]
    fn prop_byte_ranges_round_trip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let decoded = round_trip(Bytes::from(data.clone())).unwrap();
        prop_assert_eq!(&decoded[..], &data[..]);
    }

    #[test]
    fn prop_composites_round_trip(
        items in proptest::collection::vec(any::<u32>(), 0..32),
        maybe in proptest::option::of(any::<i32>()),
    ) {
        prop_assert_eq!(round_trip((items.clone(), maybe)), Some((items, maybe)));
    }

    #[test]
    fn prop_every_truncation_fails(a: u16, text in "[a-z]{1,16}", b: u64) {
        let body = encoded((a, text, b));
        for cut in 0..body.len() {
            let mut decoder = Decoder::new(body[..cut].to_vec());
            prop_assert!(decoder.decode::<(u16, String, u64)>().is_none());
            prop_assert!(!decoder.is_valid());
        }
    }

    #[test]
    fn prop_primitives_land_aligned(pad in 0usize..8, value: u64) {
        let mut encoder = Encoder::new();
        for _ in 0..pad {
            encoder.encode(0u8);
        }
        encoder.encode(value);
        prop_assert_eq!(encoder.len() % 8, 0);

        let (body, _) = encoder.into_parts();
        let mut decoder = Decoder::new(body);
        for _ in 0..pad {
            prop_assert_eq!(decoder.decode::<u8>(), Some(0));
        }
        prop_assert_eq!(decoder.decode::<u64>(), Some(value));
    }
}
