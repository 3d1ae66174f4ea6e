// tests/property/routing_test.rs

use bytes::Bytes;
use proptest::prelude::*;
use riptide::core::cluster::slot::{NUM_SLOTS, get_slot, hash_tag};

/// A reference CRC16/XMODEM implementation, bit by bit, to check the table
/// driven one the router uses.
fn crc16_reference(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

proptest! {
    #[test]
    fn slot_is_always_in_range(key in proptest::collection::vec(any::<u8>(), 0..64)) {
        let slot = get_slot(&Bytes::from(key));
        prop_assert!((slot as usize) < NUM_SLOTS);
    }

    #[test]
    fn slot_matches_the_reference_crc(key in proptest::collection::vec(any::<u8>(), 0..64)) {
        let expected = crc16_reference(hash_tag(&key)) % NUM_SLOTS as u16;
        prop_assert_eq!(get_slot(&Bytes::from(key)), expected);
    }

    #[test]
    fn tagged_keys_collapse_to_the_tag(
        prefix in "[a-z]{0,8}",
        tag in "[a-z0-9]{1,16}",
        suffix in "[a-z]{0,8}",
    ) {
        let tagged = format!("{prefix}{{{tag}}}{suffix}");
        prop_assert_eq!(
            get_slot(&Bytes::from(tagged)),
            get_slot(&Bytes::from(tag))
        );
    }

    #[test]
    fn keys_without_braces_hash_whole(key in "[a-z0-9:._-]{1,32}") {
        prop_assert_eq!(hash_tag(key.as_bytes()), key.as_bytes());
    }
}
