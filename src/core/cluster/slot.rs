// src/core/cluster/slot.rs

//! Implements the Redis Cluster hash slot algorithm.

use bytes::Bytes;
use crc::{CRC_16_XMODEM, Crc};

/// The total number of hash slots in a Redis Cluster.
pub const NUM_SLOTS: usize = 16384;

/// Redis Cluster computes slots with CRC16/XMODEM.
const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Extracts the hash tag of a key, per the Redis Cluster specification.
///
/// If the key contains a `{...}` pair with at least one character between the
/// braces, only that substring participates in the slot hash. This is what
/// lets users force related keys into one slot. A key like `user:{}` has an
/// empty tag and hashes as a whole.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{')
        && let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}')
    {
        // Ensure the tag is not empty, e.g., "user:{}".
        if end_offset > 0 {
            return &key[start + 1..start + 1 + end_offset];
        }
    }
    key
}

/// Calculates the hash slot for a given key: `CRC16(hash_tag(key)) % 16384`.
pub fn get_slot(key: &Bytes) -> u16 {
    CRC16_ALGO.checksum(hash_tag(key)) % (NUM_SLOTS as u16)
}
