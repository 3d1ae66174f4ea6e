// src/core/snapshot/encodings.rs

//! Parsers for the packed value encodings that appear inside RDB streams:
//! the RDB length encoding itself, integer-encoded and LZF-compressed
//! strings, and the ziplist/listpack/intset/zipmap container formats.
//!
//! All parsers work on an in-memory `Bytes` cursor; the containers arrive as
//! one length-prefixed string inside the stream.

use crate::core::RiptideError;
use bytes::{Buf, Bytes};

/// A decoded RDB length field: either a plain length or a special-encoding
/// marker (the `11xxxxxx` form) whose low bits select an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdbLength {
    Plain(u64),
    Special(u8),
}

const SPECIAL_INT8: u8 = 0;
const SPECIAL_INT16: u8 = 1;
const SPECIAL_INT32: u8 = 2;
const SPECIAL_LZF: u8 = 3;

fn need(cursor: &Bytes, n: usize, what: &str) -> Result<(), RiptideError> {
    if cursor.remaining() < n {
        return Err(RiptideError::Protocol(format!(
            "truncated RDB data: need {n} byte(s) for {what}"
        )));
    }
    Ok(())
}

/// Reads an RDB length field, including the special-encoding form.
pub fn read_length_or_special(cursor: &mut Bytes) -> Result<RdbLength, RiptideError> {
    need(cursor, 1, "length byte")?;
    let first_byte = cursor.get_u8();
    match (first_byte & 0xC0) >> 6 {
        0b00 => Ok(RdbLength::Plain(u64::from(first_byte & 0x3F))),
        0b01 => {
            need(cursor, 1, "14-bit length")?;
            let next_byte = cursor.get_u8();
            Ok(RdbLength::Plain(u64::from(
                ((first_byte as u16 & 0x3F) << 8) | next_byte as u16,
            )))
        }
        0b10 => match first_byte & 0x3F {
            0 => {
                need(cursor, 4, "32-bit length")?;
                Ok(RdbLength::Plain(u64::from(cursor.get_u32())))
            }
            1 => {
                need(cursor, 8, "64-bit length")?;
                Ok(RdbLength::Plain(cursor.get_u64()))
            }
            other => Err(RiptideError::Protocol(format!(
                "unknown RDB length format {other:#04x}"
            ))),
        },
        0b11 => Ok(RdbLength::Special(first_byte & 0x3F)),
        _ => unreachable!(),
    }
}

/// Reads an RDB length field, rejecting the special-encoding form.
pub fn read_length(cursor: &mut Bytes) -> Result<u64, RiptideError> {
    match read_length_or_special(cursor)? {
        RdbLength::Plain(len) => Ok(len),
        RdbLength::Special(enc) => Err(RiptideError::Protocol(format!(
            "special string encoding {enc:#04x} where a plain length was expected"
        ))),
    }
}

/// Reads an RDB string, resolving integer and LZF special encodings into
/// their raw byte form.
pub fn read_string(cursor: &mut Bytes) -> Result<Bytes, RiptideError> {
    match read_length_or_special(cursor)? {
        RdbLength::Plain(len) => {
            let len = len as usize;
            need(cursor, len, "string payload")?;
            Ok(cursor.split_to(len))
        }
        RdbLength::Special(SPECIAL_INT8) => {
            need(cursor, 1, "int8 string")?;
            Ok(Bytes::from((cursor.get_i8() as i64).to_string()))
        }
        RdbLength::Special(SPECIAL_INT16) => {
            need(cursor, 2, "int16 string")?;
            Ok(Bytes::from((cursor.get_i16_le() as i64).to_string()))
        }
        RdbLength::Special(SPECIAL_INT32) => {
            need(cursor, 4, "int32 string")?;
            Ok(Bytes::from((cursor.get_i32_le() as i64).to_string()))
        }
        RdbLength::Special(SPECIAL_LZF) => {
            let compressed_len = read_length(cursor)? as usize;
            let uncompressed_len = read_length(cursor)? as usize;
            need(cursor, compressed_len, "LZF payload")?;
            let compressed = cursor.split_to(compressed_len);
            let out = lzf_decompress(&compressed, uncompressed_len)?;
            Ok(Bytes::from(out))
        }
        RdbLength::Special(other) => Err(RiptideError::Protocol(format!(
            "unknown special string encoding {other:#04x}"
        ))),
    }
}

/// Decompresses an LZF block into exactly `expected_len` bytes.
pub fn lzf_decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>, RiptideError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0usize;

    while i < input.len() {
        let ctrl = input[i] as usize;
        i += 1;
        if ctrl < 32 {
            // Literal run of ctrl + 1 bytes.
            let run = ctrl + 1;
            if i + run > input.len() {
                return Err(RiptideError::Protocol("LZF literal run overruns input".into()));
            }
            out.extend_from_slice(&input[i..i + run]);
            i += run;
        } else {
            // Back reference.
            let mut len = ctrl >> 5;
            if len == 7 {
                if i >= input.len() {
                    return Err(RiptideError::Protocol("LZF length byte missing".into()));
                }
                len += input[i] as usize;
                i += 1;
            }
            if i >= input.len() {
                return Err(RiptideError::Protocol("LZF offset byte missing".into()));
            }
            let offset = ((ctrl & 0x1F) << 8) | input[i] as usize;
            i += 1;
            let Some(mut reference) = out.len().checked_sub(offset + 1) else {
                return Err(RiptideError::Protocol("LZF back reference before start".into()));
            };
            // The copy may overlap its own output, so go byte by byte.
            for _ in 0..len + 2 {
                let byte = out[reference];
                out.push(byte);
                reference += 1;
            }
        }
    }

    if out.len() != expected_len {
        return Err(RiptideError::Protocol(format!(
            "LZF decompressed to {} byte(s), expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}

// --- Ziplist ---

/// Parses a ziplist blob into its elements, integers rendered in decimal.
pub fn parse_ziplist(blob: Bytes) -> Result<Vec<Bytes>, RiptideError> {
    let mut cursor = blob;
    need(&cursor, 11, "ziplist header")?;
    cursor.advance(4); // zlbytes
    cursor.advance(4); // zltail
    let declared = cursor.get_u16_le() as usize;

    let mut elements = Vec::with_capacity(if declared == u16::MAX as usize {
        16
    } else {
        declared
    });

    loop {
        need(&cursor, 1, "ziplist entry")?;
        if cursor[0] == 0xFF {
            break;
        }

        // prevlen: 1 byte, or 0xFE followed by 4 bytes.
        if cursor[0] == 0xFE {
            need(&cursor, 5, "ziplist prevlen")?;
            cursor.advance(5);
        } else {
            cursor.advance(1);
        }

        need(&cursor, 1, "ziplist encoding byte")?;
        let enc = cursor.get_u8();
        let element = match enc >> 6 {
            0b00 => {
                let len = (enc & 0x3F) as usize;
                need(&cursor, len, "ziplist short string")?;
                cursor.split_to(len)
            }
            0b01 => {
                need(&cursor, 1, "ziplist 14-bit string length")?;
                let len = (((enc as usize) & 0x3F) << 8) | cursor.get_u8() as usize;
                need(&cursor, len, "ziplist medium string")?;
                cursor.split_to(len)
            }
            0b10 => {
                need(&cursor, 4, "ziplist 32-bit string length")?;
                let len = cursor.get_u32() as usize;
                need(&cursor, len, "ziplist long string")?;
                cursor.split_to(len)
            }
            0b11 => {
                let value: i64 = match enc {
                    0xC0 => {
                        need(&cursor, 2, "ziplist int16")?;
                        cursor.get_i16_le() as i64
                    }
                    0xD0 => {
                        need(&cursor, 4, "ziplist int32")?;
                        cursor.get_i32_le() as i64
                    }
                    0xE0 => {
                        need(&cursor, 8, "ziplist int64")?;
                        cursor.get_i64_le()
                    }
                    0xF0 => {
                        need(&cursor, 3, "ziplist int24")?;
                        let mut raw = [0u8; 4];
                        raw[..3].copy_from_slice(&cursor.split_to(3));
                        (i32::from_le_bytes(raw) << 8) as i64 >> 8
                    }
                    0xFE => {
                        need(&cursor, 1, "ziplist int8")?;
                        cursor.get_i8() as i64
                    }
                    0xF1..=0xFD => (enc & 0x0F) as i64 - 1,
                    other => {
                        return Err(RiptideError::Protocol(format!(
                            "unknown ziplist encoding {other:#04x}"
                        )));
                    }
                };
                Bytes::from(value.to_string())
            }
            _ => unreachable!(),
        };
        elements.push(element);
    }

    Ok(elements)
}

// --- Listpack ---

/// Parses a listpack blob into its elements, integers rendered in decimal.
pub fn parse_listpack(blob: Bytes) -> Result<Vec<Bytes>, RiptideError> {
    let mut cursor = blob;
    need(&cursor, 7, "listpack header")?;
    cursor.advance(4); // total bytes
    let declared = cursor.get_u16_le() as usize;

    let mut elements = Vec::with_capacity(if declared == u16::MAX as usize {
        16
    } else {
        declared
    });

    loop {
        need(&cursor, 1, "listpack entry")?;
        let first = cursor[0];
        if first == 0xFF {
            break;
        }

        // (element bytes consumed, produced value)
        let (entry_len, element): (usize, Bytes) = if first & 0x80 == 0 {
            // 7-bit unsigned immediate.
            cursor.advance(1);
            (1, Bytes::from((first as u64).to_string()))
        } else if first & 0xC0 == 0x80 {
            // Short string, 6-bit length.
            let len = (first & 0x3F) as usize;
            cursor.advance(1);
            need(&cursor, len, "listpack short string")?;
            (1 + len, cursor.split_to(len))
        } else if first & 0xE0 == 0xC0 {
            // 13-bit signed integer.
            need(&cursor, 2, "listpack int13")?;
            cursor.advance(1);
            let second = cursor.get_u8();
            let raw = (((first as i32) & 0x1F) << 8) | second as i32;
            // Sign-extend from 13 bits.
            let value = (raw << 19) >> 19;
            (2, Bytes::from(value.to_string()))
        } else {
            match first {
                0xF1 => {
                    need(&cursor, 3, "listpack int16")?;
                    cursor.advance(1);
                    (3, Bytes::from(cursor.get_i16_le().to_string()))
                }
                0xF2 => {
                    need(&cursor, 4, "listpack int24")?;
                    cursor.advance(1);
                    let mut raw = [0u8; 4];
                    raw[..3].copy_from_slice(&cursor.split_to(3));
                    let value = (i32::from_le_bytes(raw) << 8) >> 8;
                    (4, Bytes::from(value.to_string()))
                }
                0xF3 => {
                    need(&cursor, 5, "listpack int32")?;
                    cursor.advance(1);
                    (5, Bytes::from(cursor.get_i32_le().to_string()))
                }
                0xF4 => {
                    need(&cursor, 9, "listpack int64")?;
                    cursor.advance(1);
                    (9, Bytes::from(cursor.get_i64_le().to_string()))
                }
                0xF0 => {
                    need(&cursor, 5, "listpack 32-bit string length")?;
                    cursor.advance(1);
                    let len = cursor.get_u32_le() as usize;
                    need(&cursor, len, "listpack long string")?;
                    (5 + len, cursor.split_to(len))
                }
                enc if enc & 0xF0 == 0xE0 => {
                    // 12-bit string length.
                    need(&cursor, 2, "listpack 12-bit string length")?;
                    cursor.advance(1);
                    let second = cursor.get_u8();
                    let len = (((enc as usize) & 0x0F) << 8) | second as usize;
                    need(&cursor, len, "listpack medium string")?;
                    (2 + len, cursor.split_to(len))
                }
                other => {
                    return Err(RiptideError::Protocol(format!(
                        "unknown listpack encoding {other:#04x}"
                    )));
                }
            }
        };

        // Skip the backlen field that lets listpacks be walked backwards.
        let backlen = backlen_size(entry_len);
        need(&cursor, backlen, "listpack backlen")?;
        cursor.advance(backlen);

        elements.push(element);
    }

    Ok(elements)
}

/// Number of bytes the listpack backlen field occupies for an entry of
/// `entry_len` bytes.
fn backlen_size(entry_len: usize) -> usize {
    match entry_len {
        0..=127 => 1,
        128..=16383 => 2,
        16384..=2097151 => 3,
        2097152..=268435455 => 4,
        _ => 5,
    }
}

// --- Intset ---

/// Parses an intset blob into its elements rendered in decimal.
pub fn parse_intset(blob: Bytes) -> Result<Vec<Bytes>, RiptideError> {
    let mut cursor = blob;
    need(&cursor, 8, "intset header")?;
    let encoding = cursor.get_u32_le();
    let length = cursor.get_u32_le() as usize;

    let mut elements = Vec::with_capacity(length);
    for _ in 0..length {
        let value: i64 = match encoding {
            2 => {
                need(&cursor, 2, "intset int16")?;
                cursor.get_i16_le() as i64
            }
            4 => {
                need(&cursor, 4, "intset int32")?;
                cursor.get_i32_le() as i64
            }
            8 => {
                need(&cursor, 8, "intset int64")?;
                cursor.get_i64_le()
            }
            other => {
                return Err(RiptideError::Protocol(format!(
                    "unknown intset encoding {other}"
                )));
            }
        };
        elements.push(Bytes::from(value.to_string()));
    }
    Ok(elements)
}

// --- Zipmap ---

/// Parses a legacy zipmap blob into field/value pairs.
pub fn parse_zipmap(blob: Bytes) -> Result<Vec<(Bytes, Bytes)>, RiptideError> {
    let mut cursor = blob;
    need(&cursor, 1, "zipmap header")?;
    cursor.advance(1); // zmlen; unreliable above 253, so parse to the end marker

    let mut pairs = Vec::new();
    loop {
        need(&cursor, 1, "zipmap entry")?;
        if cursor[0] == 0xFF {
            break;
        }
        let key_len = zipmap_len(&mut cursor)?;
        need(&cursor, key_len, "zipmap key")?;
        let key = cursor.split_to(key_len);

        let value_len = zipmap_len(&mut cursor)?;
        need(&cursor, 1, "zipmap free byte")?;
        let free = cursor.get_u8() as usize;
        need(&cursor, value_len + free, "zipmap value")?;
        let value = cursor.split_to(value_len);
        cursor.advance(free);

        pairs.push((key, value));
    }
    Ok(pairs)
}

fn zipmap_len(cursor: &mut Bytes) -> Result<usize, RiptideError> {
    need(cursor, 1, "zipmap length byte")?;
    let first = cursor.get_u8();
    if first < 254 {
        Ok(first as usize)
    } else if first == 254 {
        need(cursor, 4, "zipmap 32-bit length")?;
        Ok(cursor.get_u32_le() as usize)
    } else {
        Err(RiptideError::Protocol("unexpected zipmap length byte 0xFF".into()))
    }
}
