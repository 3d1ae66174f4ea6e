// tests/common/mod.rs

//! Shared fixtures for the integration-style tests: a minimal RESP command
//! reader/writer for fake peers, and builders for RDB and journal byte
//! streams.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use riptide::core::journal::codec::{self, JournalEntry};
use riptide::core::protocol::{RespFrame, RespFrameCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

/// Reads one RESP frame from a fake peer's socket.
pub async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<RespFrame> {
    let mut codec = RespFrameCodec;
    loop {
        if let Ok(Some(frame)) = codec.decode(buf) {
            return Some(frame);
        }
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Reads one command (array of bulk strings) and renders the args as owned
/// byte vectors.
pub async fn read_command(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Vec<Vec<u8>>> {
    match read_frame(stream, buf).await? {
        RespFrame::Array(parts) => Some(
            parts
                .into_iter()
                .map(|p| match p {
                    RespFrame::BulkString(b) => b.to_vec(),
                    RespFrame::SimpleString(s) => s.into_bytes(),
                    RespFrame::Integer(i) => i.to_string().into_bytes(),
                    _ => Vec::new(),
                })
                .collect(),
        ),
        _ => None,
    }
}

pub async fn write_frame(stream: &mut TcpStream, frame: RespFrame) {
    let encoded = frame.encode_to_vec().expect("encodable frame");
    stream.write_all(&encoded).await.expect("writable socket");
}

pub async fn write_simple(stream: &mut TcpStream, s: &str) {
    write_frame(stream, RespFrame::SimpleString(s.to_string())).await;
}

pub fn bulk(s: &str) -> RespFrame {
    RespFrame::BulkString(Bytes::copy_from_slice(s.as_bytes()))
}

// --- RDB stream builder ---

/// Writes an RDB length in the standard encoding.
pub fn put_rdb_length(buf: &mut BytesMut, len: u64) {
    if len < (1 << 6) {
        buf.put_u8(len as u8);
    } else if len < (1 << 14) {
        buf.put_u8(0x40 | (len >> 8) as u8);
        buf.put_u8(len as u8);
    } else if len <= u64::from(u32::MAX) {
        buf.put_u8(0x80);
        buf.put_u32(len as u32);
    } else {
        buf.put_u8(0x81);
        buf.put_u64(len);
    }
}

pub fn put_rdb_string(buf: &mut BytesMut, s: &[u8]) {
    put_rdb_length(buf, s.len() as u64);
    buf.put_slice(s);
}

/// A builder for one FLOW's snapshot byte stream.
pub struct RdbStreamBuilder {
    buf: BytesMut,
}

impl RdbStreamBuilder {
    pub fn new() -> Self {
        let mut buf = BytesMut::new();
        buf.put_slice(b"REDIS0011");
        Self { buf }
    }

    pub fn select_db(mut self, db: u64) -> Self {
        self.buf.put_u8(0xFE);
        put_rdb_length(&mut self.buf, db);
        self
    }

    pub fn aux(mut self, field: &[u8], value: &[u8]) -> Self {
        self.buf.put_u8(0xFA);
        put_rdb_string(&mut self.buf, field);
        put_rdb_string(&mut self.buf, value);
        self
    }

    pub fn expire_ms(mut self, at_ms: u64) -> Self {
        self.buf.put_u8(0xFC);
        self.buf.put_u64_le(at_ms);
        self
    }

    pub fn string_entry(mut self, key: &[u8], value: &[u8]) -> Self {
        self.buf.put_u8(0x00);
        put_rdb_string(&mut self.buf, key);
        put_rdb_string(&mut self.buf, value);
        self
    }

    pub fn raw_entry(mut self, type_byte: u8, key: &[u8], payload: &[u8]) -> Self {
        self.buf.put_u8(type_byte);
        put_rdb_string(&mut self.buf, key);
        self.buf.put_slice(payload);
        self
    }

    pub fn finish(mut self, eof_token: &[u8]) -> Vec<u8> {
        self.buf.put_u8(0xFF);
        self.buf.put_slice(eof_token);
        self.buf.to_vec()
    }
}

/// Builds a listpack blob out of short (< 64 byte) string elements.
pub fn build_listpack(elements: &[&[u8]]) -> Vec<u8> {
    let mut body = BytesMut::new();
    for element in elements {
        assert!(element.len() < 64, "test listpack builder handles short strings only");
        body.put_u8(0x80 | element.len() as u8);
        body.put_slice(element);
        // Entry length (encoding byte + payload) always fits one backlen byte.
        body.put_u8(1 + element.len() as u8);
    }
    body.put_u8(0xFF);

    let mut blob = BytesMut::new();
    blob.put_u32_le(6 + body.len() as u32);
    blob.put_u16_le(elements.len() as u16);
    blob.put_slice(&body);
    blob.to_vec()
}

/// Builds a ziplist blob out of short (< 64 byte) string elements.
pub fn build_ziplist(elements: &[&[u8]]) -> Vec<u8> {
    let mut body = BytesMut::new();
    for element in elements {
        assert!(element.len() < 64, "test ziplist builder handles short strings only");
        body.put_u8(0); // prevlen, unused by the parser
        body.put_u8(element.len() as u8); // 6-bit string encoding
        body.put_slice(element);
    }
    body.put_u8(0xFF);

    let mut blob = BytesMut::new();
    blob.put_u32_le(11 + body.len() as u32);
    blob.put_u32_le(0);
    blob.put_u16_le(elements.len() as u16);
    blob.put_slice(&body);
    blob.to_vec()
}

/// Builds an intset blob of 16-bit values.
pub fn build_intset(values: &[i16]) -> Vec<u8> {
    let mut blob = BytesMut::new();
    blob.put_u32_le(2);
    blob.put_u32_le(values.len() as u32);
    for value in values {
        blob.put_i16_le(*value);
    }
    blob.to_vec()
}

// --- Journal stream builder ---

/// Serializes a sequence of journal entries followed by FIN.
pub fn build_journal(entries: &[JournalEntry]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for entry in entries {
        codec::encode_entry(&mut buf, entry);
    }
    codec::encode_entry(&mut buf, &JournalEntry::Fin);
    buf.to_vec()
}

/// A COMMAND journal entry from string args.
pub fn journal_command(lsn: u64, tx_id: u64, args: &[&str]) -> JournalEntry {
    JournalEntry::Command {
        lsn,
        db_index: 0,
        tx_id,
        args: args
            .iter()
            .map(|a| Bytes::copy_from_slice(a.as_bytes()))
            .collect(),
    }
}
