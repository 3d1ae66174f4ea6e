// src/core/snapshot/rdb.rs

//! The RDB stream decoder bound to one FLOW.
//!
//! Parses the standard RDB framing (magic, db selectors, expirations, value
//! types and their packed variants) plus the Dragonfly additions: the
//! compact listpack-encoded hash/set/zset tags and the EOF opcode followed
//! by the per-FLOW token negotiated at handshake. Unknown tags fail loudly;
//! guessing at framing would silently corrupt everything after the guess.

use crate::core::RiptideError;
use crate::core::snapshot::encodings::{
    RdbLength, lzf_decompress, parse_intset, parse_listpack, parse_ziplist, parse_zipmap,
};
use crate::core::snapshot::entry::{
    RdbEntry, RdbTypeTag, RdbValue, StreamEntry, StreamValue, ZSetEntry,
};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

// Standard RDB opcodes.
const OPCODE_AUX: u8 = 0xFA;
const OPCODE_RESIZEDB: u8 = 0xFB;
const OPCODE_EXPIRETIME_MS: u8 = 0xFC;
const OPCODE_EXPIRETIME: u8 = 0xFD;
const OPCODE_SELECTDB: u8 = 0xFE;
const OPCODE_EOF: u8 = 0xFF;

const RDB_MAGIC: &[u8] = b"REDIS";
const RDB_VERSION_LEN: usize = 4;

// Stream entry flags inside stream listpacks.
const STREAM_ITEM_FLAG_DELETED: i64 = 1;
const STREAM_ITEM_FLAG_SAMEFIELDS: i64 = 2;

/// What the decoder produced from the stream.
#[derive(Debug)]
pub enum RdbItem {
    /// One decoded key.
    Entry(RdbEntry),
    /// The shard's snapshot ended and its EOF token matched.
    Eof,
}

/// An incremental RDB decoder over any byte source.
pub struct RdbDecoder<R> {
    reader: R,
    buf: BytesMut,
    eof_token: Bytes,
    header_parsed: bool,
    current_db: u64,
    pending_expire_ms: Option<u64>,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> RdbDecoder<R> {
    pub fn new(reader: R, eof_token: Bytes) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(64 * 1024),
            eof_token,
            header_parsed: false,
            current_db: 0,
            pending_expire_ms: None,
            bytes_read: 0,
        }
    }

    /// Total bytes consumed from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Hands back the underlying reader together with any bytes read past
    /// the EOF token, so the journal phase can continue on the same socket
    /// without losing the journal's first records.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.reader, self.buf)
    }

    /// Decodes the next item from the stream.
    pub async fn next_item(&mut self) -> Result<RdbItem, RiptideError> {
        if !self.header_parsed {
            self.parse_header().await?;
        }

        loop {
            let opcode = self.read_u8().await?;
            match opcode {
                OPCODE_AUX => {
                    let field = self.read_string().await?;
                    let value = self.read_string().await?;
                    trace!(
                        "RDB aux field {:?} = {:?}",
                        String::from_utf8_lossy(&field),
                        String::from_utf8_lossy(&value)
                    );
                }
                OPCODE_RESIZEDB => {
                    self.read_length().await?;
                    self.read_length().await?;
                }
                OPCODE_EXPIRETIME_MS => {
                    self.pending_expire_ms = Some(self.read_u64_le().await?);
                }
                OPCODE_EXPIRETIME => {
                    let secs = self.read_u32_le().await?;
                    self.pending_expire_ms = Some(u64::from(secs) * 1000);
                }
                OPCODE_SELECTDB => {
                    self.current_db = self.read_length().await?;
                    debug!("RDB stream selected db {}", self.current_db);
                }
                OPCODE_EOF => {
                    self.verify_eof_token().await?;
                    return Ok(RdbItem::Eof);
                }
                type_byte => {
                    let entry = self.read_entry(type_byte).await?;
                    return Ok(RdbItem::Entry(entry));
                }
            }
        }
    }

    async fn parse_header(&mut self) -> Result<(), RiptideError> {
        let header = self.read_exact(RDB_MAGIC.len() + RDB_VERSION_LEN).await?;
        if &header[..RDB_MAGIC.len()] != RDB_MAGIC {
            return Err(RiptideError::Protocol(
                "FLOW stream does not start with the RDB magic".into(),
            ));
        }
        let version = String::from_utf8_lossy(&header[RDB_MAGIC.len()..]).to_string();
        debug!("RDB stream header: version {version}");
        self.header_parsed = true;
        Ok(())
    }

    /// Reads and verifies the Dragonfly EOF token that terminates the shard
    /// snapshot. A mismatch means the stream framing drifted; nothing after
    /// it can be trusted.
    async fn verify_eof_token(&mut self) -> Result<(), RiptideError> {
        if self.eof_token.is_empty() {
            return Ok(());
        }
        let token = self.read_exact(self.eof_token.len()).await?;
        if token != self.eof_token {
            return Err(RiptideError::Protocol(
                "EOF token mismatch at end of shard snapshot".into(),
            ));
        }
        Ok(())
    }

    async fn read_entry(&mut self, type_byte: u8) -> Result<RdbEntry, RiptideError> {
        let Some(type_tag) = RdbTypeTag::from_byte(type_byte) else {
            return Err(RiptideError::Protocol(format!(
                "unsupported RDB value type {type_byte:#04x}"
            )));
        };
        let key = self.read_string().await?;
        let value = self.read_value(type_tag).await?;
        Ok(RdbEntry {
            key,
            type_tag,
            value,
            expire_at_ms: self.pending_expire_ms.take(),
            db_index: self.current_db,
        })
    }

    async fn read_value(&mut self, tag: RdbTypeTag) -> Result<RdbValue, RiptideError> {
        match tag {
            RdbTypeTag::String => Ok(RdbValue::String(self.read_string().await?)),

            RdbTypeTag::List => {
                let len = self.read_length().await? as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_string().await?);
                }
                Ok(RdbValue::List(items))
            }

            RdbTypeTag::Set => {
                let len = self.read_length().await? as usize;
                let mut members = Vec::with_capacity(len);
                for _ in 0..len {
                    members.push(self.read_string().await?);
                }
                Ok(RdbValue::Set(members))
            }

            RdbTypeTag::Hash => {
                let len = self.read_length().await? as usize;
                let mut pairs = Vec::with_capacity(len);
                for _ in 0..len {
                    let field = self.read_string().await?;
                    let value = self.read_string().await?;
                    pairs.push((field, value));
                }
                Ok(RdbValue::Hash(pairs))
            }

            RdbTypeTag::ZSet => {
                let len = self.read_length().await? as usize;
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let member = self.read_string().await?;
                    let score = self.read_legacy_double().await?;
                    entries.push(ZSetEntry { member, score });
                }
                Ok(RdbValue::ZSet(entries))
            }

            RdbTypeTag::ZSet2 => {
                let len = self.read_length().await? as usize;
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let member = self.read_string().await?;
                    let raw = self.read_u64_le().await?;
                    entries.push(ZSetEntry {
                        member,
                        score: f64::from_bits(raw),
                    });
                }
                Ok(RdbValue::ZSet(entries))
            }

            RdbTypeTag::HashZipmap => {
                let blob = self.read_string().await?;
                Ok(RdbValue::Hash(parse_zipmap(blob)?))
            }

            RdbTypeTag::ListZiplist => {
                let blob = self.read_string().await?;
                Ok(RdbValue::List(parse_ziplist(blob)?))
            }

            RdbTypeTag::SetIntset => {
                let blob = self.read_string().await?;
                Ok(RdbValue::Set(parse_intset(blob)?))
            }

            RdbTypeTag::ZSetZiplist => {
                let blob = self.read_string().await?;
                zset_from_flat(parse_ziplist(blob)?)
            }

            RdbTypeTag::HashZiplist => {
                let blob = self.read_string().await?;
                hash_from_flat(parse_ziplist(blob)?)
            }

            RdbTypeTag::ListQuicklist => {
                let nodes = self.read_length().await? as usize;
                let mut items = Vec::new();
                for _ in 0..nodes {
                    let blob = self.read_string().await?;
                    items.extend(parse_ziplist(blob)?);
                }
                Ok(RdbValue::List(items))
            }

            RdbTypeTag::ListQuicklist2 => {
                let nodes = self.read_length().await? as usize;
                let mut items = Vec::new();
                for _ in 0..nodes {
                    let container = self.read_length().await?;
                    let blob = self.read_string().await?;
                    match container {
                        // Plain node: the blob is a single element.
                        1 => items.push(blob),
                        // Packed node: the blob is a listpack.
                        2 => items.extend(parse_listpack(blob)?),
                        other => {
                            return Err(RiptideError::Protocol(format!(
                                "unknown quicklist container type {other}"
                            )));
                        }
                    }
                }
                Ok(RdbValue::List(items))
            }

            RdbTypeTag::HashListpack | RdbTypeTag::DragonflyHashListpack => {
                let blob = self.read_string().await?;
                hash_from_flat(parse_listpack(blob)?)
            }

            RdbTypeTag::SetListpack | RdbTypeTag::DragonflySetListpack => {
                let blob = self.read_string().await?;
                Ok(RdbValue::Set(parse_listpack(blob)?))
            }

            RdbTypeTag::ZSetListpack | RdbTypeTag::DragonflyZSetListpack => {
                let blob = self.read_string().await?;
                zset_from_flat(parse_listpack(blob)?)
            }

            RdbTypeTag::StreamListpacks => self.read_stream(1).await,
            RdbTypeTag::StreamListpacks2 => self.read_stream(2).await,
            RdbTypeTag::StreamListpacks3 => self.read_stream(3).await,
        }
    }

    /// Decodes a stream value. Entries are recovered from the listpack
    /// nodes; consumer-group bookkeeping is parsed to keep the stream
    /// framing intact but not retained, since restoration only issues XADD.
    async fn read_stream(&mut self, version: u8) -> Result<RdbValue, RiptideError> {
        let mut stream = StreamValue::default();

        let nodes = self.read_length().await? as usize;
        for _ in 0..nodes {
            let node_key = self.read_string().await?;
            if node_key.len() != 16 {
                return Err(RiptideError::Protocol(format!(
                    "stream node key of {} byte(s), expected 16",
                    node_key.len()
                )));
            }
            let mut key_cursor = node_key;
            let master_ms = key_cursor.get_u64();
            let master_seq = key_cursor.get_u64();

            let blob = self.read_string().await?;
            let elements = parse_listpack(blob)?;
            decode_stream_node(&elements, master_ms, master_seq, &mut stream.entries)?;
        }

        // Stream metadata: current length and the last generated id.
        self.read_length().await?;
        stream.last_id_ms = self.read_length().await?;
        stream.last_id_seq = self.read_length().await?;

        if version >= 2 {
            // first id, max deleted id, entries added.
            self.read_length().await?;
            self.read_length().await?;
            self.read_length().await?;
            self.read_length().await?;
            self.read_length().await?;
        }

        let groups = self.read_length().await? as usize;
        for _ in 0..groups {
            self.read_string().await?; // group name
            self.read_length().await?; // last delivered ms
            self.read_length().await?; // last delivered seq
            if version >= 2 {
                self.read_length().await?; // entries read
            }
            let pel = self.read_length().await? as usize;
            for _ in 0..pel {
                self.read_exact(16).await?; // raw entry id
                self.read_u64_le().await?; // delivery time
                self.read_length().await?; // delivery count
            }
            let consumers = self.read_length().await? as usize;
            for _ in 0..consumers {
                self.read_string().await?; // consumer name
                self.read_u64_le().await?; // seen time
                if version >= 3 {
                    self.read_u64_le().await?; // active time
                }
                let consumer_pel = self.read_length().await? as usize;
                for _ in 0..consumer_pel {
                    self.read_exact(16).await?; // raw entry id
                }
            }
        }

        Ok(RdbValue::Stream(stream))
    }

    /// The pre-ZSET_2 score format: a one-byte length followed by an ASCII
    /// float, with 253/254/255 marking nan/+inf/-inf.
    async fn read_legacy_double(&mut self) -> Result<f64, RiptideError> {
        let len = self.read_u8().await?;
        match len {
            253 => Ok(f64::NAN),
            254 => Ok(f64::INFINITY),
            255 => Ok(f64::NEG_INFINITY),
            n => {
                let raw = self.read_exact(n as usize).await?;
                let s = std::str::from_utf8(&raw)?;
                s.parse::<f64>()
                    .map_err(|_| RiptideError::Protocol(format!("invalid zset score {s:?}")))
            }
        }
    }

    // --- Primitive async reads ---

    async fn fill(&mut self, n: usize) -> Result<(), RiptideError> {
        while self.buf.len() < n {
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(RiptideError::Protocol(
                    "FLOW stream ended in the middle of a record".into(),
                ));
            }
            self.bytes_read += read as u64;
        }
        Ok(())
    }

    async fn read_u8(&mut self) -> Result<u8, RiptideError> {
        self.fill(1).await?;
        Ok(self.buf.get_u8())
    }

    async fn read_u32_le(&mut self) -> Result<u32, RiptideError> {
        self.fill(4).await?;
        Ok(self.buf.get_u32_le())
    }

    async fn read_u64_le(&mut self) -> Result<u64, RiptideError> {
        self.fill(8).await?;
        Ok(self.buf.get_u64_le())
    }

    async fn read_exact(&mut self, n: usize) -> Result<Bytes, RiptideError> {
        self.fill(n).await?;
        Ok(self.buf.split_to(n).freeze())
    }

    /// Async twin of `encodings::read_length`, reading straight off the
    /// stream instead of an in-memory cursor.
    async fn read_length(&mut self) -> Result<u64, RiptideError> {
        match self.read_length_or_special().await? {
            RdbLength::Plain(len) => Ok(len),
            RdbLength::Special(enc) => Err(RiptideError::Protocol(format!(
                "special string encoding {enc:#04x} where a plain length was expected"
            ))),
        }
    }

    async fn read_length_or_special(&mut self) -> Result<RdbLength, RiptideError> {
        let first_byte = self.read_u8().await?;
        match (first_byte & 0xC0) >> 6 {
            0b00 => Ok(RdbLength::Plain(u64::from(first_byte & 0x3F))),
            0b01 => {
                let next_byte = self.read_u8().await?;
                Ok(RdbLength::Plain(u64::from(
                    ((first_byte as u16 & 0x3F) << 8) | next_byte as u16,
                )))
            }
            0b10 => match first_byte & 0x3F {
                0 => {
                    self.fill(4).await?;
                    Ok(RdbLength::Plain(u64::from(self.buf.get_u32())))
                }
                1 => {
                    self.fill(8).await?;
                    Ok(RdbLength::Plain(self.buf.get_u64()))
                }
                other => Err(RiptideError::Protocol(format!(
                    "unknown RDB length format {other:#04x}"
                ))),
            },
            _ => Ok(RdbLength::Special(first_byte & 0x3F)),
        }
    }

    async fn read_string(&mut self) -> Result<Bytes, RiptideError> {
        match self.read_length_or_special().await? {
            RdbLength::Plain(len) => self.read_exact(len as usize).await,
            RdbLength::Special(0) => {
                let v = self.read_u8().await? as i8;
                Ok(Bytes::from((v as i64).to_string()))
            }
            RdbLength::Special(1) => {
                self.fill(2).await?;
                Ok(Bytes::from((self.buf.get_i16_le() as i64).to_string()))
            }
            RdbLength::Special(2) => {
                self.fill(4).await?;
                Ok(Bytes::from((self.buf.get_i32_le() as i64).to_string()))
            }
            RdbLength::Special(3) => {
                let compressed_len = self.read_length().await? as usize;
                let uncompressed_len = self.read_length().await? as usize;
                let compressed = self.read_exact(compressed_len).await?;
                Ok(Bytes::from(lzf_decompress(&compressed, uncompressed_len)?))
            }
            RdbLength::Special(other) => Err(RiptideError::Protocol(format!(
                "unknown special string encoding {other:#04x}"
            ))),
        }
    }
}

/// Interprets flat `[member, score, member, score, ...]` container elements
/// as a sorted set.
fn zset_from_flat(elements: Vec<Bytes>) -> Result<RdbValue, RiptideError> {
    if elements.len() % 2 != 0 {
        return Err(RiptideError::Protocol(
            "packed zset holds an odd number of elements".into(),
        ));
    }
    let mut entries = Vec::with_capacity(elements.len() / 2);
    let mut iter = elements.into_iter();
    while let (Some(member), Some(score_raw)) = (iter.next(), iter.next()) {
        let score_str = std::str::from_utf8(&score_raw)?;
        let score = match score_str {
            "inf" | "+inf" => f64::INFINITY,
            "-inf" => f64::NEG_INFINITY,
            "nan" => f64::NAN,
            s => s
                .parse::<f64>()
                .map_err(|_| RiptideError::Protocol(format!("invalid packed zset score {s:?}")))?,
        };
        entries.push(ZSetEntry { member, score });
    }
    Ok(RdbValue::ZSet(entries))
}

/// Interprets flat `[field, value, field, value, ...]` container elements
/// as a hash.
fn hash_from_flat(elements: Vec<Bytes>) -> Result<RdbValue, RiptideError> {
    if elements.len() % 2 != 0 {
        return Err(RiptideError::Protocol(
            "packed hash holds an odd number of elements".into(),
        ));
    }
    let mut pairs = Vec::with_capacity(elements.len() / 2);
    let mut iter = elements.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((field, value));
    }
    Ok(RdbValue::Hash(pairs))
}

/// Walks one stream listpack node and appends its live entries.
fn decode_stream_node(
    elements: &[Bytes],
    master_ms: u64,
    master_seq: u64,
    out: &mut Vec<StreamEntry>,
) -> Result<(), RiptideError> {
    let int = |i: usize| -> Result<i64, RiptideError> {
        let raw = elements
            .get(i)
            .ok_or_else(|| RiptideError::Protocol("stream listpack ended early".into()))?;
        std::str::from_utf8(raw)?
            .parse::<i64>()
            .map_err(|_| RiptideError::Protocol("stream listpack holds a non-integer header".into()))
    };
    let bytes = |i: usize| -> Result<Bytes, RiptideError> {
        elements
            .get(i)
            .cloned()
            .ok_or_else(|| RiptideError::Protocol("stream listpack ended early".into()))
    };

    let count = int(0)?;
    let deleted = int(1)?;
    let num_master_fields = int(2)? as usize;
    let master_fields: Vec<Bytes> = (3..3 + num_master_fields)
        .map(bytes)
        .collect::<Result<_, _>>()?;
    // A zero marker closes the master entry.
    let mut idx = 3 + num_master_fields + 1;

    for _ in 0..(count + deleted) {
        let flags = int(idx)?;
        let ms_diff = int(idx + 1)? as u64;
        let seq_diff = int(idx + 2)? as u64;
        idx += 3;

        let mut fields = Vec::new();
        if flags & STREAM_ITEM_FLAG_SAMEFIELDS != 0 {
            for field in &master_fields {
                fields.push((field.clone(), bytes(idx)?));
                idx += 1;
            }
        } else {
            let num_fields = int(idx)? as usize;
            idx += 1;
            for _ in 0..num_fields {
                let field = bytes(idx)?;
                let value = bytes(idx + 1)?;
                idx += 2;
                fields.push((field, value));
            }
        }
        // Each entry closes with its own element count, used for backward
        // iteration inside the server; skip it.
        idx += 1;

        if flags & STREAM_ITEM_FLAG_DELETED == 0 {
            out.push(StreamEntry {
                id_ms: master_ms + ms_diff,
                id_seq: master_seq + seq_diff,
                fields,
            });
        }
    }

    Ok(())
}
