// src/core/snapshot/entry.rs

//! The value types a decoded snapshot record can carry.

use bytes::Bytes;

/// Every value type tag the decoder understands, including the packed
/// variants and the Dragonfly compact encodings. The tag records how the
/// value was encoded on the wire; the decoded `RdbValue` is always the
/// logical collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdbTypeTag {
    String,
    List,
    Set,
    ZSet,
    Hash,
    ZSet2,
    HashZipmap,
    ListZiplist,
    SetIntset,
    ZSetZiplist,
    HashZiplist,
    ListQuicklist,
    StreamListpacks,
    HashListpack,
    ZSetListpack,
    ListQuicklist2,
    StreamListpacks2,
    SetListpack,
    StreamListpacks3,
    /// Dragonfly compact hash: a length-prefixed listpack blob.
    DragonflyHashListpack,
    /// Dragonfly compact set: a length-prefixed listpack blob.
    DragonflySetListpack,
    /// Dragonfly compact sorted set: a length-prefixed listpack blob.
    DragonflyZSetListpack,
}

impl RdbTypeTag {
    /// Maps a wire tag byte to the decoder's type enum. Unknown tags yield
    /// `None` so the decoder can fail loudly instead of guessing.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => RdbTypeTag::String,
            1 => RdbTypeTag::List,
            2 => RdbTypeTag::Set,
            3 => RdbTypeTag::ZSet,
            4 => RdbTypeTag::Hash,
            5 => RdbTypeTag::ZSet2,
            9 => RdbTypeTag::HashZipmap,
            10 => RdbTypeTag::ListZiplist,
            11 => RdbTypeTag::SetIntset,
            12 => RdbTypeTag::ZSetZiplist,
            13 => RdbTypeTag::HashZiplist,
            14 => RdbTypeTag::ListQuicklist,
            15 => RdbTypeTag::StreamListpacks,
            16 => RdbTypeTag::HashListpack,
            17 => RdbTypeTag::ZSetListpack,
            18 => RdbTypeTag::ListQuicklist2,
            19 => RdbTypeTag::StreamListpacks2,
            20 => RdbTypeTag::SetListpack,
            21 => RdbTypeTag::StreamListpacks3,
            200 => RdbTypeTag::DragonflyHashListpack,
            201 => RdbTypeTag::DragonflySetListpack,
            202 => RdbTypeTag::DragonflyZSetListpack,
            _ => return None,
        })
    }
}

/// A sorted-set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ZSetEntry {
    pub member: Bytes,
    pub score: f64,
}

/// One stream entry: its id and its field/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id_ms: u64,
    pub id_seq: u64,
    pub fields: Vec<(Bytes, Bytes)>,
}

/// A decoded stream value. Consumer-group bookkeeping is parsed for framing
/// but not retained: the target only ever sees XADD.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamValue {
    pub entries: Vec<StreamEntry>,
    pub last_id_ms: u64,
    pub last_id_seq: u64,
}

/// The logical value of a snapshot record, normalized from whatever packed
/// encoding it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub enum RdbValue {
    String(Bytes),
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    Hash(Vec<(Bytes, Bytes)>),
    ZSet(Vec<ZSetEntry>),
    Stream(StreamValue),
}

impl RdbValue {
    /// Number of logical elements, used for progress accounting.
    pub fn len(&self) -> usize {
        match self {
            RdbValue::String(_) => 1,
            RdbValue::List(v) | RdbValue::Set(v) => v.len(),
            RdbValue::Hash(v) => v.len(),
            RdbValue::ZSet(v) => v.len(),
            RdbValue::Stream(s) => s.entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RdbValue::String(_) => false,
            _ => self.len() == 0,
        }
    }
}

/// One key decoded from a FLOW's snapshot stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RdbEntry {
    pub key: Bytes,
    pub type_tag: RdbTypeTag,
    pub value: RdbValue,
    /// Absolute expiry in Unix milliseconds, if the key is volatile.
    pub expire_at_ms: Option<u64>,
    pub db_index: u64,
}
