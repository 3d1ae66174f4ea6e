// src/core/journal/codec.rs

//! The journal framing: records of one opcode byte followed by fields in the
//! packed-uint encoding, where the top two bits of the first byte select the
//! width of the integer (6-bit immediate, 14-bit, 32-bit, or 64-bit).
//!
//! The encoder half exists for the test suite and mirrors the decoder
//! exactly; the engine itself only ever decodes.

use crate::core::RiptideError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

// Record opcodes.
pub const OP_SELECT: u8 = 0;
pub const OP_LSN: u8 = 1;
pub const OP_COMMAND: u8 = 2;
pub const OP_EXPIRED: u8 = 3;
pub const OP_PING: u8 = 4;
pub const OP_FIN: u8 = 5;

/// Upper bound on the argument count of one COMMAND record. Anything larger
/// is treated as frame corruption, which is always fatal for the FLOW.
const MAX_COMMAND_ARGS: u64 = 1024 * 1024;

/// One record decoded from a FLOW's journal stream.
///
/// A tagged sum: each opcode carries exactly the fields its wire layout
/// defines, so impossible states (a PING with arguments) cannot be
/// represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// Informational db switch; never forwarded to the target.
    Select { db_index: u64 },
    /// Advances the shard's log position; never forwarded.
    Lsn { lsn: u64 },
    /// A ready-to-execute command. `args[0]` is the command name. Entries
    /// sharing a nonzero `tx_id` form one atomic group.
    Command {
        lsn: u64,
        db_index: u64,
        tx_id: u64,
        args: Vec<Bytes>,
    },
    /// The source expired a key; the target gets an unconditional delete.
    Expired { lsn: u64, db_index: u64, key: Bytes },
    /// Liveness probe; never forwarded.
    Ping,
    /// Graceful end of the journal.
    Fin,
}

impl JournalEntry {
    /// The log position this record carries, if any.
    pub fn lsn(&self) -> Option<u64> {
        match self {
            JournalEntry::Lsn { lsn } => Some(*lsn),
            JournalEntry::Command { lsn, .. } => Some(*lsn),
            JournalEntry::Expired { lsn, .. } => Some(*lsn),
            _ => None,
        }
    }
}

/// An incremental journal decoder over any byte source.
pub struct JournalDecoder<R> {
    reader: R,
    buf: BytesMut,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> JournalDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(16 * 1024),
            bytes_read: 0,
        }
    }

    /// Carries over bytes a previous decoding stage had already pulled off
    /// the socket.
    pub fn with_leftover(reader: R, leftover: BytesMut) -> Self {
        Self {
            reader,
            buf: leftover,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Decodes the next record.
    pub async fn next_entry(&mut self) -> Result<JournalEntry, RiptideError> {
        let opcode = self.read_u8().await?;
        match opcode {
            OP_SELECT => Ok(JournalEntry::Select {
                db_index: self.read_packed_uint().await?,
            }),
            OP_LSN => Ok(JournalEntry::Lsn {
                lsn: self.read_packed_uint().await?,
            }),
            OP_COMMAND => {
                let lsn = self.read_packed_uint().await?;
                let db_index = self.read_packed_uint().await?;
                let tx_id = self.read_packed_uint().await?;
                let arg_count = self.read_packed_uint().await?;
                if arg_count == 0 || arg_count > MAX_COMMAND_ARGS {
                    return Err(RiptideError::Protocol(format!(
                        "corrupt journal frame: COMMAND with {arg_count} argument(s)"
                    )));
                }
                let mut args = Vec::with_capacity(arg_count as usize);
                for _ in 0..arg_count {
                    args.push(self.read_blob().await?);
                }
                Ok(JournalEntry::Command {
                    lsn,
                    db_index,
                    tx_id,
                    args,
                })
            }
            OP_EXPIRED => {
                let lsn = self.read_packed_uint().await?;
                let db_index = self.read_packed_uint().await?;
                let key = self.read_blob().await?;
                Ok(JournalEntry::Expired { lsn, db_index, key })
            }
            OP_PING => Ok(JournalEntry::Ping),
            OP_FIN => Ok(JournalEntry::Fin),
            other => Err(RiptideError::Protocol(format!(
                "corrupt journal frame: unknown opcode {other:#04x}"
            ))),
        }
    }

    async fn fill(&mut self, n: usize) -> Result<(), RiptideError> {
        while self.buf.len() < n {
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(RiptideError::Protocol(
                    "journal stream ended in the middle of a record".into(),
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

    /// Reads one packed uint: the top two bits of the first byte select the
    /// width, the remaining bits (plus any following bytes, big-endian) are
    /// the value.
    async fn read_packed_uint(&mut self) -> Result<u64, RiptideError> {
        let first = self.read_u8().await?;
        match (first & 0xC0) >> 6 {
            0b00 => Ok(u64::from(first & 0x3F)),
            0b01 => {
                let next = self.read_u8().await?;
                Ok((u64::from(first & 0x3F) << 8) | u64::from(next))
            }
            0b10 => {
                self.fill(4).await?;
                Ok(u64::from(self.buf.get_u32()))
            }
            0b11 => {
                self.fill(8).await?;
                Ok(self.buf.get_u64())
            }
            _ => unreachable!(),
        }
    }

    /// Reads a length-prefixed byte string.
    async fn read_blob(&mut self) -> Result<Bytes, RiptideError> {
        let len = self.read_packed_uint().await? as usize;
        self.fill(len).await?;
        Ok(self.buf.split_to(len).freeze())
    }
}

// --- Encoder half, the mirror image of the decoder ---

/// Writes one packed uint.
pub fn write_packed_uint(buf: &mut BytesMut, value: u64) {
    if value < (1 << 6) {
        buf.put_u8(value as u8);
    } else if value < (1 << 14) {
        buf.put_u8(0x40 | (value >> 8) as u8);
        buf.put_u8(value as u8);
    } else if value <= u64::from(u32::MAX) {
        buf.put_u8(0x80);
        buf.put_u32(value as u32);
    } else {
        buf.put_u8(0xC0);
        buf.put_u64(value);
    }
}

fn write_blob(buf: &mut BytesMut, blob: &[u8]) {
    write_packed_uint(buf, blob.len() as u64);
    buf.put_slice(blob);
}

/// Serializes one journal record in the wire framing.
pub fn encode_entry(buf: &mut BytesMut, entry: &JournalEntry) {
    match entry {
        JournalEntry::Select { db_index } => {
            buf.put_u8(OP_SELECT);
            write_packed_uint(buf, *db_index);
        }
        JournalEntry::Lsn { lsn } => {
            buf.put_u8(OP_LSN);
            write_packed_uint(buf, *lsn);
        }
        JournalEntry::Command {
            lsn,
            db_index,
            tx_id,
            args,
        } => {
            buf.put_u8(OP_COMMAND);
            write_packed_uint(buf, *lsn);
            write_packed_uint(buf, *db_index);
            write_packed_uint(buf, *tx_id);
            write_packed_uint(buf, args.len() as u64);
            for arg in args {
                write_blob(buf, arg);
            }
        }
        JournalEntry::Expired { lsn, db_index, key } => {
            buf.put_u8(OP_EXPIRED);
            write_packed_uint(buf, *lsn);
            write_packed_uint(buf, *db_index);
            write_blob(buf, key);
        }
        JournalEntry::Ping => buf.put_u8(OP_PING),
        JournalEntry::Fin => buf.put_u8(OP_FIN),
    }
}
