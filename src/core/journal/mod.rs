// src/core/journal/mod.rs

//! Journal-stream decoding and deterministic replay.

pub mod codec;
pub mod replayer;

pub use codec::{JournalDecoder, JournalEntry};
pub use replayer::JournalApplier;
