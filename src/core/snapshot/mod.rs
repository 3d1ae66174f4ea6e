// src/core/snapshot/mod.rs

//! Snapshot ingestion: the RDB decoder, the per-FLOW readers, and the
//! batching sink that restores entries on the target.

pub mod apply;
pub mod encodings;
pub mod entry;
pub mod rdb;
pub mod reader;

pub use apply::SnapshotApplier;
pub use entry::{RdbEntry, RdbTypeTag, RdbValue};
pub use rdb::{RdbDecoder, RdbItem};
