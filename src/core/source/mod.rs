// src/core/source/mod.rs

//! Source-side plumbing: the socket layer and the Dragonfly replica handshake.

pub mod connection;
pub mod handshake;

pub use connection::{SocketTuning, SourceConnection, SourceStream};
pub use handshake::{FlowHandshake, HandshakeOutcome, MasterInfo, SyncType};
