// src/core/errors.rs

//! Defines the primary error type for the entire engine.

use std::num::{ParseFloatError, ParseIntError};
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the engine.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum RiptideError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    /// Failure to dial, authenticate, or discover the topology of a peer.
    #[error("Connect Error: {0}")]
    Connect(String),

    /// The peer sent something the protocol does not allow: an unexpected RESP
    /// shape, an unknown opcode, an EOF-token mismatch, or a corrupt journal frame.
    #[error("Protocol Error: {0}")]
    Protocol(String),

    /// The source or target returned an error reply to a command we issued.
    #[error("Remote Error: {0}")]
    Remote(String),

    /// A command was redirected more times than the redirect budget allows.
    #[error("Redirect budget exhausted for slot {slot} after {attempts} attempts")]
    RedirectExhausted { slot: u16, attempts: u32 },

    /// The user asked for a shutdown; not a failure.
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Syntax error")]
    SyntaxError,

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("value is not a valid float")]
    NotAFloat,

    #[error("Checkpoint Error: {0}")]
    CheckpointError(String),

    #[error("Internal Error: {0}")]
    Internal(String),

    // --- Redirect carriers, parsed out of target error replies ---
    /// A permanent redirect: the slot now lives on another node.
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    /// A temporary redirect for a slot that is being migrated.
    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: String },
}

impl RiptideError {
    /// True for errors that must abort the whole replication session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RiptideError::Moved { .. } | RiptideError::Ask { .. } | RiptideError::Cancelled
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for RiptideError {
    fn clone(&self) -> Self {
        match self {
            RiptideError::Io(e) => RiptideError::Io(Arc::clone(e)),
            RiptideError::IncompleteData => RiptideError::IncompleteData,
            RiptideError::Connect(s) => RiptideError::Connect(s.clone()),
            RiptideError::Protocol(s) => RiptideError::Protocol(s.clone()),
            RiptideError::Remote(s) => RiptideError::Remote(s.clone()),
            RiptideError::RedirectExhausted { slot, attempts } => {
                RiptideError::RedirectExhausted {
                    slot: *slot,
                    attempts: *attempts,
                }
            }
            RiptideError::Cancelled => RiptideError::Cancelled,
            RiptideError::SyntaxError => RiptideError::SyntaxError,
            RiptideError::NotAnInteger => RiptideError::NotAnInteger,
            RiptideError::NotAFloat => RiptideError::NotAFloat,
            RiptideError::CheckpointError(s) => RiptideError::CheckpointError(s.clone()),
            RiptideError::Internal(s) => RiptideError::Internal(s.clone()),
            RiptideError::Moved { slot, addr } => RiptideError::Moved {
                slot: *slot,
                addr: addr.clone(),
            },
            RiptideError::Ask { slot, addr } => RiptideError::Ask {
                slot: *slot,
                addr: addr.clone(),
            },
        }
    }
}

impl PartialEq for RiptideError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RiptideError::Io(e1), RiptideError::Io(e2)) => e1.to_string() == e2.to_string(),
            (RiptideError::Connect(s1), RiptideError::Connect(s2)) => s1 == s2,
            (RiptideError::Protocol(s1), RiptideError::Protocol(s2)) => s1 == s2,
            (RiptideError::Remote(s1), RiptideError::Remote(s2)) => s1 == s2,
            (RiptideError::CheckpointError(s1), RiptideError::CheckpointError(s2)) => s1 == s2,
            (RiptideError::Internal(s1), RiptideError::Internal(s2)) => s1 == s2,
            (
                RiptideError::Moved { slot: s1, addr: a1 },
                RiptideError::Moved { slot: s2, addr: a2 },
            ) => s1 == s2 && a1 == a2,
            (
                RiptideError::Ask { slot: s1, addr: a1 },
                RiptideError::Ask { slot: s2, addr: a2 },
            ) => s1 == s2 && a1 == a2,
            (
                RiptideError::RedirectExhausted { slot: s1, .. },
                RiptideError::RedirectExhausted { slot: s2, .. },
            ) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for RiptideError {
    fn from(e: std::io::Error) -> Self {
        RiptideError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for RiptideError {
    fn from(e: std::str::Utf8Error) -> Self {
        RiptideError::Protocol(format!("Invalid UTF-8 in protocol data: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for RiptideError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        RiptideError::Protocol(format!("Invalid UTF-8 in protocol data: {e}"))
    }
}

impl From<ParseIntError> for RiptideError {
    fn from(_: ParseIntError) -> Self {
        RiptideError::NotAnInteger
    }
}

impl From<ParseFloatError> for RiptideError {
    fn from(_: ParseFloatError) -> Self {
        RiptideError::NotAFloat
    }
}

impl From<serde_json::Error> for RiptideError {
    fn from(e: serde_json::Error) -> Self {
        RiptideError::CheckpointError(format!("JSON serialization error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for RiptideError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RiptideError::Io(Arc::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "operation timed out",
        )))
    }
}
