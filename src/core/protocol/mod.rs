// src/core/protocol/mod.rs

mod resp_frame;

pub use resp_frame::{RespFrame, RespFrameCodec, parse_frame};
