// src/core/tasks/mod.rs

//! Long-running background tasks spawned by the supervisor.

pub mod checkpoint_saver;
pub mod status_sink;

pub use checkpoint_saver::CheckpointSaverTask;
pub use status_sink::StatusSinkTask;
