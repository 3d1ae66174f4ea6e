// src/server/mod.rs

//! Engine bootstrap: signal wiring and the top-level run function.

mod signals;

use crate::config::Config;
use crate::core::RiptideError;
use crate::core::replication::supervisor::{RunOutcome, Supervisor};
use tracing::info;

/// Runs one replication session to completion.
///
/// Installs the signal handlers (INT/TERM start a graceful shutdown, HUP is
/// ignored so the process survives a terminal disconnect, PIPE is ignored so
/// peer resets surface as write errors), then hands control to the
/// supervisor. Returns once every child task has exited.
pub async fn run(config: Config) -> Result<RunOutcome, RiptideError> {
    let supervisor = Supervisor::new(config);
    signals::install(supervisor.shutdown_handle());

    info!("Riptide {} starting", env!("CARGO_PKG_VERSION"));
    supervisor.run().await
}
