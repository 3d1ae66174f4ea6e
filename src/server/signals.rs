// src/server/signals.rs

//! Platform signal handling.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Installs the process signal handlers. SIGINT/SIGTERM broadcast the
/// shutdown signal; SIGHUP is drained and ignored; SIGPIPE is suppressed at
/// the libc level so a closed peer socket becomes a write error instead of
/// killing the process.
pub fn install(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        // SAFETY: SIG_IGN is a valid disposition for SIGPIPE and this runs
        // before any socket I/O could raise it.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGINT handler: {e}");
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGHUP handler: {e}");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = sigint.recv() => {
                        info!("SIGINT received; starting graceful shutdown");
                        let _ = shutdown_tx.send(());
                    }
                    _ = sigterm.recv() => {
                        info!("SIGTERM received; starting graceful shutdown");
                        let _ = shutdown_tx.send(());
                    }
                    _ = sighup.recv() => {
                        debug!("SIGHUP received and ignored");
                    }
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; starting graceful shutdown");
                let _ = shutdown_tx.send(());
            }
        });
    }
}
