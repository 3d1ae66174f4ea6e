// src/main.rs

//! The main entry point for the riptide replication engine.

use riptide::config::Config;
use riptide::core::replication::supervisor::RunOutcome;
use riptide::server;
use std::env;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

/// Exit code for a signal-initiated graceful shutdown, per the CLI contract.
const EXIT_SIGNALLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("riptide version {VERSION}");
        return ExitCode::SUCCESS;
    }

    // The configuration path defaults to "riptide.yaml" unless --config says
    // otherwise; an optional positional task name labels this run.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("riptide.yaml");

    let mut task_name: Option<String> = None;
    let mut arg_iter = args.iter().skip(1);
    while let Some(arg) = arg_iter.next() {
        if arg == "--config" {
            arg_iter.next();
        } else if !arg.starts_with("--") {
            task_name = Some(arg.clone());
        }
    }

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins over the configured level.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Some(task) = &task_name {
        info!("Running replication task {task:?}");
    }

    match server::run(config).await {
        Ok(RunOutcome::Completed) => ExitCode::SUCCESS,
        Ok(RunOutcome::Cancelled) => ExitCode::from(EXIT_SIGNALLED),
        Err(e) => {
            error!("Replication failed: {e}");
            eprintln!("riptide: {e}");
            ExitCode::FAILURE
        }
    }
}
