//! frame-echo: a fixed-length frame echo server
//!
//! Every client message is exactly `--buffer-size` bytes with no header.
//! The server accumulates each frame and writes it back unchanged.
//!
//! Features:
//! - Single-threaded reactor over epoll/kqueue (edge-triggered)
//! - Partial and pipelined frames handled per connection
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::{Config, ConfigError};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Usage(e)) => {
            // --help and --version render to stdout and are not failures.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
        Err(e) => {
            eprintln!("frame-echo: {e}");
            return ExitCode::from(1);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = ?config.host,
        port = config.port,
        frame_length = config.frame_length,
        batch_size = config.batch_size,
        max_connections = config.max_connections,
        "Starting frame-echo server"
    );

    match runtime::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            eprintln!("frame-echo: {e}");
            ExitCode::from(1)
        }
    }
}
