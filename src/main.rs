//! echosrv: a single-threaded, event-driven TCP echo server
//!
//! Accepts clients on a fixed port and writes back whatever bytes each
//! client sends until it disconnects. One thread, non-blocking sockets,
//! and one readiness loop dispatching accept and read callbacks.
//!
//! Configuration via CLI arguments or TOML file; defaults listen on
//! 0.0.0.0:5555.

mod config;
mod runtime;

use config::Config;
use runtime::{start_listening, EventLoop};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        addr = %config.listen_addr(),
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        batch_size = config.batch_size,
        "Starting echosrv"
    );

    match serve(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error, shutting down");
            ExitCode::FAILURE
        }
    }
}

/// Build the loop, start listening, and dispatch until a fatal fault.
fn serve(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut event_loop = EventLoop::new(config.batch_size, config.buffer_size)?;
    start_listening(&mut event_loop, config.listen_addr(), config.backlog)?;
    event_loop.run()?;
    Ok(())
}
