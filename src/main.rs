//! switchyard: a completion-driven TCP gateway
//!
//! Modes:
//! - `proxy`: relays every accepted connection to a fixed backend
//! - `framed-echo`: echoes length-prefixed frames
//! - `http`: small HTTP/1.1 server with a path router
//! - `echo`: plain echo on Tokio
//!
//! The reactor modes run on mio (epoll/kqueue) or io_uring, with a fixed
//! pool of worker threads sharing one completion queue.

mod config;
mod protocols;
mod runtime;
mod server;
mod signal;

use config::Config;
use signal::{install_signal_handler, Shutdown};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        runtime = ?config.runtime,
        listen = %config.listen,
        backend = %config.backend,
        workers = config.workers,
        buffer_size = config.buffer_size,
        "Starting switchyard"
    );

    let shutdown = Shutdown::new();
    install_signal_handler(&shutdown)?;

    server::run(config, shutdown)
}
