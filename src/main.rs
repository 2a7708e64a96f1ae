//! framekv server binary.
//!
//! Features:
//! - Pipelined `get`/`set`/`del` over a length-prefixed binary protocol
//! - Single-threaded mio event loop (epoll on Linux, kqueue on macOS)
//! - Configuration via CLI arguments or TOML file

use framekv::config::Config;
use framekv::runtime;
use tracing::{error, info};
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
        listen = %config.listen,
        max_connections = config.max_connections,
        max_message_size = config.limits.max_message_size,
        max_args = config.limits.max_args,
        "Starting framekv server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }
    Ok(())
}
