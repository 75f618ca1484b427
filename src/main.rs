//! frame-mux server binary.
//!
//! Listens on a TCP port and echoes every length-prefixed request back to
//! its sender. Configuration via CLI arguments or TOML file.

use frame_mux::config::Config;
use frame_mux::runtime;
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
        listen = %config.listen,
        max_connections = config.max_connections,
        byte_order = ?config.byte_order,
        "Starting frame-mux server"
    );

    runtime::run(config)?;
    Ok(())
}
