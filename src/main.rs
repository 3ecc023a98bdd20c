//! mux-server: a single-threaded, readiness-multiplexed TCP server
//!
//! Every client gets exactly one exchange: the server reads one request
//! (up to a fixed size), writes a fixed greeting, and closes the connection.
//! All sockets are non-blocking; the only blocking call is the readiness wait.
//!
//! Usage: `server <ipv4-address> <port> [OPTIONS]`

mod config;
mod runtime;

use config::{Config, ConfigError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Usage(usage)) => {
            println!("{usage}");
            return Ok(());
        }
        Err(ConfigError::Cli(e)) if !e.use_stderr() => e.exit(),
        Err(e) => return Err(e.into()),
    };

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
        max_request_size = config.max_request_size,
        idle_timeout_ms = config.idle_timeout.map(|t| t.as_millis() as u64),
        backlog = config.backlog,
        "Starting mux-server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server stopped");
        return Err(e.into());
    }

    Ok(())
}
