//! Readiness-multiplexed connection runtime.
//!
//! Components, leaf-first:
//! - `Connection`: per-connection state for the one-shot exchange
//! - `DescriptorRegistry`: bounded set of active connections
//! - `Poller`: readiness wait over the listener and the registry
//! - `acceptor`: listener setup and single-connection accept
//! - `handler`: non-blocking request/response state machine
//! - `EventLoop`: ties them together, one iteration per wakeup
//!
//! Uses mio (epoll on Linux, kqueue on macOS).

mod acceptor;
mod connection;
mod error;
mod event_loop;
mod handler;
mod poller;
pub mod protocol;
mod registry;

pub use error::ServerError;
pub use event_loop::EventLoop;
pub use protocol::{Greeting, Responder};

use crate::config::Config;

/// Run the server until a fatal error occurs.
pub fn run(config: Config) -> Result<(), ServerError> {
    run_with(config, Greeting)
}

/// Run the server with a custom responder.
pub fn run_with<R: Responder>(config: Config, responder: R) -> Result<(), ServerError> {
    let mut event_loop = EventLoop::bind(&config, responder)?;
    event_loop.run()
}
