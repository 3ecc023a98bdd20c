//! Single-threaded readiness event loop.
//!
//! Each iteration waits on the listener plus every registered connection,
//! accepts at most one new connection, then drives each ready connection in
//! registry order. Idle connections past their deadline are closed last.

use super::acceptor::{accept_one, bind_listener, Accepted};
use super::error::{AcceptError, ServerError};
use super::handler::{self, Progress};
use super::poller::Poller;
use super::protocol::Responder;
use super::registry::DescriptorRegistry;
use crate::config::Config;
use mio::net::TcpListener;
#[cfg(test)]
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maximum readiness events collected per wait.
const EVENTS_CAPACITY: usize = 1024;

/// Pause before accepting again after running out of descriptors or memory.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What one iteration did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Turn {
    /// Connections accepted and registered.
    pub accepted: usize,
    /// Connections accepted and closed because the registry was full.
    pub rejected: usize,
    /// Accept attempts that failed.
    pub failed_accepts: usize,
    /// Connections that reached Closing after being driven.
    pub closed: usize,
    /// Connections closed by the idle timeout.
    pub expired: usize,
}

pub struct EventLoop<R> {
    poller: Poller,
    listener: TcpListener,
    registry: DescriptorRegistry,
    responder: R,
    /// Receive buffer shared by all connections; its length caps a request.
    scratch: Vec<u8>,
    idle_timeout: Option<Duration>,
    #[cfg(test)]
    accept_failures: VecDeque<io::Error>,
}

impl<R: Responder> EventLoop<R> {
    /// Bind the listener and set up the poller and registry.
    pub fn bind(config: &Config, responder: R) -> Result<Self, ServerError> {
        let poller = Poller::new(EVENTS_CAPACITY).map_err(ServerError::setup("poller"))?;
        let mut listener = bind_listener(SocketAddr::V4(config.listen), config.backlog)
            .map_err(ServerError::setup("listen"))?;
        poller
            .register_listener(&mut listener)
            .map_err(ServerError::setup("listener registration"))?;
        let selector = poller.selector().map_err(ServerError::setup("poller"))?;

        Ok(Self {
            poller,
            listener,
            registry: DescriptorRegistry::new(selector, config.max_connections),
            responder,
            scratch: vec![0u8; config.max_request_size],
            idle_timeout: config.idle_timeout,
            #[cfg(test)]
            accept_failures: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn responder(&self) -> &R {
        &self.responder
    }

    /// The set the next wait will monitor.
    #[cfg(test)]
    pub fn interest_set(&self) -> Vec<mio::Token> {
        self.poller.interest_set(&self.registry)
    }

    /// Run iterations until the poller fails.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let addr = self.local_addr().map_err(ServerError::setup("listen"))?;
        info!(
            addr = %addr,
            capacity = self.registry.capacity(),
            max_request_size = self.scratch.len(),
            "Server listening"
        );

        loop {
            self.turn(None)?;
        }
    }

    /// Run a single iteration, waiting at most `timeout` for readiness.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<Turn, ServerError> {
        let timeout = match self.registry.next_deadline() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                Some(timeout.map_or(until, |t| t.min(until)))
            }
            None => timeout,
        };

        let ready = self
            .poller
            .wait(&self.registry, timeout)
            .map_err(ServerError::Poll)?;
        let mut turn = Turn::default();

        if ready.listener {
            match self.accept() {
                Ok(Accepted::Registered(_)) => {
                    turn.accepted += 1;
                    self.poller.mark_listener_backlogged();
                }
                Ok(Accepted::Rejected) => {
                    turn.rejected += 1;
                    self.poller.mark_listener_backlogged();
                }
                Ok(Accepted::Drained) => {}
                Err(e) if e.is_per_connection() => {
                    turn.failed_accepts += 1;
                    warn!(error = %e, "Skipping accept");
                    self.poller.mark_listener_backlogged();
                }
                Err(e) => {
                    turn.failed_accepts += 1;
                    warn!(
                        error = %e,
                        retry_ms = ACCEPT_RETRY_DELAY.as_millis() as u64,
                        "Accept failed, retrying later"
                    );
                    self.poller.mark_listener_retry(ACCEPT_RETRY_DELAY);
                }
            }
        }

        for token in ready.connections {
            let progress = handler::drive(
                token,
                &mut self.registry,
                &mut self.responder,
                &mut self.scratch,
            );
            if progress == Progress::Closed {
                turn.closed += 1;
            }
        }

        if self.idle_timeout.is_some() {
            for token in self.registry.expired(Instant::now()) {
                if handler::expire(token, &mut self.registry) == Progress::Closed {
                    turn.expired += 1;
                }
            }
        }

        if turn != Turn::default() {
            debug!(
                accepted = turn.accepted,
                rejected = turn.rejected,
                failed_accepts = turn.failed_accepts,
                closed = turn.closed,
                expired = turn.expired,
                active = self.registry.len(),
                "Iteration complete"
            );
        }

        Ok(turn)
    }

    fn accept(&mut self) -> Result<Accepted, AcceptError> {
        #[cfg(test)]
        let injected = self.accept_failures.pop_front();
        #[cfg(not(test))]
        let injected: Option<io::Error> = None;
        if let Some(e) = injected {
            return Err(AcceptError(e));
        }
        accept_one(&self.listener, &mut self.registry, self.idle_timeout)
    }
}
