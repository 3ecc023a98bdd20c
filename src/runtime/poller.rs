//! Readiness wait over the listener and the registry's members.
//!
//! mio delivers edge-triggered events, so the poller also remembers when the
//! listener may still hold a backlog after an accept. The next wait then
//! returns immediately and reports the listener ready again. After an accept
//! that failed for lack of resources the listener is instead reported again
//! once a retry delay has passed.

use super::registry::DescriptorRegistry;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
#[cfg(test)]
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};
use tracing::trace;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Ready subset produced by one wait.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadySet {
    pub listener: bool,
    /// Ready members, in registry iteration order.
    pub connections: Vec<Token>,
}

impl ReadySet {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        !self.listener && self.connections.is_empty()
    }
}

pub struct Poller {
    poll: Poll,
    events: Events,
    listener_backlogged: bool,
    listener_retry_at: Option<Instant>,
    #[cfg(test)]
    injected_failures: VecDeque<io::Error>,
}

impl Poller {
    /// Create a poller able to report `batch_size` events per wait.
    pub fn new(batch_size: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(batch_size.max(1)),
            listener_backlogged: false,
            listener_retry_at: None,
            #[cfg(test)]
            injected_failures: VecDeque::new(),
        })
    }

    /// Handle through which the registry monitors its members.
    pub fn selector(&self) -> io::Result<mio::Registry> {
        self.poll.registry().try_clone()
    }

    pub fn register_listener(&self, listener: &mut TcpListener) -> io::Result<()> {
        self.poll
            .registry()
            .register(listener, LISTENER_TOKEN, Interest::READABLE)
    }

    /// The set a wait monitors: the listener plus every current member.
    pub fn interest_set(&self, registry: &DescriptorRegistry) -> Vec<Token> {
        std::iter::once(LISTENER_TOKEN)
            .chain(registry.members())
            .collect()
    }

    /// The listener may still have pending connections.
    pub fn mark_listener_backlogged(&mut self) {
        self.listener_backlogged = true;
        self.listener_retry_at = None;
    }

    /// Report the listener ready again once `delay` has passed, even if no
    /// new connection arrives meanwhile.
    pub fn mark_listener_retry(&mut self, delay: Duration) {
        self.listener_backlogged = false;
        self.listener_retry_at = Some(Instant::now() + delay);
    }

    /// Make the next wait fail with `error` instead of polling.
    #[cfg(test)]
    pub fn inject_failure(&mut self, error: io::Error) {
        self.injected_failures.push_back(error);
    }

    /// Block until the listener or a member is ready, or `timeout` elapses.
    ///
    /// An interrupted wait reports no member readiness. Events for tokens
    /// that are no longer members are dropped.
    pub fn wait(
        &mut self,
        registry: &DescriptorRegistry,
        timeout: Option<Duration>,
    ) -> io::Result<ReadySet> {
        let timeout = if self.listener_backlogged {
            Some(Duration::ZERO)
        } else if let Some(at) = self.listener_retry_at {
            let until = at.saturating_duration_since(Instant::now());
            Some(timeout.map_or(until, |t| t.min(until)))
        } else {
            timeout
        };

        trace!(
            interest = self.interest_set(registry).len(),
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Waiting for readiness"
        );

        let mut ready = ReadySet {
            listener: std::mem::take(&mut self.listener_backlogged),
            connections: Vec::new(),
        };

        let polled = self.poll_once(timeout);
        if self.take_due_retry() {
            ready.listener = true;
        }
        match polled {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ready),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => ready.listener = true,
                token if registry.contains(token) => ready.connections.push(token),
                token => trace!(conn_id = token.0, "Dropping event for closed connection"),
            }
        }

        ready.connections.sort_unstable();
        ready.connections.dedup();
        Ok(ready)
    }

    fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        #[cfg(test)]
        let injected = self.injected_failures.pop_front();
        #[cfg(not(test))]
        let injected: Option<io::Error> = None;
        if let Some(e) = injected {
            return Err(e);
        }
        self.poll.poll(&mut self.events, timeout)
    }

    fn take_due_retry(&mut self) -> bool {
        match self.listener_retry_at {
            Some(at) if at <= Instant::now() => {
                self.listener_retry_at = None;
                true
            }
            _ => false,
        }
    }
}
