//! Per-connection state for the one-shot exchange.
//!
//! Each connection tracks where it is in the exchange and the progress made
//! so far, so the handler can resume it on the next readiness event.

use bytes::Bytes;
use mio::net::TcpStream;
use mio::Interest;
use std::net::SocketAddr;
use std::time::Instant;

/// Current state of a connection.
#[derive(Debug, Clone)]
pub enum ConnState {
    /// Waiting for the single request read.
    AwaitingRequest,
    /// Writing the response.
    Writing {
        /// Response to deliver.
        response: Bytes,
        /// Bytes already accepted by the socket.
        written: usize,
    },
    /// Terminal; the connection is about to be unregistered and dropped.
    Closing,
}

/// A single accepted client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Close the connection if it is still open at this instant.
    pub deadline: Option<Instant>,
    /// Readiness the poller is currently watching for.
    pub interest: Interest,
}

impl Connection {
    /// Create a new connection awaiting its request.
    pub fn new(stream: TcpStream, peer: SocketAddr, deadline: Option<Instant>) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::AwaitingRequest,
            deadline,
            interest: Interest::READABLE,
        }
    }

    /// Transition to writing `response`.
    pub fn start_writing(&mut self, response: Bytes) {
        self.state = ConnState::Writing {
            response,
            written: 0,
        };
    }

    /// Record `n` more bytes written. Returns true once the response is complete.
    pub fn advance_write(&mut self, n: usize) -> bool {
        match &mut self.state {
            ConnState::Writing { response, written } => {
                *written = (*written + n).min(response.len());
                *written == response.len()
            }
            _ => false,
        }
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}
