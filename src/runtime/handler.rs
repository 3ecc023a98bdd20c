//! One-shot request/response state machine.
//!
//! A connection is driven only when the poller reports it ready. Each call
//! makes as much progress as the socket allows without blocking and records
//! it in the connection, so a slow peer never stalls the loop. Every path
//! ends in `close`, which unregisters and drops the connection exactly once.

use super::connection::ConnState;
use super::error::ConnectionError;
use super::protocol::{preview, Responder};
use super::registry::DescriptorRegistry;
use bytes::Bytes;
use mio::{Interest, Token};
use std::io::{self, Read, Write};
use tracing::{debug, trace};

/// Outcome of driving a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Waiting for the next readiness event.
    Waiting,
    /// The exchange finished or failed; the connection is closed.
    Closed,
    /// The token is not a member.
    Missing,
}

enum Step {
    Waiting,
    /// Needs writable readiness before it can continue.
    WaitWritable,
    Done,
}

/// Drive the connection behind `token` as far as it can go.
///
/// `scratch` bounds the request: a single receive fills at most
/// `scratch.len()` bytes and anything beyond is never read.
pub fn drive<R: Responder + ?Sized>(
    token: Token,
    registry: &mut DescriptorRegistry,
    responder: &mut R,
    scratch: &mut [u8],
) -> Progress {
    if !registry.contains(token) {
        return Progress::Missing;
    }

    let result = step(token, registry, responder, scratch).and_then(|step| match step {
        Step::WaitWritable => registry
            .set_interest(token, Interest::WRITABLE)
            .map(|()| Step::Waiting)
            .map_err(ConnectionError::Rearm),
        other => Ok(other),
    });

    match result {
        Ok(Step::Waiting) | Ok(Step::WaitWritable) => Progress::Waiting,
        Ok(Step::Done) => close(token, registry, None),
        Err(e) => close(token, registry, Some(e)),
    }
}

/// Close an idle connection whose deadline has passed.
pub fn expire(token: Token, registry: &mut DescriptorRegistry) -> Progress {
    match registry.get_mut(token) {
        Some(conn) => {
            let peer = conn.peer;
            close(token, registry, Some(ConnectionError::TimedOut { peer }))
        }
        None => Progress::Missing,
    }
}

fn step<R: Responder + ?Sized>(
    token: Token,
    registry: &mut DescriptorRegistry,
    responder: &mut R,
    scratch: &mut [u8],
) -> Result<Step, ConnectionError> {
    let conn = match registry.get_mut(token) {
        Some(conn) => conn,
        None => return Ok(Step::Done),
    };

    if matches!(conn.state, ConnState::AwaitingRequest) {
        let n = loop {
            match conn.stream.read(scratch) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Waiting),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Recv(e)),
            }
        };

        if n == 0 {
            debug!(conn_id = token.0, peer = %conn.peer, "Peer closed without a request");
            conn.close();
            return Ok(Step::Done);
        }

        let request = &scratch[..n];
        debug!(
            conn_id = token.0,
            peer = %conn.peer,
            bytes = n,
            request = %preview(request),
            "Received request"
        );
        conn.start_writing(responder.respond(request));
    }

    let (response, mut written): (Bytes, usize) = match &conn.state {
        ConnState::Writing { response, written } => (response.clone(), *written),
        ConnState::Closing => return Ok(Step::Done),
        ConnState::AwaitingRequest => return Ok(Step::Waiting),
    };

    while written < response.len() {
        match conn.stream.write(&response[written..]) {
            Ok(0) => {
                return Err(ConnectionError::WriteZero {
                    written,
                    total: response.len(),
                });
            }
            Ok(n) => {
                conn.advance_write(n);
                written += n;
                if written < response.len() {
                    trace!(conn_id = token.0, written, total = response.len(), "Partial write");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Step::WaitWritable),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ConnectionError::Send(e)),
        }
    }

    debug!(conn_id = token.0, bytes = written, "Response sent");
    conn.close();
    Ok(Step::Done)
}

fn close(
    token: Token,
    registry: &mut DescriptorRegistry,
    error: Option<ConnectionError>,
) -> Progress {
    let Some(conn) = registry.unregister(token) else {
        return Progress::Missing;
    };

    match error {
        Some(e) => debug!(conn_id = token.0, peer = %conn.peer, error = %e, "Connection error"),
        None => trace!(conn_id = token.0, peer = %conn.peer, "Exchange complete"),
    }
    drop(conn);

    debug!(conn_id = token.0, active = registry.len(), "Connection closed");
    Progress::Closed
}
