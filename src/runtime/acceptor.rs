//! Listener setup and connection acceptance.

use super::connection::Connection;
use super::error::{AcceptError, RegistryError};
use super::registry::{DescriptorRegistry, Rejected};
use mio::net::TcpListener;
use mio::Token;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a single accept attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// A connection was accepted and registered.
    Registered(Token),
    /// A connection was accepted and closed because the registry refused it.
    Rejected,
    /// No connection was pending.
    Drained,
}

/// Accept at most one pending connection and register it.
pub fn accept_one(
    listener: &TcpListener,
    registry: &mut DescriptorRegistry,
    idle_timeout: Option<Duration>,
) -> Result<Accepted, AcceptError> {
    let (stream, peer) = loop {
        match listener.accept() {
            Ok(pair) => break pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Accepted::Drained),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AcceptError(e)),
        }
    };

    let deadline = idle_timeout.map(|timeout| Instant::now() + timeout);
    match registry.register(Connection::new(stream, peer, deadline)) {
        Ok(token) => {
            debug!(
                conn_id = token.0,
                peer = %peer,
                active = registry.len(),
                "Accepted connection"
            );
            Ok(Accepted::Registered(token))
        }
        Err(Rejected { reason, connection }) => {
            match reason {
                RegistryError::CapacityExceeded { capacity } => {
                    warn!(peer = %peer, capacity, "Connection limit reached, closing");
                }
                RegistryError::Monitor(ref e) => {
                    warn!(peer = %peer, error = %e, "Failed to monitor connection, closing");
                }
            }
            drop(connection);
            Ok(Accepted::Rejected)
        }
    }
}

/// Create a non-blocking listening socket bound to `addr`.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;

    fn setup(capacity: usize) -> (Poll, DescriptorRegistry, TcpListener, SocketAddr) {
        let poll = Poll::new().unwrap();
        let registry = DescriptorRegistry::new(poll.registry().try_clone().unwrap(), capacity);
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        (poll, registry, listener, addr)
    }

    /// Retry until the kernel has queued the connection.
    fn accept_pending(
        listener: &TcpListener,
        registry: &mut DescriptorRegistry,
    ) -> Accepted {
        for _ in 0..100 {
            match accept_one(listener, registry, None).unwrap() {
                Accepted::Drained => std::thread::sleep(Duration::from_millis(5)),
                other => return other,
            }
        }
        panic!("no connection arrived");
    }

    #[test]
    fn test_empty_backlog_is_drained() {
        let (_poll, mut registry, listener, _addr) = setup(4);
        assert_eq!(
            accept_one(&listener, &mut registry, None).unwrap(),
            Accepted::Drained
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_accepts_one_per_call() {
        let (_poll, mut registry, listener, addr) = setup(4);
        let _a = std::net::TcpStream::connect(addr).unwrap();
        let _b = std::net::TcpStream::connect(addr).unwrap();

        assert!(matches!(
            accept_pending(&listener, &mut registry),
            Accepted::Registered(_)
        ));
        assert_eq!(registry.len(), 1);

        assert!(matches!(
            accept_pending(&listener, &mut registry),
            Accepted::Registered(_)
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_capacity_rejection_closes_connection() {
        use std::io::Read;

        let (_poll, mut registry, listener, addr) = setup(1);
        let _first = std::net::TcpStream::connect(addr).unwrap();
        assert!(matches!(
            accept_pending(&listener, &mut registry),
            Accepted::Registered(_)
        ));

        let mut second = std::net::TcpStream::connect(addr).unwrap();
        assert_eq!(accept_pending(&listener, &mut registry), Accepted::Rejected);
        assert_eq!(registry.len(), 1);

        // The rejected client sees EOF without any response bytes.
        second
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(second.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_idle_deadline_recorded() {
        let (_poll, mut registry, listener, addr) = setup(4);
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let before = Instant::now();
        let token = loop {
            match accept_one(&listener, &mut registry, Some(Duration::from_secs(5))).unwrap() {
                Accepted::Registered(token) => break token,
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        };

        let deadline = registry.get_mut(token).unwrap().deadline.unwrap();
        assert!(deadline >= before + Duration::from_secs(5));
    }

    #[test]
    fn test_bind_conflict_is_error() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let taken = listener.local_addr().unwrap();
        assert!(bind_listener(taken, 16).is_err());
    }
}
