//! Registry of active connections.
//!
//! A connection is a member exactly while it is registered with the poller:
//! `register` and `unregister` change both together, so the readiness
//! interest set always equals the membership.

use super::connection::Connection;
use super::error::RegistryError;
use mio::{Interest, Token};
use slab::Slab;
use std::io;
use std::time::Instant;
use tracing::debug;

/// Slots reserved up front; the slab grows past this on demand.
const INITIAL_SLOTS: usize = 1024;

/// A connection the registry refused, handed back so the caller can close it.
#[derive(Debug)]
pub struct Rejected {
    pub reason: RegistryError,
    pub connection: Connection,
}

/// Bounded set of active connections keyed by poll token.
pub struct DescriptorRegistry {
    connections: Slab<Connection>,
    capacity: usize,
    selector: mio::Registry,
}

impl DescriptorRegistry {
    /// Create a registry that monitors its members through `selector`.
    pub fn new(selector: mio::Registry, capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity.min(INITIAL_SLOTS)),
            capacity,
            selector,
        }
    }

    /// Add a connection and start monitoring it for readability.
    pub fn register(&mut self, mut conn: Connection) -> Result<Token, Rejected> {
        if self.connections.len() >= self.capacity {
            return Err(Rejected {
                reason: RegistryError::CapacityExceeded {
                    capacity: self.capacity,
                },
                connection: conn,
            });
        }

        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        if let Err(e) = self
            .selector
            .register(&mut conn.stream, token, conn.interest)
        {
            return Err(Rejected {
                reason: RegistryError::Monitor(e),
                connection: conn,
            });
        }

        entry.insert(conn);
        Ok(token)
    }

    /// Remove a connection and stop monitoring it.
    ///
    /// Returns `None` when `token` is not a member. Dropping the returned
    /// connection closes its socket.
    pub fn unregister(&mut self, token: Token) -> Option<Connection> {
        let mut conn = self.connections.try_remove(token.0)?;
        if let Err(e) = self.selector.deregister(&mut conn.stream) {
            debug!(conn_id = token.0, error = %e, "Deregister failed");
        }
        Some(conn)
    }

    /// Switch the readiness a member is monitored for.
    pub fn set_interest(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        if conn.interest != interest {
            self.selector
                .reregister(&mut conn.stream, token, interest)?;
            conn.interest = interest;
        }
        Ok(())
    }

    /// Current members in iteration (ascending token) order.
    pub fn members(&self) -> impl Iterator<Item = Token> + '_ {
        self.connections.iter().map(|(key, _)| Token(key))
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(token.0)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    /// Earliest idle deadline among members.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.connections
            .iter()
            .filter_map(|(_, conn)| conn.deadline)
            .min()
    }

    /// Members whose deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<Token> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_expired(now))
            .map(|(key, _)| Token(key))
            .collect()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpStream;
    use mio::Poll;
    use std::time::Duration;

    fn connection(deadline: Option<Instant>) -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (
            Connection::new(TcpStream::from_std(server), peer, deadline),
            client,
        )
    }

    fn registry(poll: &Poll, capacity: usize) -> DescriptorRegistry {
        DescriptorRegistry::new(poll.registry().try_clone().unwrap(), capacity)
    }

    #[test]
    fn test_register_until_full() {
        let poll = Poll::new().unwrap();
        let mut registry = registry(&poll, 2);

        let (c1, _k1) = connection(None);
        let (c2, _k2) = connection(None);
        let (c3, _k3) = connection(None);

        let t1 = registry.register(c1).unwrap();
        let t2 = registry.register(c2).unwrap();
        assert_ne!(t1, t2);

        match registry.register(c3) {
            Err(Rejected {
                reason: RegistryError::CapacityExceeded { capacity: 2 },
                ..
            }) => {}
            other => panic!("unexpected: {:?}", other.map(|t| t.0)),
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
    }

    #[test]
    fn test_large_capacity_is_not_reserved_up_front() {
        let poll = Poll::new().unwrap();
        // Reserving every slot of a near-unbounded capacity would abort.
        let mut registry = registry(&poll, usize::MAX);
        assert_eq!(registry.capacity(), usize::MAX);

        let mut clients = Vec::new();
        for _ in 0..4 {
            let (conn, client) = connection(None);
            clients.push(client);
            registry.register(conn).unwrap();
        }
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let poll = Poll::new().unwrap();
        let mut registry = registry(&poll, 4);

        let (c1, _k1) = connection(None);
        let token = registry.register(c1).unwrap();
        assert!(registry.contains(token));

        assert!(registry.unregister(token).is_some());
        assert!(!registry.contains(token));
        assert!(registry.unregister(token).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_members_track_membership() {
        let poll = Poll::new().unwrap();
        let mut registry = registry(&poll, 8);

        let mut clients = Vec::new();
        let mut tokens = Vec::new();
        for _ in 0..3 {
            let (conn, client) = connection(None);
            clients.push(client);
            tokens.push(registry.register(conn).unwrap());
        }

        registry.unregister(tokens[1]);
        let members: Vec<Token> = registry.members().collect();
        assert_eq!(members, vec![tokens[0], tokens[2]]);
    }

    #[test]
    fn test_set_interest() {
        let poll = Poll::new().unwrap();
        let mut registry = registry(&poll, 1);

        let (conn, _client) = connection(None);
        let token = registry.register(conn).unwrap();
        registry.set_interest(token, Interest::WRITABLE).unwrap();
        assert_eq!(registry.get_mut(token).unwrap().interest, Interest::WRITABLE);

        registry.unregister(token);
        assert!(registry.set_interest(token, Interest::READABLE).is_err());
    }

    #[test]
    fn test_deadlines() {
        let poll = Poll::new().unwrap();
        let mut registry = registry(&poll, 4);
        let now = Instant::now();

        let (early, _k1) = connection(Some(now + Duration::from_millis(10)));
        let (late, _k2) = connection(Some(now + Duration::from_secs(10)));
        let (never, _k3) = connection(None);
        let early = registry.register(early).unwrap();
        registry.register(late).unwrap();
        registry.register(never).unwrap();

        assert_eq!(
            registry.next_deadline(),
            Some(now + Duration::from_millis(10))
        );
        assert_eq!(registry.expired(now + Duration::from_secs(1)), vec![early]);
        assert!(registry.expired(now).is_empty());
    }
}
