//! Error taxonomy for the event loop.
//!
//! Only `ServerError` ever leaves the loop. Accept, registry and connection
//! errors are handled where they occur and only logged.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Fatal errors: the server cannot continue.
#[derive(Debug)]
pub enum ServerError {
    /// Socket creation, bind, listen or poller setup failed.
    Setup {
        stage: &'static str,
        source: io::Error,
    },
    /// The readiness wait itself failed.
    Poll(io::Error),
}

impl ServerError {
    pub(crate) fn setup(stage: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| ServerError::Setup { stage, source }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Setup { stage, source } => write!(f, "{stage} failed: {source}"),
            ServerError::Poll(e) => write!(f, "poll failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Setup { source, .. } => Some(source),
            ServerError::Poll(e) => Some(e),
        }
    }
}

/// Accept on a ready listener failed. Recoverable.
#[derive(Debug)]
pub struct AcceptError(pub io::Error);

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "accept failed: {}", self.0)
    }
}

impl std::error::Error for AcceptError {}

impl AcceptError {
    /// The failure belonged to one pending connection, so the next one in
    /// the backlog can be accepted straight away.
    ///
    /// Anything else (descriptor or buffer exhaustion in particular) is
    /// likely to fail again until resources are released.
    pub fn is_per_connection(&self) -> bool {
        match self.0.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::PermissionDenied => true,
            _ => matches!(
                self.0.raw_os_error(),
                Some(
                    libc::EPROTO
                        | libc::ENETDOWN
                        | libc::ENETUNREACH
                        | libc::EHOSTDOWN
                        | libc::EHOSTUNREACH
                        | libc::ENOPROTOOPT
                        | libc::EOPNOTSUPP
                )
            ),
        }
    }
}

/// Why the registry refused a connection.
#[derive(Debug)]
pub enum RegistryError {
    CapacityExceeded { capacity: usize },
    /// The poller refused to monitor the descriptor.
    Monitor(io::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapacityExceeded { capacity } => {
                write!(f, "registry full ({capacity} connections)")
            }
            RegistryError::Monitor(e) => write!(f, "failed to monitor connection: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Failure on a single connection. Closes that connection only.
#[derive(Debug)]
pub enum ConnectionError {
    Recv(io::Error),
    Send(io::Error),
    /// The peer accepted zero bytes of a non-empty write.
    WriteZero { written: usize, total: usize },
    /// Switching the connection's readiness interest failed.
    Rearm(io::Error),
    TimedOut { peer: SocketAddr },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Recv(e) => write!(f, "recv failed: {e}"),
            ConnectionError::Send(e) => write!(f, "send failed: {e}"),
            ConnectionError::WriteZero { written, total } => {
                write!(f, "short write: {written} of {total} bytes accepted")
            }
            ConnectionError::Rearm(e) => write!(f, "failed to re-arm interest: {e}"),
            ConnectionError::TimedOut { peer } => write!(f, "idle timeout for {peer}"),
        }
    }
}

impl std::error::Error for ConnectionError {}
