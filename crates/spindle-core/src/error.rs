//! Error taxonomy for the reactor and the RPC layers built on it.
//!
//! Every failure a caller can observe is one of the [`RpcError`] kinds, and
//! [`RpcError::kind`] answers the uniform "is this an RPC error, and which
//! kind" query without downcasting. Transport-level failures are grouped
//! under [`ConnectionError`]; [`ReactorError`] covers misuse of the event
//! loop itself.

use core::fmt;

/// Discriminant for the RPC error taxonomy.
///
/// Embedding layers pattern-match on this to decide retry/failover behavior
/// (e.g. treating `Connection` as "peer seems dead").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Remote,
    InvalidObject,
    UnsafeMethod,
    InvalidMethod,
    InvalidToken,
    SslPeerVerification,
}

impl ErrorKind {
    /// Wire name for this kind, as carried in a response fault.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "ConnectionError",
            Self::Remote => "RemoteException",
            Self::InvalidObject => "InvalidObject",
            Self::UnsafeMethod => "UnsafeMethod",
            Self::InvalidMethod => "InvalidMethod",
            Self::InvalidToken => "InvalidToken",
            Self::SslPeerVerification => "SSLPeerVerificationFailed",
        }
    }

    /// Inverse of [`as_str`](Self::as_str), for reconstructing typed errors
    /// from the wire.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "ConnectionError" => Some(Self::Connection),
            "RemoteException" => Some(Self::Remote),
            "InvalidObject" => Some(Self::InvalidObject),
            "UnsafeMethod" => Some(Self::UnsafeMethod),
            "InvalidMethod" => Some(Self::InvalidMethod),
            "InvalidToken" => Some(Self::InvalidToken),
            "SSLPeerVerificationFailed" => Some(Self::SslPeerVerification),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure: the bytes never made it, or the peer is gone.
#[derive(Debug)]
pub enum ConnectionError {
    /// Peer actively refused the connection.
    Refused(String),
    /// Established connection was reset or the peer hung up mid-stream.
    Reset(String),
    /// Host name did not resolve.
    Dns(String),
    /// UNIX socket path is missing or not a socket.
    InvalidPath(String),
    /// TLS handshake or record-layer failure.
    Tls(String),
    /// TLS peer certificate verification failed.
    PeerVerification(String),
    /// The peer sent bytes that do not parse as frames or messages.
    Protocol(String),
    /// The transport went away before the operation completed (connection
    /// closed, reactor stopped).
    Closed(String),
    /// Misuse of the API (e.g. a blocking call issued from the reactor's
    /// own thread, which would starve the thread that delivers the result).
    Usage(String),
    /// Any other socket-level error.
    Io(std::io::Error),
}

impl ConnectionError {
    /// Classify an I/O error into the taxonomy, keeping the peer address
    /// (or path) for the message.
    pub fn from_io(err: std::io::Error, peer: &str) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::ConnectionRefused => Self::Refused(peer.to_string()),
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe | Io::UnexpectedEof => {
                Self::Reset(peer.to_string())
            }
            Io::NotFound => Self::InvalidPath(peer.to_string()),
            _ => Self::Io(err),
        }
    }

    /// True for the TLS peer-verification specialization.
    pub fn is_peer_verification(&self) -> bool {
        matches!(self, Self::PeerVerification(_))
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(peer) => write!(f, "connection refused by {peer}"),
            Self::Reset(peer) => write!(f, "connection reset by {peer}"),
            Self::Dns(host) => write!(f, "failed to resolve {host}"),
            Self::InvalidPath(path) => write!(f, "invalid socket path {path}"),
            Self::Tls(msg) => write!(f, "TLS failure: {msg}"),
            Self::PeerVerification(msg) => write!(f, "TLS peer verification failed: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Closed(msg) => write!(f, "transport closed: {msg}"),
            Self::Usage(msg) => write!(f, "{msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A server-side exception reified for transmission back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    /// Type name of the remote error.
    pub class: String,
    /// Error message.
    pub message: String,
    /// Remote backtrace lines, if captured.
    pub backtrace: Vec<String>,
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// High-level RPC errors.
///
/// Synchronous calls return these as `Err`; asynchronous calls deliver them
/// as the callback's value. Callers test [`kind`](Self::kind) before treating
/// a delivered value as a normal result.
#[derive(Debug)]
pub enum RpcError {
    /// Transport failed before a response arrived.
    Connection(ConnectionError),
    /// The handler method itself raised on the server side.
    Remote(RemoteFault),
    /// Requested handler name is not registered.
    InvalidObject(String),
    /// Requested method exists but is not on the exposed surface.
    UnsafeMethod(String),
    /// Requested method does not exist on the handler.
    InvalidMethod(String),
    /// Bearer token mismatch.
    InvalidToken,
}

impl RpcError {
    /// Which taxonomy kind this error is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(ConnectionError::PeerVerification(_)) => {
                ErrorKind::SslPeerVerification
            }
            Self::Connection(_) => ErrorKind::Connection,
            Self::Remote(_) => ErrorKind::Remote,
            Self::InvalidObject(_) => ErrorKind::InvalidObject,
            Self::UnsafeMethod(_) => ErrorKind::UnsafeMethod,
            Self::InvalidMethod(_) => ErrorKind::InvalidMethod,
            Self::InvalidToken => ErrorKind::InvalidToken,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "connection error: {e}"),
            Self::Remote(fault) => write!(f, "remote exception: {fault}"),
            Self::InvalidObject(name) => write!(f, "no handler registered as {name:?}"),
            Self::UnsafeMethod(name) => write!(f, "method {name:?} is not remotely callable"),
            Self::InvalidMethod(name) => write!(f, "no such method {name:?}"),
            Self::InvalidToken => write!(f, "token mismatch"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for RpcError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

/// Event-loop lifecycle errors.
#[derive(Debug)]
pub enum ReactorError {
    /// `run` was called while the reactor is already running.
    AlreadyRunning,
    /// A task constructor was called while the reactor is not running.
    NotRunning,
    /// The OS polling primitive failed.
    Io(std::io::Error),
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "reactor is already running"),
            Self::NotRunning => write!(f, "reactor is not running"),
            Self::Io(e) => write!(f, "poll error: {e}"),
        }
    }
}

impl std::error::Error for ReactorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReactorError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_names() {
        let kinds = [
            ErrorKind::Connection,
            ErrorKind::Remote,
            ErrorKind::InvalidObject,
            ErrorKind::UnsafeMethod,
            ErrorKind::InvalidMethod,
            ErrorKind::InvalidToken,
            ErrorKind::SslPeerVerification,
        ];
        for kind in kinds {
            assert_eq!(ErrorKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_wire("NoSuchKind"), None);
    }

    #[test]
    fn peer_verification_is_a_connection_specialization() {
        let err = RpcError::Connection(ConnectionError::PeerVerification("bad cert".into()));
        assert_eq!(err.kind(), ErrorKind::SslPeerVerification);

        let err = RpcError::Connection(ConnectionError::Refused("127.0.0.1:1".into()));
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(
            ConnectionError::from_io(refused, "10.0.0.1:80"),
            ConnectionError::Refused(_)
        ));

        let reset = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(
            ConnectionError::from_io(reset, "10.0.0.1:80"),
            ConnectionError::Reset(_)
        ));
    }
}
