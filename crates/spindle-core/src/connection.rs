//! Per-socket connection state machine.
//!
//! A [`Connection`] wraps one non-blocking OS socket with buffered I/O and a
//! lifecycle callback surface ([`ConnectionHandler`]). Client connections go
//! `connecting → connected → closed`; server-accepted and local (UNIX)
//! sockets are connected immediately; listeners never leave the accepting
//! state. Once attached, a connection is owned exclusively by its reactor's
//! thread — every callback runs there, one at a time.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use tracing::trace;

use crate::error::ConnectionError;
use crate::reactor::ConnectionCtx;
#[cfg(feature = "tls")]
use crate::tls::{TlsConfig, TlsSession};

/// How many bytes one read or write syscall moves at most per iteration of
/// a drain loop.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Whether this platform supports UNIX-domain socket transports. Callers
/// must probe this before using a filesystem endpoint.
pub const fn supports_unix_sockets() -> bool {
    cfg!(unix)
}

/// Which side of the conversation a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the connection.
    Client,
    /// Accepted by a listener.
    Server,
    /// Accepts new connections and spawns `Server` connections for them.
    Listener,
}

/// Transport address: TCP host/port or a filesystem socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }
}

/// Callback contract for connection consumers.
///
/// All callbacks run on the reactor thread, never concurrently with one
/// another. Fallible callbacks that return `Err` feed the reactor's error
/// handlers and close the connection with that error as the reason.
pub trait ConnectionHandler: Send + 'static {
    /// The connection was registered with a reactor.
    fn on_attach(&mut self, ctx: &mut ConnectionCtx<'_>) -> Result<(), ConnectionError> {
        let _ = ctx;
        Ok(())
    }

    /// The transport is established (and, when TLS is configured, the
    /// handshake has completed).
    fn on_connect(&mut self, ctx: &mut ConnectionCtx<'_>) -> Result<(), ConnectionError> {
        let _ = ctx;
        Ok(())
    }

    /// Bytes arrived. Partial protocol frames are the callee's concern.
    fn on_read(&mut self, ctx: &mut ConnectionCtx<'_>, data: &[u8]) -> Result<(), ConnectionError> {
        let _ = (ctx, data);
        Ok(())
    }

    /// Part of the write buffer was flushed to the socket.
    fn on_write(&mut self, ctx: &mut ConnectionCtx<'_>, flushed: usize) -> Result<(), ConnectionError> {
        let _ = (ctx, flushed);
        Ok(())
    }

    /// The write buffer drained completely.
    fn on_flush(&mut self, ctx: &mut ConnectionCtx<'_>) -> Result<(), ConnectionError> {
        let _ = ctx;
        Ok(())
    }

    /// The connection closed. `reason` is `None` for a clean local close or
    /// peer EOF, `Some` for errors. Called exactly once.
    fn on_close(&mut self, ctx: &mut ConnectionCtx<'_>, reason: Option<&ConnectionError>) {
        let _ = (ctx, reason);
    }

    /// The connection left the reactor's registry.
    fn on_detach(&mut self, ctx: &mut ConnectionCtx<'_>) {
        let _ = ctx;
    }
}

/// Spawns a handler for each connection a listener accepts.
pub type ServerFactory = Box<dyn FnMut(&Endpoint) -> Box<dyn ConnectionHandler> + Send>;

enum Socket {
    Tcp(TcpStream),
    TcpListener(TcpListener),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(unix)]
    UnixListener(UnixListener),
}

impl Socket {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.register(s, token, interest),
            Self::TcpListener(s) => registry.register(s, token, interest),
            #[cfg(unix)]
            Self::Unix(s) => registry.register(s, token, interest),
            #[cfg(unix)]
            Self::UnixListener(s) => registry.register(s, token, interest),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.reregister(s, token, interest),
            Self::TcpListener(s) => registry.reregister(s, token, interest),
            #[cfg(unix)]
            Self::Unix(s) => registry.reregister(s, token, interest),
            #[cfg(unix)]
            Self::UnixListener(s) => registry.reregister(s, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.deregister(s),
            Self::TcpListener(s) => registry.deregister(s),
            #[cfg(unix)]
            Self::Unix(s) => registry.deregister(s),
            #[cfg(unix)]
            Self::UnixListener(s) => registry.deregister(s),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
            _ => Err(io::Error::new(io::ErrorKind::Unsupported, "not a stream")),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
            _ => Err(io::Error::new(io::ErrorKind::Unsupported, "not a stream")),
        }
    }
}

/// `io::Read` view over a stream socket, for the TLS record layer.
#[cfg(feature = "tls")]
struct SocketReader<'a>(&'a mut Socket);

#[cfg(feature = "tls")]
impl Read for SocketReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Result of one readable pass over a connection.
#[derive(Default)]
pub(crate) struct ReadOutcome {
    pub data: Vec<u8>,
    pub eof: bool,
    pub error: Option<ConnectionError>,
    /// TLS handshake completed during this pass.
    pub became_ready: bool,
}

/// Result of one writable pass over a connection.
#[derive(Default)]
pub(crate) struct WriteOutcome {
    pub flushed: usize,
    pub emptied: bool,
    pub error: Option<ConnectionError>,
}

/// One OS socket plus its buffers, role, and handler.
pub struct Connection {
    pub(crate) token: Option<Token>,
    socket: Socket,
    role: Role,
    endpoint: Endpoint,
    pub(crate) connected: bool,
    pub(crate) closed: bool,
    /// `on_connect` has been delivered.
    pub(crate) connect_notified: bool,
    /// One of this connection's callbacks is currently on the stack.
    pub(crate) in_dispatch: bool,
    /// A close was requested while a callback was in flight.
    pub(crate) close_requested: bool,
    pub(crate) close_reason: Option<ConnectionError>,
    write_buf: BytesMut,
    pub(crate) handler: Option<Box<dyn ConnectionHandler>>,
    factory: Option<ServerFactory>,
    /// Socket file owned by a UNIX listener, unlinked on close.
    unix_path: Option<PathBuf>,
    pub(crate) registered: Option<Interest>,
    #[cfg(feature = "tls")]
    tls: Option<TlsSession>,
    #[cfg(feature = "tls")]
    tls_server: Option<std::sync::Arc<rustls::ServerConfig>>,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectionError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| ConnectionError::Dns(format!("{host}:{port}")))?
        .next()
        .ok_or_else(|| ConnectionError::Dns(format!("{host}:{port}")))
}

impl Connection {
    fn new(socket: Socket, role: Role, endpoint: Endpoint, connected: bool,
           handler: Option<Box<dyn ConnectionHandler>>) -> Self {
        Self {
            token: None,
            socket,
            role,
            endpoint,
            connected,
            closed: false,
            connect_notified: false,
            in_dispatch: false,
            close_requested: false,
            close_reason: None,
            write_buf: BytesMut::new(),
            handler,
            factory: None,
            unix_path: None,
            registered: None,
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(feature = "tls")]
            tls_server: None,
        }
    }

    /// Begin a non-blocking TCP connect. The reactor finishes the connect
    /// on a later tick.
    pub fn connect_tcp(
        host: &str,
        port: u16,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<Self, ConnectionError> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect(addr)
            .map_err(|e| ConnectionError::from_io(e, &format!("{host}:{port}")))?;
        Ok(Self::new(
            Socket::Tcp(stream),
            Role::Client,
            Endpoint::tcp(host, port),
            false,
            Some(handler),
        ))
    }

    /// Begin a non-blocking TCP connect with a TLS upgrade once the
    /// transport is up.
    #[cfg(feature = "tls")]
    pub fn connect_tls(
        host: &str,
        port: u16,
        tls: &TlsConfig,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<Self, ConnectionError> {
        let mut conn = Self::connect_tcp(host, port, handler)?;
        conn.tls = Some(TlsSession::client(tls, host)?);
        Ok(conn)
    }

    /// Connect to a UNIX-domain socket. Local transports are connected
    /// immediately.
    #[cfg(unix)]
    pub fn connect_unix(
        path: impl AsRef<Path>,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<Self, ConnectionError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .map_err(|e| ConnectionError::from_io(e, &path.display().to_string()))?;
        Ok(Self::new(
            Socket::Unix(stream),
            Role::Client,
            Endpoint::unix(path),
            true,
            Some(handler),
        ))
    }

    /// Bind a TCP listener. Accepted connections get handlers from
    /// `factory`.
    pub fn listen_tcp(host: &str, port: u16, factory: ServerFactory) -> Result<Self, ConnectionError> {
        let addr = resolve(host, port)?;
        let listener = TcpListener::bind(addr)
            .map_err(|e| ConnectionError::from_io(e, &format!("{host}:{port}")))?;
        let mut conn = Self::new(
            Socket::TcpListener(listener),
            Role::Listener,
            Endpoint::tcp(host, port),
            true,
            None,
        );
        conn.factory = Some(factory);
        Ok(conn)
    }

    /// Bind a TCP listener whose accepted connections speak TLS.
    #[cfg(feature = "tls")]
    pub fn listen_tls(
        host: &str,
        port: u16,
        tls: &TlsConfig,
        factory: ServerFactory,
    ) -> Result<Self, ConnectionError> {
        let mut conn = Self::listen_tcp(host, port, factory)?;
        conn.tls_server = Some(tls.server_config()?);
        Ok(conn)
    }

    /// Bind a UNIX-domain listener. The socket file is removed when the
    /// listener closes.
    #[cfg(unix)]
    pub fn listen_unix(path: impl AsRef<Path>, factory: ServerFactory) -> Result<Self, ConnectionError> {
        let path = path.as_ref();
        let listener = UnixListener::bind(path)
            .map_err(|e| ConnectionError::from_io(e, &path.display().to_string()))?;
        let mut conn = Self::new(
            Socket::UnixListener(listener),
            Role::Listener,
            Endpoint::unix(path),
            true,
            None,
        );
        conn.factory = Some(factory);
        conn.unix_path = Some(path.to_path_buf());
        Ok(conn)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes queued but not yet flushed to the socket.
    pub fn write_buffered(&self) -> usize {
        self.write_buf.len()
    }

    /// Actual bound address (listeners; useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            Socket::TcpListener(l) => l.local_addr().ok(),
            Socket::Tcp(s) => s.local_addr().ok(),
            #[cfg(unix)]
            _ => None,
        }
    }

    /// The transport is up and (if TLS) the handshake is done: handler
    /// traffic may flow.
    pub(crate) fn ready_for_handler(&self) -> bool {
        if !self.connected {
            return false;
        }
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            return tls.is_ready();
        }
        true
    }

    pub(crate) fn desired_interest(&self) -> Interest {
        if self.role == Role::Listener {
            return Interest::READABLE;
        }
        if !self.connected {
            // Connect completion is signalled as writability.
            return Interest::WRITABLE;
        }
        let mut wants_write = !self.write_buf.is_empty();
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            wants_write = wants_write || tls.wants_write();
        }
        if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.desired_interest();
        self.socket.register(registry, token, interest)?;
        self.registered = Some(interest);
        Ok(())
    }

    pub(crate) fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.desired_interest();
        if self.registered != Some(interest) {
            self.socket.reregister(registry, token, interest)?;
            self.registered = Some(interest);
        }
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = self.socket.deregister(registry);
        self.registered = None;
    }

    /// Advance a pending non-blocking connect. Returns `Ok(true)` when the
    /// transport just became established.
    pub(crate) fn try_finish_connect(&mut self) -> Result<bool, ConnectionError> {
        if self.connected || self.closed {
            return Ok(false);
        }
        let peer = self.endpoint.to_string();
        let Socket::Tcp(stream) = &mut self.socket else {
            return Ok(false);
        };
        if let Some(err) = stream
            .take_error()
            .map_err(|e| ConnectionError::from_io(e, &peer))?
        {
            return Err(ConnectionError::from_io(err, &peer));
        }
        match stream.peer_addr() {
            Ok(_) => {
                trace!(%peer, "connected");
                self.connected = true;
                #[cfg(feature = "tls")]
                if let Some(tls) = &mut self.tls {
                    // Push the ClientHello out with the first flush.
                    tls.pump_out(&mut self.write_buf)?;
                }
                Ok(true)
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(115) /* EINPROGRESS */ =>
            {
                Ok(false)
            }
            Err(e) => Err(ConnectionError::from_io(e, &peer)),
        }
    }

    /// Drain readable bytes. mio is edge-triggered, so this loops until the
    /// socket would block; partial protocol frames remain the wire layer's
    /// concern.
    pub(crate) fn do_read(&mut self) -> ReadOutcome {
        let mut out = ReadOutcome::default();
        if self.closed || self.role == Role::Listener {
            return out;
        }
        let peer = self.endpoint.to_string();

        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            let Connection {
                socket,
                tls,
                write_buf,
                ..
            } = self;
            let tls = tls.as_mut().expect("tls session present");
            let mut reader = SocketReader(socket);
            let tls_read = tls.pump_read(&mut reader, write_buf);
            out.data = tls_read.plaintext;
            out.eof = tls_read.eof;
            out.error = tls_read.error;
            out.became_ready = tls_read.became_ready;
            return out;
        }

        let mut scratch = [0u8; BLOCK_SIZE];
        loop {
            match self.socket.read(&mut scratch) {
                Ok(0) => {
                    out.eof = true;
                    break;
                }
                Ok(n) => out.data.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    out.error = Some(ConnectionError::from_io(e, &peer));
                    break;
                }
            }
        }
        out
    }

    /// Accept every pending connection on a listener, building a `Server`
    /// connection for each via the factory.
    pub(crate) fn accept_pending(&mut self) -> (Vec<Connection>, Option<ConnectionError>) {
        let mut accepted = Vec::new();
        let factory = match self.factory.as_mut() {
            Some(f) => f,
            None => return (accepted, None),
        };
        loop {
            match &mut self.socket {
                Socket::TcpListener(listener) => match listener.accept() {
                    Ok((stream, addr)) => {
                        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());
                        let handler = factory(&endpoint);
                        let mut conn = Connection::new(
                            Socket::Tcp(stream),
                            Role::Server,
                            endpoint,
                            true,
                            Some(handler),
                        );
                        #[cfg(feature = "tls")]
                        if let Some(config) = &self.tls_server {
                            match TlsSession::server(config.clone()) {
                                Ok(session) => conn.tls = Some(session),
                                Err(e) => return (accepted, Some(e)),
                            }
                        }
                        accepted.push(conn);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let peer = self.endpoint.to_string();
                        return (accepted, Some(ConnectionError::from_io(e, &peer)));
                    }
                },
                #[cfg(unix)]
                Socket::UnixListener(listener) => match listener.accept() {
                    Ok((stream, _addr)) => {
                        let endpoint = self.endpoint.clone();
                        let handler = factory(&endpoint);
                        let conn = Connection::new(
                            Socket::Unix(stream),
                            Role::Server,
                            endpoint,
                            true,
                            Some(handler),
                        );
                        accepted.push(conn);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let peer = self.endpoint.to_string();
                        return (accepted, Some(ConnectionError::from_io(e, &peer)));
                    }
                },
                _ => break,
            }
        }
        (accepted, None)
    }

    /// Append bytes for transmission. Never blocks; the reactor flushes the
    /// buffer during its readiness passes.
    pub(crate) fn queue_write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        #[cfg(feature = "tls")]
        if let Some(tls) = &mut self.tls {
            return tls.queue_plaintext(data, &mut self.write_buf);
        }
        self.write_buf.extend_from_slice(data);
        Ok(())
    }

    /// Flush the write buffer, looping while partial writes keep
    /// succeeding.
    pub(crate) fn do_write(&mut self) -> WriteOutcome {
        let mut out = WriteOutcome::default();
        if self.closed {
            return out;
        }
        let peer = self.endpoint.to_string();

        #[cfg(feature = "tls")]
        if let Some(tls) = &mut self.tls {
            // Keep handshake/alert records flowing into the wire buffer.
            if let Err(e) = tls.pump_out(&mut self.write_buf) {
                out.error = Some(e);
                return out;
            }
        }

        while !self.write_buf.is_empty() {
            let chunk = self.write_buf.len().min(BLOCK_SIZE);
            match self.socket.write(&self.write_buf[..chunk]) {
                Ok(0) => {
                    out.error = Some(ConnectionError::Reset(peer));
                    break;
                }
                Ok(n) => {
                    self.write_buf.advance(n);
                    out.flushed += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    out.error = Some(ConnectionError::from_io(e, &peer));
                    break;
                }
            }
        }
        out.emptied = out.flushed > 0 && self.write_buf.is_empty();
        out
    }

    /// Surface a socket-level error condition reported by the poller.
    pub(crate) fn take_socket_error(&mut self) -> Option<ConnectionError> {
        let peer = self.endpoint.to_string();
        match &mut self.socket {
            Socket::Tcp(s) => s
                .take_error()
                .ok()
                .flatten()
                .map(|e| ConnectionError::from_io(e, &peer)),
            #[cfg(unix)]
            Socket::Unix(s) => s
                .take_error()
                .ok()
                .flatten()
                .map(|e| ConnectionError::from_io(e, &peer)),
            _ => None,
        }
    }

    /// Remove the socket file a UNIX listener created.
    pub(crate) fn unlink_unix_socket(&self) {
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;
    impl ConnectionHandler for Quiet {}

    fn quiet_factory() -> ServerFactory {
        Box::new(|_| Box::new(Quiet) as Box<dyn ConnectionHandler>)
    }

    #[test]
    fn listener_reports_bound_address() {
        let conn = Connection::listen_tcp("127.0.0.1", 0, quiet_factory()).unwrap();
        let addr = conn.local_addr().expect("bound address");
        assert_ne!(addr.port(), 0);
        assert_eq!(conn.role(), Role::Listener);
        assert!(conn.is_connected());
        assert_eq!(conn.desired_interest(), Interest::READABLE);
    }

    #[test]
    fn pending_client_wants_writable_until_connected() {
        let listener = Connection::listen_tcp("127.0.0.1", 0, quiet_factory()).unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = Connection::connect_tcp("127.0.0.1", port, Box::new(Quiet)).unwrap();
        assert_eq!(conn.role(), Role::Client);
        assert!(!conn.is_connected());
        assert_eq!(conn.desired_interest(), Interest::WRITABLE);
    }

    #[test]
    fn dns_failure_is_typed() {
        let err = Connection::connect_tcp("definitely-not-a-host.invalid.", 1, Box::new(Quiet))
            .err()
            .expect("resolution must fail");
        assert!(matches!(err, ConnectionError::Dns(_)));
    }

    #[test]
    fn endpoint_displays_as_address() {
        assert_eq!(Endpoint::tcp("10.0.0.1", 80).to_string(), "10.0.0.1:80");
    }
}
