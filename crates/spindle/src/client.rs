//! The RPC client: a reactor thread and a bounded connection pool.
//!
//! A call borrows a pooled connection (opening one if the pool is under its
//! bound), frames the request, and parks a completion callback in the
//! pending map. The reactor delivers the response — or a synthesized
//! connection error — to that callback, and the connection returns to the
//! pool for the next caller. A connection that died while idle is discarded
//! and replaced transparently; it never carried anyone's request, so no
//! stale error surfaces.
//!
//! Synchronous calls block the calling thread on a channel and therefore
//! refuse to run on the reactor's own thread: blocking there would starve
//! the thread responsible for delivering the result.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use spindle_core::{
    frame, Connection, ConnectionCtx, ConnectionError, ConnectionHandler, CrossQueue, Endpoint,
    FrameCodec, Handle, JsonSerializer, Message, Reactor, Request, RpcError, Serializer, Token,
    Value,
};
#[cfg(feature = "tls")]
use spindle_core::TlsConfig;

/// Where and how a client connects.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Upper bound on simultaneously open pooled connections.
    pub pool_size: usize,
    /// Bearer token attached to every request.
    pub token: Option<String>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsConfig>,
}

impl ClientConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::tcp(host, port),
            pool_size: 1,
            token: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::unix(path.into()),
            pool_size: 1,
            token: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

type CallCallback = Box<dyn FnOnce(&mut Reactor, Result<Value, RpcError>) + Send>;
type PoolJob = Box<dyn FnOnce(&mut Reactor, Result<Token, RpcError>) + Send>;

struct ClientCore {
    config: ClientConfig,
    serializer: Arc<dyn Serializer>,
    /// Idle connections; waiters queue here when the pool is exhausted.
    pool: CrossQueue<Token>,
    /// In-flight request per borrowed connection.
    pending: Mutex<HashMap<Token, CallCallback>>,
    /// Open-connection count; only mutated inside reactor-scheduled work.
    open: Mutex<usize>,
}

/// An RPC client bound to one server endpoint. Dropping it stops the
/// reactor thread.
pub struct Client {
    core: Arc<ClientCore>,
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, RpcError> {
        Self::with_serializer(config, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(
        config: ClientConfig,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, RpcError> {
        let (handle, thread) = Reactor::spawn("spindle-client")
            .map_err(|e| RpcError::Connection(ConnectionError::Io(e)))?;
        let core = Arc::new(ClientCore {
            config,
            serializer,
            pool: CrossQueue::new(handle.clone()),
            pending: Mutex::new(HashMap::new()),
            open: Mutex::new(0),
        });
        Ok(Self {
            core,
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn pool_size(&self) -> usize {
        self.core.config.pool_size
    }

    /// Currently open pooled connections (instrumentation).
    pub fn open_connections(&self) -> usize {
        *self.core.open.lock()
    }

    /// Call `"handler.method"` and block until the response arrives.
    /// Re-raises the typed error for faults. Must not be issued from the
    /// client's own reactor thread.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if self.handle.is_owner() {
            return Err(RpcError::Connection(ConnectionError::Usage(
                "synchronous call issued from the reactor thread".into(),
            )));
        }
        let (tx, rx) = mpsc::channel();
        self.call_with(method, args, move |result| {
            let _ = tx.send(result);
        });
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(RpcError::Connection(ConnectionError::Closed(
                "client stopped before the call completed".into(),
            ))),
        }
    }

    /// Call `"handler.method"`, delivering the result — success or typed
    /// error — to `callback`. Never blocks; safe from any thread. Callers
    /// must check the result's kind before treating it as a normal value.
    pub fn call_with<F>(&self, method: &str, args: Vec<Value>, callback: F)
    where
        F: FnOnce(Result<Value, RpcError>) + Send + 'static,
    {
        let request = Request::new(method, args, self.core.config.token.clone());
        let core = self.core.clone();
        self.handle.schedule(move |reactor| {
            ClientCore::acquire(
                &core.clone(),
                reactor,
                Box::new(move |reactor, borrowed| match borrowed {
                    Ok(token) => ClientCore::send_on(&core, reactor, token, request, Box::new(
                        move |_reactor, result| callback(result),
                    )),
                    Err(e) => callback(Err(e)),
                }),
            );
        });
    }

    /// Stop the client's reactor and join its thread.
    pub fn close(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientCore {
    /// Borrow a pooled connection for `job`: an idle one when available, a
    /// freshly opened one while `open < pool_size`, otherwise `job` queues
    /// until a connection returns to the pool. Returns whether a new
    /// connection was opened (instrumentation, not correctness).
    fn acquire(core: &Arc<Self>, reactor: &mut Reactor, job: PoolJob) -> bool {
        // Idle connections may have died while pooled; discard and keep
        // looking — they carried no request, so no error surfaces.
        while let Some(token) = core.pool.try_pop(reactor) {
            if reactor
                .connection(token)
                .is_some_and(|conn| !conn.is_closed())
            {
                job(reactor, Ok(token));
                return false;
            }
            debug!(token = token.0, "discarding stale pooled connection");
        }

        let can_open = {
            let mut open = core.open.lock();
            if *open < core.config.pool_size {
                *open += 1;
                true
            } else {
                false
            }
        };

        if can_open {
            match Self::open_connection(core, reactor) {
                Ok(token) => {
                    job(reactor, Ok(token));
                    return true;
                }
                Err(e) => {
                    *core.open.lock() -= 1;
                    job(reactor, Err(e));
                    return false;
                }
            }
        }

        // Pool exhausted: park until a connection is pushed back. The
        // parked job revalidates, since the connection may die between the
        // push and this callback running.
        let core2 = core.clone();
        core.pool.pop_direct(reactor, move |reactor, token| {
            if reactor
                .connection(token)
                .is_some_and(|conn| !conn.is_closed())
            {
                job(reactor, Ok(token));
            } else {
                debug!(token = token.0, "pooled connection died while queued; retrying");
                Self::acquire(&core2, reactor, job);
            }
        });
        false
    }

    fn open_connection(core: &Arc<Self>, reactor: &mut Reactor) -> Result<Token, RpcError> {
        let handler = Box::new(ClientConn::new(core.clone()));
        let conn = Self::connect(core, handler).map_err(RpcError::Connection)?;
        let token = reactor.attach(conn).map_err(RpcError::Connection)?;
        debug!(token = token.0, open = *core.open.lock(), "opened pooled connection");
        Ok(token)
    }

    fn connect(
        core: &Arc<Self>,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<Connection, ConnectionError> {
        match &core.config.endpoint {
            Endpoint::Tcp { host, port } => {
                #[cfg(feature = "tls")]
                if let Some(tls) = &core.config.tls {
                    return Connection::connect_tls(host, *port, tls, handler);
                }
                Connection::connect_tcp(host, *port, handler)
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Connection::connect_unix(path, handler),
        }
    }

    /// Park the completion callback and transmit the framed request. The
    /// write buffers until the connect (and TLS handshake) completes, so a
    /// freshly opened connection is usable immediately.
    fn send_on(
        core: &Arc<Self>,
        reactor: &mut Reactor,
        token: Token,
        request: Request,
        callback: CallCallback,
    ) {
        let bytes = match core.serializer.dump(&Message::Request(request)) {
            Ok(bytes) => bytes,
            Err(e) => {
                callback(
                    reactor,
                    Err(RpcError::Connection(ConnectionError::Protocol(e.to_string()))),
                );
                Self::release(core, reactor, token);
                return;
            }
        };
        core.pending.lock().insert(token, callback);
        reactor.write(token, &frame(&bytes));
    }

    /// Return a connection to the pool, pairing it with the oldest queued
    /// caller if one is waiting.
    fn release(core: &Arc<Self>, reactor: &mut Reactor, token: Token) {
        core.pool.push_direct(reactor, token);
    }

    /// Bookkeeping when a pooled connection closes: fail its in-flight call
    /// (if any) with the close reason, give the slot back, and open a
    /// replacement when callers are queued.
    fn connection_closed(
        core: &Arc<Self>,
        reactor: &mut Reactor,
        token: Token,
        reason: Option<&ConnectionError>,
    ) {
        {
            let mut open = core.open.lock();
            *open = open.saturating_sub(1);
        }
        if let Some(callback) = core.pending.lock().remove(&token) {
            let error = match reason {
                Some(e) => ConnectionError::Closed(e.to_string()),
                None => ConnectionError::Closed("connection closed before a response".into()),
            };
            callback(reactor, Err(RpcError::Connection(error)));
        }
        if core.pool.has_waiters(reactor) {
            let can_open = {
                let mut open = core.open.lock();
                if *open < core.config.pool_size {
                    *open += 1;
                    true
                } else {
                    false
                }
            };
            if can_open {
                match Self::open_connection(core, reactor) {
                    Ok(new_token) => Self::release(core, reactor, new_token),
                    Err(e) => {
                        *core.open.lock() -= 1;
                        warn!(error = %e, "replacement connection failed; callers stay queued");
                    }
                }
            }
        }
    }
}

/// Per-connection client side: frame reassembly plus response routing.
struct ClientConn {
    core: Arc<ClientCore>,
    codec: FrameCodec,
}

impl ClientConn {
    fn new(core: Arc<ClientCore>) -> Self {
        Self {
            core,
            codec: FrameCodec::new(),
        }
    }
}

impl ConnectionHandler for ClientConn {
    fn on_read(&mut self, ctx: &mut ConnectionCtx<'_>, data: &[u8]) -> Result<(), ConnectionError> {
        self.codec.push(data);
        loop {
            match self.codec.next_frame() {
                Ok(Some(payload)) => {
                    let message = self
                        .core
                        .serializer
                        .load(&payload)
                        .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
                    match message {
                        Message::Response(response) => {
                            let token = ctx.token();
                            let callback = self.core.pending.lock().remove(&token);
                            match callback {
                                Some(callback) => {
                                    let core = self.core.clone();
                                    callback(ctx.reactor(), response.into_result());
                                    // The transport worked: this connection
                                    // goes back to the pool even when the
                                    // response carried a fault.
                                    ClientCore::release(&core, ctx.reactor(), token);
                                }
                                None => warn!("response with no in-flight request"),
                            }
                        }
                        Message::Request(_) => {
                            warn!("unexpected request frame on a client connection")
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(ConnectionError::Protocol(e.to_string())),
            }
        }
        Ok(())
    }

    fn on_close(&mut self, ctx: &mut ConnectionCtx<'_>, reason: Option<&ConnectionError>) {
        let token = ctx.token();
        let core = self.core.clone();
        ClientCore::connection_closed(&core, ctx.reactor(), token, reason);
    }
}
