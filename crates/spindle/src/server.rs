//! The RPC server: a reactor thread, a listener, and request dispatch.
//!
//! Each accepted connection gets its own frame codec and dispatches
//! requests against the shared [`HandlerRegistry`]. Synchronous methods
//! reply from the dispatch path; asynchronous methods receive a single-use
//! [`Responder`] and reply whenever their completion callback fires.
//! Business errors and panics inside handler methods are reified into
//! `RemoteException` faults — they never travel up into the reactor loop.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use spindle_core::{
    frame, Connection, ConnectionCtx, ConnectionError, ConnectionHandler, Endpoint, FrameCodec,
    Handle, JsonSerializer, Message, Reactor, RemoteFault, Request, Response, RpcError,
    Serializer,
};
#[cfg(feature = "tls")]
use spindle_core::TlsConfig;

use crate::registry::{HandlerRegistry, Method, MethodTable, Responder};

/// Grace period between a shutdown request and the reactor stop, leaving
/// room for the shutdown acknowledgment to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Where and how a server listens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    /// Bearer token every request must carry when set.
    pub token: Option<String>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsConfig>,
}

impl ServerConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::tcp(host, port),
            token: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::unix(path.into()),
            token: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
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

struct ServerShared {
    registry: Mutex<HandlerRegistry>,
    token: Option<String>,
}

/// A running RPC server. Dropping it stops the reactor thread.
pub struct Server {
    shared: Arc<ServerShared>,
    handle: Handle,
    local_addr: Option<SocketAddr>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listener and start the server's reactor thread. Binding
    /// happens on the calling thread so configuration errors fail fast and
    /// the bound address (e.g. with port 0) is known immediately.
    pub fn bind(config: ServerConfig) -> Result<Self, RpcError> {
        Self::bind_with(config, Arc::new(JsonSerializer))
    }

    /// [`bind`](Self::bind) with a custom message serializer.
    pub fn bind_with(
        config: ServerConfig,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, RpcError> {
        let shared = Arc::new(ServerShared {
            registry: Mutex::new(HandlerRegistry::new()),
            token: config.token.clone(),
        });

        let factory = {
            let shared = shared.clone();
            let serializer = serializer.clone();
            Box::new(move |peer: &Endpoint| {
                debug!(%peer, "accepted");
                Box::new(ServerConn::new(shared.clone(), serializer.clone()))
                    as Box<dyn ConnectionHandler>
            })
        };

        let listener = bind_listener(&config, factory).map_err(RpcError::Connection)?;

        let local_addr = listener.local_addr();
        let (handle, thread) = Reactor::spawn("spindle-server")
            .map_err(|e| RpcError::Connection(ConnectionError::Io(e)))?;

        handle.schedule(move |r| {
            if let Err(e) = r.attach(listener) {
                error!(error = %e, "listener attach failed");
                r.stop();
            }
        });

        Ok(Self {
            shared,
            handle,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Actual bound address (TCP listeners; resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Register a handler under `name`. Replaces any previous table with
    /// that name; takes effect for the next dispatched request.
    pub fn add_handler(&self, name: impl Into<String>, table: MethodTable) {
        self.shared.registry.lock().add(name, table);
    }

    /// Drop every registered handler.
    pub fn clear_handlers(&self) {
        self.shared.registry.lock().clear();
    }

    /// Whether `handler.method` completes asynchronously; `None` when it is
    /// not exposed.
    pub fn is_async(&self, handler: &str, method: &str) -> Option<bool> {
        self.shared.registry.lock().is_async(handler, method)
    }

    /// Stop the reactor after a short grace delay, leaving room for a
    /// shutdown acknowledgment already queued on a connection to flush.
    pub fn shutdown(&mut self) {
        self.handle.schedule(|r| {
            let _ = r.delay(SHUTDOWN_GRACE, |r| r.stop());
        });
        self.join();
    }

    /// Stop immediately, without the grace delay.
    pub fn stop(&mut self) {
        self.handle.stop();
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.stop();
        self.join();
    }
}

fn bind_listener(
    config: &ServerConfig,
    factory: spindle_core::ServerFactory,
) -> Result<Connection, ConnectionError> {
    match &config.endpoint {
        Endpoint::Tcp { host, port } => {
            #[cfg(feature = "tls")]
            if let Some(tls) = &config.tls {
                return Connection::listen_tls(host, *port, tls, factory);
            }
            Connection::listen_tcp(host, *port, factory)
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Connection::listen_unix(path, factory),
    }
}

/// Per-connection server side: frame reassembly plus dispatch.
struct ServerConn {
    shared: Arc<ServerShared>,
    serializer: Arc<dyn Serializer>,
    codec: FrameCodec,
}

impl ServerConn {
    fn new(shared: Arc<ServerShared>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            shared,
            serializer,
            codec: FrameCodec::new(),
        }
    }

    fn respond(&self, ctx: &mut ConnectionCtx<'_>, response: Response) {
        match self.serializer.dump(&Message::Response(response)) {
            Ok(bytes) => ctx.write(&frame(&bytes)),
            Err(e) => warn!(error = %e, "response could not be serialized"),
        }
    }

    fn dispatch(&mut self, ctx: &mut ConnectionCtx<'_>, request: Request) {
        if self.shared.token.is_some() && request.token != self.shared.token {
            debug!(method = %request.method, "token mismatch");
            self.respond(ctx, Response::failure(&RpcError::InvalidToken, false));
            return;
        }

        let Some((handler, method_name)) = request.target() else {
            self.respond(
                ctx,
                Response::failure(&RpcError::InvalidObject(request.method.clone()), false),
            );
            return;
        };

        let method = self.shared.registry.lock().resolve(handler, method_name);
        match method {
            Err(e) => {
                debug!(method = %request.method, kind = %e.kind(), "dispatch refused");
                self.respond(ctx, Response::failure(&e, false));
            }
            Ok(Method::Sync(f)) => {
                debug!(method = %request.method, "dispatch sync");
                let result = catch_unwind(AssertUnwindSafe(|| f(request.args)));
                let response = match result {
                    Ok(Ok(value)) => Response::success(value, false),
                    Ok(Err(e)) => Response::failure(&RpcError::Remote(e.into_fault()), false),
                    Err(payload) => {
                        let fault = RemoteFault {
                            class: "Panic".into(),
                            message: panic_message(payload),
                            backtrace: Vec::new(),
                        };
                        Response::failure(&RpcError::Remote(fault), false)
                    }
                };
                self.respond(ctx, response);
            }
            Ok(Method::Async(f)) => {
                debug!(method = %request.method, "dispatch async");
                let responder =
                    Responder::new(ctx.handle(), ctx.token(), self.serializer.clone());
                // The handler's own completion callback transmits the
                // response; the dispatch path only reports a panic.
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(request.args, responder)))
                {
                    let fault = RemoteFault {
                        class: "Panic".into(),
                        message: panic_message(payload),
                        backtrace: Vec::new(),
                    };
                    self.respond(ctx, Response::failure(&RpcError::Remote(fault), true));
                }
            }
        }
    }
}

impl ConnectionHandler for ServerConn {
    fn on_read(&mut self, ctx: &mut ConnectionCtx<'_>, data: &[u8]) -> Result<(), ConnectionError> {
        self.codec.push(data);
        loop {
            match self.codec.next_frame() {
                Ok(Some(payload)) => {
                    let message = self
                        .serializer
                        .load(&payload)
                        .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
                    match message {
                        Message::Request(request) => self.dispatch(ctx, request),
                        Message::Response(_) => {
                            warn!("unexpected response frame on a server connection")
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(ConnectionError::Protocol(e.to_string())),
            }
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
