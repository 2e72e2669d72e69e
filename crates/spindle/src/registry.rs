//! Handler registration: explicit method tables.
//!
//! A handler is a named [`MethodTable`] built when the embedding application
//! registers it. The table is the allow-surface: only methods entered into
//! it are remotely callable, and whether a method completes synchronously or
//! through a deferred [`Responder`] is declared structurally at registration
//! rather than discovered by reflection. Names marked
//! [`restrict`](MethodTable::restrict)ed exist on the underlying object but
//! are never remotely callable; calling one is an `UnsafeMethod` fault,
//! while a name the table has never seen is `InvalidMethod`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use spindle_core::{
    frame, Handle, Message, RemoteFault, Response, RpcError, Serializer, Token, Value,
};

/// Failure raised by a handler method, reified into a `RemoteException`
/// fault for the caller.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Error type name reported to the remote caller.
    pub class: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    pub(crate) fn into_fault(self) -> RemoteFault {
        RemoteFault {
            class: self.class,
            message: self.message,
            backtrace: Vec::new(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new("HandlerError", message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new("HandlerError", message)
    }
}

/// Completion callback handed to an async handler method. Sending consumes
/// the responder, so a reply goes out at most once; the response travels
/// with the `asynchronous` flag set since the dispatch path did not send it.
pub struct Responder {
    handle: Handle,
    token: Token,
    serializer: Arc<dyn Serializer>,
}

impl Responder {
    pub(crate) fn new(handle: Handle, token: Token, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            handle,
            token,
            serializer,
        }
    }

    /// Deliver the method's outcome to the caller. Safe from any thread.
    pub fn send(self, result: Result<Value, HandlerError>) {
        let response = match result {
            Ok(value) => Response::success(value, true),
            Err(e) => Response::failure(&RpcError::Remote(e.into_fault()), true),
        };
        let serializer = self.serializer;
        let token = self.token;
        self.handle.schedule(move |reactor| {
            match serializer.dump(&Message::Response(response)) {
                Ok(bytes) => reactor.write(token, &frame(&bytes)),
                Err(e) => warn!(error = %e, "async response could not be serialized"),
            }
        });
    }
}

type SyncFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, HandlerError> + Send + Sync>;
type AsyncFn = Arc<dyn Fn(Vec<Value>, Responder) + Send + Sync>;

/// One remotely callable method.
#[derive(Clone)]
pub enum Method {
    /// Returns its result directly; the dispatch path sends the response.
    Sync(SyncFn),
    /// Completes through a [`Responder`]; the handler sends the response.
    Async(AsyncFn),
}

impl Method {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Method::Sync"),
            Self::Async(_) => f.write_str("Method::Async"),
        }
    }
}

/// The allow-surface of one registered handler.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, Method>,
    restricted: HashSet<String>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a synchronous method.
    pub fn sync<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Method::Sync(Arc::new(f)));
        self
    }

    /// Expose a method that completes through a deferred [`Responder`].
    pub fn asynchronous<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Method::Async(Arc::new(f)));
        self
    }

    /// Mark a name as present on the handler object but never remotely
    /// callable. Requests for it fail with `UnsafeMethod` instead of
    /// `InvalidMethod`.
    pub fn restrict(mut self, name: impl Into<String>) -> Self {
        self.restricted.insert(name.into());
        self
    }

    /// Whether `name` completes asynchronously; `None` when it is not on
    /// the exposed surface. Pure lookup: stable across repeated queries.
    pub fn is_async(&self, name: &str) -> Option<bool> {
        self.methods.get(name).map(Method::is_async)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    fn resolve(&self, handler: &str, method: &str) -> Result<Method, RpcError> {
        if self.restricted.contains(method) {
            return Err(RpcError::UnsafeMethod(format!("{handler}.{method}")));
        }
        match self.methods.get(method) {
            Some(m) => Ok(m.clone()),
            None => Err(RpcError::InvalidMethod(format!("{handler}.{method}"))),
        }
    }
}

/// All handlers a server exposes, keyed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, MethodTable>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, table: MethodTable) {
        self.handlers.insert(name.into(), table);
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolution order: unknown handler name → `InvalidObject`; restricted
    /// method → `UnsafeMethod`; unknown method → `InvalidMethod`.
    pub fn resolve(&self, handler: &str, method: &str) -> Result<Method, RpcError> {
        match self.handlers.get(handler) {
            Some(table) => table.resolve(handler, method),
            None => Err(RpcError::InvalidObject(handler.to_string())),
        }
    }

    pub fn is_async(&self, handler: &str, method: &str) -> Option<bool> {
        self.handlers.get(handler)?.is_async(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spindle_core::ErrorKind;

    fn sample() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.add(
            "echo",
            MethodTable::new()
                .sync("reply", |args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
                .asynchronous("reply_later", |_args, responder| {
                    responder.send(Ok(json!("later")))
                })
                .restrict("exec"),
        );
        registry
    }

    #[test]
    fn resolution_order_matches_the_taxonomy() {
        let registry = sample();
        assert!(registry.resolve("echo", "reply").is_ok());
        assert_eq!(
            registry.resolve("ghost", "reply").unwrap_err().kind(),
            ErrorKind::InvalidObject
        );
        assert_eq!(
            registry.resolve("echo", "exec").unwrap_err().kind(),
            ErrorKind::UnsafeMethod
        );
        assert_eq!(
            registry.resolve("echo", "missing").unwrap_err().kind(),
            ErrorKind::InvalidMethod
        );
    }

    #[test]
    fn async_detection_is_pure_and_stable() {
        let registry = sample();
        for _ in 0..3 {
            assert_eq!(registry.is_async("echo", "reply"), Some(false));
            assert_eq!(registry.is_async("echo", "reply_later"), Some(true));
            assert_eq!(registry.is_async("echo", "missing"), None);
            assert_eq!(registry.is_async("ghost", "reply"), None);
        }
    }

    #[test]
    fn clear_resets_the_surface() {
        let mut registry = sample();
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(
            registry.resolve("echo", "reply").unwrap_err().kind(),
            ErrorKind::InvalidObject
        );
    }
}
