//! spindle: RPC over a single-threaded readiness reactor.
//!
//! # Quick start
//!
//! ```ignore
//! use spindle::prelude::*;
//! use serde_json::json;
//!
//! // Server: expose a handler as an explicit method table.
//! let mut server = Server::bind(ServerConfig::tcp("127.0.0.1", 0))?;
//! server.add_handler(
//!     "echo",
//!     MethodTable::new().sync("reply", |args| {
//!         Ok(args.into_iter().next().unwrap_or(Value::Null))
//!     }),
//! );
//! let port = server.local_addr().unwrap().port();
//!
//! // Client: synchronous call.
//! let client = Client::new(ClientConfig::tcp("127.0.0.1", port))?;
//! let answer = client.call("echo.reply", vec![json!(42)])?;
//! assert_eq!(answer, json!(42));
//!
//! // Or asynchronous: the callback receives the result — or the typed
//! // error — as a value.
//! client.call_with("echo.reply", vec![json!(1)], |result| {
//!     match result {
//!         Ok(value) => println!("got {value}"),
//!         Err(e) => eprintln!("{}: {e}", e.kind()),
//!     }
//! });
//! ```
//!
//! # Error handling
//!
//! Every failure is an [`RpcError`] and [`RpcError::kind`] names its
//! taxonomy kind, so callers pattern-match instead of downcasting:
//!
//! ```ignore
//! match client.call("store.put", args) {
//!     Ok(value) => { /* ... */ }
//!     Err(e) if e.kind() == ErrorKind::Connection => { /* retry elsewhere */ }
//!     Err(e) => return Err(e),
//! }
//! ```
//!
//! # Async handler methods
//!
//! A method registered with [`MethodTable::asynchronous`] receives a
//! single-use [`Responder`] and replies whenever its work completes — from
//! any thread. The dispatch path sends nothing for it.

#![forbid(unsafe_op_in_unsafe_fn)]

mod client;
mod proxy;
mod registry;
mod server;

pub use client::{Client, ClientConfig};
pub use proxy::Proxy;
pub use registry::{HandlerError, HandlerRegistry, Method, MethodTable, Responder};
pub use server::{Server, ServerConfig};

// Re-export the core so embedders need only one dependency.
pub use spindle_core as core;
pub use spindle_core::{
    ConnectionError, Endpoint, ErrorKind, FrameCodec, Handle, JsonSerializer, Message, Reactor,
    RemoteFault, Request, Response, RpcError, Serializer, Token, Value,
};
#[cfg(feature = "tls")]
pub use spindle_core::TlsConfig;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        Client, ClientConfig, Endpoint, ErrorKind, HandlerError, MethodTable, Proxy, Responder,
        RpcError, Server, ServerConfig, Value,
    };
    #[cfg(feature = "tls")]
    pub use crate::TlsConfig;
}
