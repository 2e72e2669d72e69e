//! spindle-core: the readiness loop and wire protocol under spindle RPC.
//!
//! This crate defines:
//! - The single-threaded event loop ([`Reactor`], [`Handle`], [`ReactorFault`])
//! - Schedulable work ([`TaskId`], [`TaskKind`])
//! - The per-socket state machine ([`Connection`], [`ConnectionHandler`], [`Role`], [`Endpoint`])
//! - Bounded-concurrency iteration ([`Iter`], [`Next`], [`Emit`])
//! - The cross-thread queue ([`CrossQueue`])
//! - Length-prefixed framing ([`FrameCodec`]) and messages ([`Message`], [`Request`], [`Response`])
//! - The error taxonomy ([`RpcError`], [`ConnectionError`], [`ErrorKind`])
//!
//! # Threading model
//!
//! One reactor instance is one dedicated thread running a cooperative loop.
//! Several reactors may coexist in a process (e.g. one per RPC client or
//! server), each with its own thread. Everything a reactor owns —
//! connections, buffers, tasks — is touched only on its thread; foreign
//! threads go through [`Handle::schedule`] or [`CrossQueue`].

#![forbid(unsafe_op_in_unsafe_fn)]

mod connection;
mod error;
mod iter;
mod proto;
mod queue;
mod reactor;
mod task;
#[cfg(feature = "tls")]
mod tls;
mod wire;

// Connections are keyed by poller token; re-export it so layers above
// don't need their own mio dependency.
pub use mio::Token;

pub use connection::*;
pub use error::*;
pub use iter::*;
pub use proto::*;
pub use queue::*;
pub use reactor::*;
pub use task::{TaskId, TaskKind};
#[cfg(feature = "tls")]
pub use tls::TlsConfig;
pub use wire::*;
