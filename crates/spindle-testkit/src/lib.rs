//! spindle-testkit: shared fixtures for exercising spindle end to end.
//!
//! Provides the standard test services (echo, adder, a slow async doubler),
//! port reservation, and small polling helpers, so integration suites across
//! crates exercise the same surface the same way.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spindle::{Client, ClientConfig, HandlerError, MethodTable, Server, ServerConfig, Value};

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Reserve a TCP port that is *not* being listened on: bind to :0, note the
/// port, and drop the listener. Useful for connection-refused scenarios.
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind :0");
    listener.local_addr().expect("local addr").port()
}

/// The canonical echo service: `reply` returns its first argument, and
/// `exec` exists on the object but is not remotely callable.
pub fn echo_table() -> MethodTable {
    MethodTable::new()
        .sync("reply", |args| {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .restrict("exec")
}

/// Simple arithmetic service.
pub fn adder_table() -> MethodTable {
    MethodTable::new().sync("add", |args| {
        let a = args
            .first()
            .and_then(Value::as_i64)
            .ok_or("add: first argument must be an integer")?;
        let b = args
            .get(1)
            .and_then(Value::as_i64)
            .ok_or("add: second argument must be an integer")?;
        Ok(Value::from(a + b))
    })
}

/// A service that always fails, for remote-exception scenarios.
pub fn faulty_table() -> MethodTable {
    MethodTable::new().sync("explode", |_args| {
        Err(HandlerError::new("ArgumentError", "refusing on principle"))
    })
}

/// An async doubler that answers `delay` later from a worker thread, plus a
/// counter exposing how many requests were in flight at once.
pub fn slow_doubler(delay: Duration) -> (MethodTable, Arc<AtomicUsize>) {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let observed = peak.clone();
    let gauge = in_flight.clone();
    let table = MethodTable::new().asynchronous("double", move |args, responder| {
        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        observed.fetch_max(now, Ordering::SeqCst);
        let value = args.first().and_then(Value::as_i64).unwrap_or(0);
        let gauge = gauge.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            gauge.fetch_sub(1, Ordering::SeqCst);
            responder.send(Ok(Value::from(value * 2)));
        });
    });
    (table, peak)
}

/// Bind a server on a loopback ephemeral port with the echo service
/// registered, returning it with the actual port.
pub fn start_echo_server() -> (Server, u16) {
    let server = Server::bind(ServerConfig::tcp("127.0.0.1", 0)).expect("bind echo server");
    server.add_handler("echo", echo_table());
    let port = server.local_addr().expect("bound addr").port();
    (server, port)
}

/// A client pointed at a loopback port.
pub fn loopback_client(port: u16) -> Client {
    Client::new(ClientConfig::tcp("127.0.0.1", port)).expect("client")
}

/// Poll `pred` until it holds or `timeout` elapses. Returns whether it held.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}
