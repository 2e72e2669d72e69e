//! End-to-end scenarios over real loopback sockets: one reactor thread per
//! client and server, frames on the wire, typed errors back.

use std::sync::mpsc;
use std::time::Duration;

use serde_json::json;
use spindle::prelude::*;
use spindle_testkit as testkit;

#[test]
fn sync_call_round_trips() {
    testkit::init_logging();
    let (_server, port) = testkit::start_echo_server();
    let client = testkit::loopback_client(port);

    let answer = client.call("echo.reply", vec![json!(42)]).unwrap();
    assert_eq!(answer, json!(42));
}

#[test]
fn async_call_delivers_through_the_callback() {
    testkit::init_logging();
    let (_server, port) = testkit::start_echo_server();
    let client = testkit::loopback_client(port);

    let (tx, rx) = mpsc::channel();
    client.call_with("echo.reply", vec![json!("payload")], move |result| {
        let _ = tx.send(result);
    });
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap(), json!("payload"));
}

#[test]
fn pool_bound_queues_rather_than_opening_extra_connections() {
    testkit::init_logging();
    let mut server = Server::bind(ServerConfig::tcp("127.0.0.1", 0)).unwrap();
    let (table, peak) = testkit::slow_doubler(Duration::from_millis(150));
    server.add_handler("slow", table);
    let port = server.local_addr().unwrap().port();

    let client = spindle::Client::new(
        spindle::ClientConfig::tcp("127.0.0.1", port).with_pool_size(1),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    for i in 1..=2i64 {
        let tx = tx.clone();
        client.call_with("slow.double", vec![json!(i)], move |result| {
            let _ = tx.send(result);
        });
    }

    let mut results: Vec<i64> = (0..2)
        .map(|_| {
            rx.recv_timeout(Duration::from_secs(5))
                .expect("call completed")
                .expect("call succeeded")
                .as_i64()
                .unwrap()
        })
        .collect();
    results.sort_unstable();
    assert_eq!(results, vec![2, 4]);

    // The second call waited for the pooled connection instead of opening
    // a second one, so the server never saw two requests in flight.
    assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(client.open_connections() <= 1);

    server.stop();
}

#[test]
fn connection_refused_raises_sync_and_delivers_async() {
    testkit::init_logging();
    let port = testkit::dead_port();
    let client = testkit::loopback_client(port);

    let err = client.call("echo.reply", vec![json!(1)]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);

    // The async path hands the same taxonomy kind to the callback as a
    // value — nothing is raised.
    let (tx, rx) = mpsc::channel();
    client.call_with("echo.reply", vec![json!(1)], move |result| {
        let _ = tx.send(result);
    });
    let delivered = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(delivered.unwrap_err().kind(), ErrorKind::Connection);
}

#[test]
fn unknown_handler_is_invalid_object() {
    testkit::init_logging();
    let (_server, port) = testkit::start_echo_server();
    let client = testkit::loopback_client(port);

    let err = client.call("ghost.foo", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidObject);
}

#[test]
fn allow_surface_blocks_restricted_and_unknown_methods_differently() {
    testkit::init_logging();
    let (_server, port) = testkit::start_echo_server();
    let client = testkit::loopback_client(port);

    // `reply` is exposed, `exec` exists but is restricted, `vanish` was
    // never part of the surface.
    assert!(client.call("echo.reply", vec![json!(1)]).is_ok());
    let err = client.call("echo.exec", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsafeMethod);
    let err = client.call("echo.vanish", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMethod);
}

#[test]
fn target_without_a_dot_is_invalid_object() {
    testkit::init_logging();
    let (_server, port) = testkit::start_echo_server();
    let client = testkit::loopback_client(port);

    let err = client.call("nodot", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidObject);
}

#[test]
fn token_mismatch_is_rejected_and_match_accepted() {
    testkit::init_logging();
    let server = Server::bind(
        ServerConfig::tcp("127.0.0.1", 0).with_token("sesame"),
    )
    .unwrap();
    server.add_handler("echo", testkit::echo_table());
    let port = server.local_addr().unwrap().port();

    let anonymous = testkit::loopback_client(port);
    let err = anonymous.call("echo.reply", vec![json!(1)]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidToken);

    let trusted = spindle::Client::new(
        spindle::ClientConfig::tcp("127.0.0.1", port).with_token("sesame"),
    )
    .unwrap();
    assert_eq!(trusted.call("echo.reply", vec![json!(1)]).unwrap(), json!(1));
}

#[test]
fn async_handler_method_completes_from_a_worker_thread() {
    testkit::init_logging();
    let server = Server::bind(ServerConfig::tcp("127.0.0.1", 0)).unwrap();
    let (table, _peak) = testkit::slow_doubler(Duration::from_millis(20));
    server.add_handler("slow", table);
    let port = server.local_addr().unwrap().port();

    assert_eq!(server.is_async("slow", "double"), Some(true));

    let client = testkit::loopback_client(port);
    let answer = client.call("slow.double", vec![json!(21)]).unwrap();
    assert_eq!(answer, json!(42));
}

#[test]
fn remote_exception_carries_the_class_name() {
    testkit::init_logging();
    let server = Server::bind(ServerConfig::tcp("127.0.0.1", 0)).unwrap();
    server.add_handler("faulty", testkit::faulty_table());
    let port = server.local_addr().unwrap().port();
    let client = testkit::loopback_client(port);

    let err = client.call("faulty.explode", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
    match err {
        RpcError::Remote(fault) => {
            assert_eq!(fault.class, "ArgumentError");
            assert_eq!(fault.message, "refusing on principle");
        }
        other => panic!("expected remote fault, got {other:?}"),
    }
}

#[test]
fn large_payloads_cross_in_pieces_and_arrive_whole() {
    testkit::init_logging();
    let (_server, port) = testkit::start_echo_server();
    let client = testkit::loopback_client(port);

    // Larger than the per-pass I/O block: the frame spans several reads and
    // writes and must reassemble exactly.
    let blob: String = "spindle".chars().cycle().take(96 * 1024).collect();
    let payload = json!(blob);
    let answer = client.call("echo.reply", vec![payload.clone()]).unwrap();
    assert_eq!(answer, payload);
}

#[test]
fn calls_reuse_the_pooled_connection() {
    testkit::init_logging();
    let (_server, port) = testkit::start_echo_server();
    let client = testkit::loopback_client(port);

    for i in 0..5i64 {
        assert_eq!(client.call("echo.reply", vec![json!(i)]).unwrap(), json!(i));
    }
    assert_eq!(client.open_connections(), 1);
}

#[test]
fn handlers_can_be_registered_after_start_and_cleared() {
    testkit::init_logging();
    let (server, port) = testkit::start_echo_server();
    let client = testkit::loopback_client(port);

    server.add_handler("adder", testkit::adder_table());
    assert_eq!(
        client.call("adder.add", vec![json!(2), json!(3)]).unwrap(),
        json!(5)
    );

    server.clear_handlers();
    let err = client.call("adder.add", vec![json!(2), json!(3)]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidObject);
}

#[cfg(unix)]
#[test]
fn unix_socket_transport_round_trips() {
    testkit::init_logging();
    let path = std::env::temp_dir().join(format!(
        "spindle-e2e-{}-{:?}.sock",
        std::process::id(),
        std::thread::current().id()
    ));
    let _ = std::fs::remove_file(&path);

    let server = Server::bind(ServerConfig::unix(&path)).unwrap();
    server.add_handler("echo", testkit::echo_table());

    let client = spindle::Client::new(spindle::ClientConfig::unix(&path)).unwrap();
    assert_eq!(
        client.call("echo.reply", vec![json!("local")]).unwrap(),
        json!("local")
    );
}
